#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use retreat_booking::config::BookingPolicy;
use retreat_booking::database::booking_repository::BookingRepository;
use retreat_booking::database::leases::LocalLeaseLock;
use retreat_booking::database::memory::{MemoryBookingStore, MemoryRetreatCatalog};
use retreat_booking::errors::Result;
use retreat_booking::mocks::{MockPaymentGateway, RecordingNotifier};
use retreat_booking::models::booking::{
    Booking, BookingFilter, BookingId, BookingState, BookingStats, BookingStatus, CreateBookingRequest, Participant,
};
use retreat_booking::models::retreat::{Retreat, RetreatId, RetreatSession};
use retreat_booking::services::booking_service::BookingService;
use retreat_booking::services::reconciliation_service::ReconciliationService;

pub struct Harness {
    pub service: BookingService,
    pub reconciliation: ReconciliationService,
    pub store: Arc<MemoryBookingStore>,
    pub catalog: Arc<MemoryRetreatCatalog>,
    pub gateway: Arc<MockPaymentGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub retreat_id: RetreatId,
    pub session_start: DateTime<Utc>,
    pub session_end: DateTime<Utc>,
}

/// "Alpine Retreat", 2025-06-01..2025-06-05.
pub async fn alpine_retreat(capacity: u32, price: i64) -> Harness {
    let session_start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
    let session_end = Utc.with_ymd_and_hms(2025, 6, 5, 0, 0, 0).unwrap();
    let retreat_id = RetreatId::new();

    let catalog = Arc::new(MemoryRetreatCatalog::new());
    catalog
        .insert(Retreat {
            id: retreat_id,
            title: "Alpine Retreat".to_string(),
            location: Some("Chamonix".to_string()),
            sessions: vec![RetreatSession {
                start: session_start,
                end: session_end,
                capacity,
                price,
            }],
        })
        .await;

    let store = Arc::new(MemoryBookingStore::new());
    let gateway = Arc::new(MockPaymentGateway::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let policy = BookingPolicy {
        seat_lock_wait: Duration::from_secs(10),
        ..BookingPolicy::default()
    };

    let service = BookingService::new(
        store.clone(),
        catalog.clone(),
        gateway.clone(),
        notifier.clone(),
        Arc::new(LocalLeaseLock::new()),
        policy.clone(),
    );
    let reconciliation = ReconciliationService::new(
        store.clone(),
        gateway.clone(),
        notifier.clone(),
        policy,
        chrono::Duration::days(5),
    );

    Harness {
        service,
        reconciliation,
        store,
        catalog,
        gateway,
        notifier,
        retreat_id,
        session_start,
        session_end,
    }
}

impl Harness {
    pub fn request(&self, seats: u32) -> CreateBookingRequest {
        CreateBookingRequest {
            retreat_id: self.retreat_id.to_hex(),
            session_start: self.session_start,
            session_end: self.session_end,
            seat_count: seats,
            participants: vec![Participant {
                first_name: "Ada".to_string(),
                last_name: "Lovelace".to_string(),
                email: "ada@example.com".to_string(),
            }],
            billing_address: None,
            notes: None,
        }
    }

    pub async fn available(&self) -> u32 {
        self.service
            .available_seats(&self.retreat_id.to_hex(), self.session_start)
            .await
            .unwrap()
    }
}

/// Polls until the detached confirmation task has reported, or gives up.
pub async fn wait_for_confirmations(notifier: &RecordingNotifier, expected: usize) -> usize {
    for _ in 0..100 {
        let sent = notifier.confirmations().len();
        if sent >= expected {
            return sent;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    notifier.confirmations().len()
}

/// Wraps the memory store to reproduce what another instance could do between
/// two of this instance's storage calls.
pub struct InterferingStore {
    pub inner: Arc<MemoryBookingStore>,
    /// Slows every seat count down by this much.
    pub count_delay: Option<Duration>,
    /// Confirms the target row just before the first cancellation write lands.
    pub confirm_before_cancel: AtomicBool,
}

impl InterferingStore {
    pub fn new(inner: Arc<MemoryBookingStore>) -> Self {
        InterferingStore {
            inner,
            count_delay: None,
            confirm_before_cancel: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BookingRepository for InterferingStore {
    async fn insert(&self, booking: &Booking) -> Result<()> {
        self.inner.insert(booking).await
    }

    async fn find_by_id(&self, id: BookingId) -> Result<Option<Booking>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_payment_intent(&self, payment_intent_id: &str) -> Result<Option<Booking>> {
        self.inner.find_by_payment_intent(payment_intent_id).await
    }

    async fn list(&self, filter: &BookingFilter) -> Result<Vec<Booking>> {
        self.inner.list(filter).await
    }

    async fn reserved_seats(&self, retreat_id: RetreatId, session_start: DateTime<Utc>) -> Result<u32> {
        if let Some(delay) = self.count_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.reserved_seats(retreat_id, session_start).await
    }

    async fn replace_if_state(&self, booking: &Booking, expected: BookingStatus) -> Result<bool> {
        if booking.status() == BookingStatus::Cancelled && self.confirm_before_cancel.swap(false, Ordering::SeqCst) {
            if let Some(mut stored) = self.inner.find_by_id(booking.id).await? {
                stored.state = BookingState::ConfirmedPaid;
                stored.payment_intent_id = Some("pi_raced".to_string());
                self.inner.replace_if_state(&stored, BookingStatus::Pending).await?;
            }
        }
        self.inner.replace_if_state(booking, expected).await
    }

    async fn find_expired_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<Booking>> {
        self.inner.find_expired_pending(cutoff).await
    }

    async fn delete_if_expired(&self, id: BookingId, cutoff: DateTime<Utc>) -> Result<bool> {
        self.inner.delete_if_expired(id, cutoff).await
    }

    async fn find_finished_confirmed(&self, now: DateTime<Utc>) -> Result<Vec<Booking>> {
        self.inner.find_finished_confirmed(now).await
    }

    async fn stats(&self) -> Result<BookingStats> {
        self.inner.stats().await
    }
}

impl Harness {
    /// A booking service over `store` sharing this harness's catalogue,
    /// gateway and notifier.
    pub fn service_over(&self, store: Arc<dyn BookingRepository>, policy: BookingPolicy) -> BookingService {
        BookingService::new(
            store,
            self.catalog.clone(),
            self.gateway.clone(),
            self.notifier.clone(),
            Arc::new(LocalLeaseLock::new()),
            policy,
        )
    }
}
