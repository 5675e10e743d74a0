//! Storage and lease paths against real MongoDB and Redis.
//!
//! # Requirements
//!
//! Docker must be running. The tests start throwaway containers through
//! testcontainers and are ignored by default:
//!
//! ```text
//! cargo test --test mongo_store -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};
use mongodb::{Client, Database};
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::mongo::Mongo;
use testcontainers_modules::redis::{Redis, REDIS_PORT};

use retreat_booking::config::BookingPolicy;
use retreat_booking::database::booking_repository::{BookingRepository, MongoBookingRepository};
use retreat_booking::database::connection::ensure_indexes;
use retreat_booking::database::leases::{LeaseLock, MongoLeaseLock, RedisLeaseLock};
use retreat_booking::database::retreat_catalog::{MongoRetreatCatalog, RETREATS_COLLECTION};
use retreat_booking::errors::AppError;
use retreat_booking::mocks::{MockPaymentGateway, RecordingNotifier};
use retreat_booking::models::booking::{
    Booking, BookingId, BookingState, BookingStatus, CreateBookingRequest, PaymentStatus,
};
use retreat_booking::models::retreat::{Retreat, RetreatId, RetreatSession};
use retreat_booking::services::booking_service::BookingService;
use retreat_booking::services::reconciliation_service::ReconciliationService;

const MONGO_PORT: u16 = 27017;

/// Starts MongoDB and returns the container (keep it alive) and an indexed database.
async fn mongo() -> (ContainerAsync<Mongo>, Database) {
    let container = Mongo::default()
        .start()
        .await
        .expect("Failed to start mongo container");
    let port = container
        .get_host_port_ipv4(MONGO_PORT)
        .await
        .expect("Failed to get mongo port");

    let client = Client::with_uri_str(format!("mongodb://127.0.0.1:{port}"))
        .await
        .expect("Failed to create mongo client");
    let db = client.database("retreat_booking_test");
    ensure_indexes(&db).await.expect("Failed to create indexes");
    (container, db)
}

struct Stack {
    service: BookingService,
    reconciliation: ReconciliationService,
    bookings: Arc<MongoBookingRepository>,
    retreat_id: RetreatId,
    session: RetreatSession,
}

/// Booking and reconciliation services over the Mongo repository, catalogue
/// and lease lock, with one retreat session of `capacity` seats.
async fn mongo_stack(db: &Database, capacity: u32) -> Stack {
    let session = RetreatSession {
        start: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2025, 6, 5, 0, 0, 0).unwrap(),
        capacity,
        price: 500,
    };
    let retreat = Retreat {
        id: RetreatId::new(),
        title: "Alpine Retreat".to_string(),
        location: Some("Chamonix".to_string()),
        sessions: vec![session.clone()],
    };
    db.collection::<Retreat>(RETREATS_COLLECTION)
        .insert_one(&retreat)
        .await
        .expect("Failed to insert retreat");

    let bookings = Arc::new(MongoBookingRepository::new(db));
    let gateway = Arc::new(MockPaymentGateway::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let policy = BookingPolicy {
        seat_lock_wait: StdDuration::from_secs(20),
        ..BookingPolicy::default()
    };

    let service = BookingService::new(
        bookings.clone(),
        Arc::new(MongoRetreatCatalog::new(db)),
        gateway.clone(),
        notifier.clone(),
        Arc::new(MongoLeaseLock::new(db)),
        policy.clone(),
    );
    let reconciliation = ReconciliationService::new(bookings.clone(), gateway, notifier, policy, Duration::days(5));

    Stack {
        service,
        reconciliation,
        bookings,
        retreat_id: retreat.id,
        session,
    }
}

impl Stack {
    fn request(&self, seats: u32) -> CreateBookingRequest {
        CreateBookingRequest {
            retreat_id: self.retreat_id.to_hex(),
            session_start: self.session.start,
            session_end: self.session.end,
            seat_count: seats,
            participants: Vec::new(),
            billing_address: None,
            notes: None,
        }
    }
}

fn booking(retreat_id: RetreatId, seats: u32, price: i64, state: BookingState) -> Booking {
    let now = Utc::now();
    Booking {
        id: BookingId::new(),
        user_id: None,
        retreat_id,
        session_start: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        session_end: Utc.with_ymd_and_hms(2025, 6, 5, 0, 0, 0).unwrap(),
        seat_count: seats,
        total_price: price,
        currency: "eur".to_string(),
        state,
        payment_intent_id: None,
        participants: Vec::new(),
        billing_address: None,
        notes: None,
        cancellation_reason: None,
        cancelled_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Docker"]
async fn concurrent_buyers_never_oversell_against_mongo() {
    let (_container, db) = mongo().await;
    let stack = mongo_stack(&db, 5).await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let service = stack.service.clone();
        let request = stack.request(1);
        tasks.push(tokio::spawn(async move {
            service.create_booking(Some(format!("buyer-{}", i)), request).await
        }));
    }

    let mut created = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => created += 1,
            Err(AppError::InsufficientSeats { .. }) => refused += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(created, 5);
    assert_eq!(refused, 15);
    assert_eq!(
        stack.bookings.reserved_seats(stack.retreat_id, stack.session.start).await.unwrap(),
        5
    );
    assert_eq!(
        stack
            .service
            .available_seats(&stack.retreat_id.to_hex(), stack.session.start)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn cleanup_purges_each_expired_booking_once_against_mongo() {
    let (_container, db) = mongo().await;
    let stack = mongo_stack(&db, 10).await;

    let stale = stack.service.create_booking(None, stack.request(2)).await.unwrap();
    let confirmed = stack.service.create_booking(None, stack.request(1)).await.unwrap();
    stack.service.confirm_booking(&confirmed.id.to_hex(), "pi_ok").await.unwrap();

    let later = Utc::now() + Duration::minutes(20);
    let first = stack.reconciliation.cleanup_expired_bookings_at(later).await.unwrap();
    assert_eq!(first.examined, 1);
    assert_eq!(first.cleaned, 1);

    let second = stack.reconciliation.cleanup_expired_bookings_at(later).await.unwrap();
    assert_eq!(second.examined, 0);
    assert_eq!(second.cleaned, 0);

    assert!(stack.bookings.find_by_id(stale.id).await.unwrap().is_none());
    assert_eq!(
        stack.bookings.find_by_id(confirmed.id).await.unwrap().unwrap().status(),
        BookingStatus::Confirmed
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn delete_only_removes_rows_still_pending_and_expired() {
    let (_container, db) = mongo().await;
    let repo = MongoBookingRepository::new(&db);
    let retreat_id = RetreatId::new();

    let pending = booking(retreat_id, 1, 500, BookingState::PendingUnpaid);
    let paid = booking(retreat_id, 1, 500, BookingState::ConfirmedPaid);
    repo.insert(&pending).await.unwrap();
    repo.insert(&paid).await.unwrap();

    let before_creation = pending.created_at - Duration::minutes(1);
    assert!(!repo.delete_if_expired(pending.id, before_creation).await.unwrap());

    let cutoff = Utc::now() + Duration::minutes(1);
    assert_eq!(repo.find_expired_pending(cutoff).await.unwrap().len(), 1);
    assert!(!repo.delete_if_expired(paid.id, cutoff).await.unwrap());
    assert!(repo.delete_if_expired(pending.id, cutoff).await.unwrap());
    assert!(!repo.delete_if_expired(pending.id, cutoff).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn replace_only_lands_on_the_expected_state() {
    let (_container, db) = mongo().await;
    let repo = MongoBookingRepository::new(&db);
    let stored = booking(RetreatId::new(), 2, 1000, BookingState::PendingUnpaid);
    repo.insert(&stored).await.unwrap();

    let mut confirmed = stored.clone();
    confirmed.state = BookingState::ConfirmedPaid;
    confirmed.payment_intent_id = Some("pi_1".to_string());

    assert!(!repo.replace_if_state(&confirmed, BookingStatus::Confirmed).await.unwrap());
    assert!(repo.replace_if_state(&confirmed, BookingStatus::Pending).await.unwrap());
    assert!(!repo.replace_if_state(&confirmed, BookingStatus::Pending).await.unwrap());

    let reread = repo.find_by_payment_intent("pi_1").await.unwrap().unwrap();
    assert_eq!(reread.id, confirmed.id);
    assert_eq!(reread.state, BookingState::ConfirmedPaid);
    assert_eq!(reread.seat_count, 2);

    let mut missing = confirmed.clone();
    missing.id = BookingId::new();
    assert!(!repo.replace_if_state(&missing, BookingStatus::Confirmed).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn seat_sum_and_stats_group_by_state() {
    let (_container, db) = mongo().await;
    let repo = MongoBookingRepository::new(&db);
    let retreat_id = RetreatId::new();

    let rows = [
        booking(retreat_id, 2, 1000, BookingState::PendingUnpaid),
        booking(retreat_id, 3, 1500, BookingState::ConfirmedPaid),
        booking(retreat_id, 1, 500, BookingState::ConfirmedPaid),
        booking(retreat_id, 4, 2000, BookingState::Cancelled { payment_status: PaymentStatus::Paid }),
        booking(retreat_id, 1, 500, BookingState::Completed),
        booking(RetreatId::new(), 5, 2500, BookingState::PendingUnpaid),
    ];
    for row in &rows {
        repo.insert(row).await.unwrap();
    }

    let start = rows[0].session_start;
    assert_eq!(repo.reserved_seats(retreat_id, start).await.unwrap(), 6);
    assert_eq!(repo.reserved_seats(retreat_id, start + Duration::days(1)).await.unwrap(), 0);

    let stats = repo.stats().await.unwrap();
    assert_eq!(stats.total, 6);
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.confirmed, 2);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.revenue, 2000);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn mongo_lease_is_exclusive_until_released_or_expired() {
    let (_container, db) = mongo().await;
    let lock = MongoLeaseLock::new(&db);
    let ttl = StdDuration::from_secs(10);

    let first = lock.try_acquire("seats:a", ttl).await.unwrap().unwrap();
    assert!(lock.is_held(&first).await.unwrap());
    // A live lease makes the upsert collide on `_id`.
    assert!(lock.try_acquire("seats:a", ttl).await.unwrap().is_none());
    assert!(lock.try_acquire("seats:b", ttl).await.unwrap().is_some());

    lock.release(&first).await.unwrap();
    assert!(!lock.is_held(&first).await.unwrap());

    let short = lock.try_acquire("seats:a", StdDuration::from_millis(50)).await.unwrap().unwrap();
    tokio::time::sleep(StdDuration::from_millis(150)).await;
    assert!(!lock.is_held(&short).await.unwrap());

    let taken_over = lock.try_acquire("seats:a", ttl).await.unwrap().unwrap();
    lock.release(&short).await.unwrap();
    assert!(lock.is_held(&taken_over).await.unwrap());
    assert!(lock.try_acquire("seats:a", ttl).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn redis_lease_is_exclusive_until_released_or_expired() {
    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start redis container");
    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("Failed to get redis port");
    let lock = RedisLeaseLock::new(&format!("redis://127.0.0.1:{port}")).unwrap();
    let ttl = StdDuration::from_secs(10);

    let first = lock.try_acquire("job:cleanup", ttl).await.unwrap().unwrap();
    assert!(lock.is_held(&first).await.unwrap());
    assert!(lock.try_acquire("job:cleanup", ttl).await.unwrap().is_none());

    lock.release(&first).await.unwrap();
    assert!(!lock.is_held(&first).await.unwrap());

    let short = lock.try_acquire("job:cleanup", StdDuration::from_millis(50)).await.unwrap().unwrap();
    tokio::time::sleep(StdDuration::from_millis(150)).await;
    let taken_over = lock.try_acquire("job:cleanup", ttl).await.unwrap().unwrap();
    lock.release(&short).await.unwrap();
    assert!(lock.is_held(&taken_over).await.unwrap());
    assert!(!lock.is_held(&short).await.unwrap());
}
