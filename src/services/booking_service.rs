use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::config::BookingPolicy;
use crate::database::booking_repository::BookingRepository;
use crate::database::leases::{self, LeaseLock};
use crate::database::retreat_catalog::RetreatCatalog;
use crate::errors::{AppError, Result};
use crate::models::booking::{
    Booking, BookingFilter, BookingId, BookingQuery, BookingState, BookingStatus, CreateBookingRequest,
    PaymentStatus, MAX_SEATS_PER_BOOKING, MIN_SEATS_PER_BOOKING,
};
use crate::models::payment::{
    PaymentCorrelation, PaymentIntent, PaymentIntentStatus, WebhookEvent, WebhookEventKind,
};
use crate::models::retreat::RetreatId;
use crate::services::availability::{session_for, AvailabilityCalculator};
use crate::services::email_service::Notifier;
use crate::services::receipt::render_receipt;
use crate::services::stripe_service::PaymentGateway;

/// Compare-and-set retries before a state change gives up.
const TRANSITION_ATTEMPTS: usize = 3;
const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

pub const PAYMENT_FAILED_REASON: &str = "payment failed";

/// What a verified webhook led to.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Confirmed(BookingId),
    AlreadyConfirmed(BookingId),
    Cancelled(BookingId),
    Ignored(String),
}

fn seat_lock_key(retreat_id: RetreatId, session_start: DateTime<Utc>) -> String {
    format!("seats:{}:{}", retreat_id, session_start.timestamp_millis())
}

/// The first intent of a booking is keyed by the booking alone. A replacement
/// for a cancelled intent also names the intent it replaces, otherwise the
/// gateway would replay the cancelled one.
pub fn intent_idempotency_key(booking_id: BookingId, replacing: Option<&str>) -> String {
    match replacing {
        Some(previous) => format!("booking-{}-after-{}", booking_id, previous),
        None => format!("booking-{}", booking_id),
    }
}

/// Owns the booking state machine: creation against capacity, confirmation,
/// cancellation and payment-intent association.
#[derive(Clone)]
pub struct BookingService {
    bookings: Arc<dyn BookingRepository>,
    retreats: Arc<dyn RetreatCatalog>,
    availability: AvailabilityCalculator,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    locks: Arc<dyn LeaseLock>,
    policy: BookingPolicy,
}

impl BookingService {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        retreats: Arc<dyn RetreatCatalog>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        locks: Arc<dyn LeaseLock>,
        policy: BookingPolicy,
    ) -> Self {
        let availability = AvailabilityCalculator::new(bookings.clone(), retreats.clone());
        Self {
            bookings,
            retreats,
            availability,
            gateway,
            notifier,
            locks,
            policy,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    pub async fn available_seats(&self, retreat_id: &str, session_start: DateTime<Utc>) -> Result<u32> {
        self.availability.available_seats(retreat_id, session_start).await
    }

    #[tracing::instrument(skip(self, request), fields(retreat_id = %request.retreat_id, seats = request.seat_count))]
    pub async fn create_booking(&self, user_id: Option<String>, request: CreateBookingRequest) -> Result<Booking> {
        if !(MIN_SEATS_PER_BOOKING..=MAX_SEATS_PER_BOOKING).contains(&request.seat_count) {
            return Err(AppError::invalid_data(format!(
                "seat count must be between {} and {}",
                MIN_SEATS_PER_BOOKING, MAX_SEATS_PER_BOOKING
            )));
        }
        request.validate()?;

        let retreat_id = RetreatId::parse(&request.retreat_id)?;
        let retreat = self.availability.load_retreat(retreat_id).await?;
        let session = session_for(&retreat, request.session_start)?;
        if session.end != request.session_end {
            return Err(AppError::invalid_data("session end does not match the retreat session"));
        }

        let total_price = session
            .price
            .checked_mul(i64::from(request.seat_count))
            .ok_or_else(|| AppError::invalid_data("total price overflows"))?;

        let now = Utc::now();
        let booking = Booking {
            id: BookingId::new(),
            user_id,
            retreat_id,
            session_start: session.start,
            session_end: session.end,
            seat_count: request.seat_count,
            total_price,
            currency: self.policy.currency.clone(),
            state: BookingState::PendingUnpaid,
            payment_intent_id: None,
            participants: request.participants,
            billing_address: request.billing_address,
            notes: request.notes,
            cancellation_reason: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        };

        // Check-then-insert runs under the session lease so concurrent buyers
        // cannot both see the last seat.
        let key = seat_lock_key(retreat_id, session.start);
        let lease = leases::acquire(
            self.locks.as_ref(),
            &key,
            self.policy.seat_lock_ttl,
            self.policy.seat_lock_wait,
        )
        .await?;

        let outcome = async {
            let available = self.availability.remaining(retreat_id, session).await?;
            if booking.seat_count > available {
                return Err(AppError::InsufficientSeats {
                    requested: booking.seat_count,
                    available,
                });
            }
            // The count above is only trusted while the lease is ours.
            if !self.locks.is_held(&lease).await? {
                warn!(key = %key, "Seat lease lapsed before insert");
                return Err(AppError::ServiceUnavailable(format!("lock {} lapsed, retry the booking", key)));
            }
            self.bookings.insert(&booking).await
        }
        .await;

        if let Err(e) = self.locks.release(&lease).await {
            warn!(key = %key, error = %e, "Failed to release seat lease, it will expire");
        }
        outcome?;

        info!(booking_id = %booking.id, total_price, "🎟️ Booking created (pending payment)");
        Ok(booking)
    }

    pub async fn get_booking(&self, id: &str) -> Result<Booking> {
        let id = BookingId::parse(id)?;
        self.find(id).await
    }

    async fn find(&self, id: BookingId) -> Result<Booking> {
        self.bookings
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Booking {}", id)))
    }

    pub async fn list_user_bookings(&self, user_id: &str) -> Result<Vec<Booking>> {
        self.bookings
            .list(&BookingFilter {
                user_id: Some(user_id.to_string()),
                ..BookingFilter::default()
            })
            .await
    }

    pub async fn list_bookings(&self, query: BookingQuery) -> Result<Vec<Booking>> {
        let retreat_id = query.retreat_id.as_deref().map(RetreatId::parse).transpose()?;
        let filter = BookingFilter {
            user_id: query.user_id,
            retreat_id,
            status: query.status,
            limit: Some(query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)),
            skip: query.skip,
        };
        self.bookings.list(&filter).await
    }

    /// Pending -> confirmed/paid. A repeated confirmation carrying the same
    /// payment intent is accepted as a no-op; anything else not pending is a
    /// conflict.
    #[tracing::instrument(skip(self))]
    pub async fn confirm_booking(&self, id: &str, payment_intent_id: &str) -> Result<Booking> {
        let id = BookingId::parse(id)?;
        let payment_intent_id = payment_intent_id.trim();
        if payment_intent_id.is_empty() {
            return Err(AppError::invalid_data("payment intent id is required"));
        }

        for _ in 0..TRANSITION_ATTEMPTS {
            let booking = self.find(id).await?;
            match booking.state {
                BookingState::PendingUnpaid => {
                    if let Some(previous) = booking.payment_intent_id.as_deref() {
                        if previous != payment_intent_id {
                            warn!(booking_id = %id, previous, payment_intent_id, "Confirming with a different payment intent");
                        }
                    }

                    let mut confirmed = booking.clone();
                    confirmed.state = BookingState::ConfirmedPaid;
                    confirmed.payment_intent_id = Some(payment_intent_id.to_string());
                    confirmed.updated_at = Utc::now();

                    if self.bookings.replace_if_state(&confirmed, BookingStatus::Pending).await? {
                        info!(booking_id = %id, payment_intent_id, "✅ Booking confirmed");
                        self.dispatch_confirmation(confirmed.clone());
                        return Ok(confirmed);
                    }
                    debug!(booking_id = %id, "Booking changed while confirming, retrying");
                }
                BookingState::ConfirmedPaid if booking.payment_intent_id.as_deref() == Some(payment_intent_id) => {
                    info!(booking_id = %id, payment_intent_id, "Duplicate confirmation ignored");
                    return Ok(booking);
                }
                other => {
                    return Err(AppError::invalid_state(format!(
                        "booking {} is not pending (status {:?})",
                        id,
                        other.status()
                    )));
                }
            }
        }

        Err(AppError::invalid_state(format!("booking {} kept changing during confirmation", id)))
    }

    /// Cancels a booking. Cancelling an already cancelled booking returns it
    /// untouched, keeping the original reason and timestamp.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_booking(&self, id: &str, reason: Option<String>) -> Result<Booking> {
        let id = BookingId::parse(id)?;
        self.cancel(id, reason, None, None).await
    }

    /// With `only_from` set, a booking found in any other status is left alone
    /// and reported as a conflict, including one that moved on between reads.
    async fn cancel(
        &self,
        id: BookingId,
        reason: Option<String>,
        payment_status: Option<PaymentStatus>,
        only_from: Option<BookingStatus>,
    ) -> Result<Booking> {
        for _ in 0..TRANSITION_ATTEMPTS {
            let booking = self.find(id).await?;
            if let Some(expected) = only_from {
                if booking.status() != expected {
                    return Err(AppError::invalid_state(format!(
                        "booking {} is {:?}, not {:?}",
                        id,
                        booking.status(),
                        expected
                    )));
                }
            }
            if let BookingState::Cancelled { .. } = booking.state {
                return Ok(booking);
            }

            let now = Utc::now();
            let mut cancelled = booking.clone();
            cancelled.state = match payment_status {
                Some(payment_status) => BookingState::Cancelled { payment_status },
                None => booking.state.cancelled_from(),
            };
            cancelled.cancellation_reason = reason.clone();
            cancelled.cancelled_at = Some(now);
            cancelled.updated_at = now;

            if self.bookings.replace_if_state(&cancelled, booking.status()).await? {
                info!(booking_id = %id, reason = ?reason, "Booking cancelled");
                return Ok(cancelled);
            }
            debug!(booking_id = %id, "Booking changed while cancelling, retrying");
        }

        Err(AppError::invalid_state(format!("booking {} kept changing during cancellation", id)))
    }

    /// Creates (or returns the existing) gateway payment intent for a pending
    /// booking and records its id on the booking.
    #[tracing::instrument(skip(self))]
    pub async fn create_payment_intent(&self, booking_id: &str) -> Result<PaymentIntent> {
        let id = BookingId::parse(booking_id)?;
        let booking = self.find(id).await?;
        if booking.state != BookingState::PendingUnpaid {
            return Err(AppError::invalid_state(format!(
                "booking {} is not awaiting payment (status {:?})",
                id,
                booking.status()
            )));
        }

        let mut replacing = None;
        if let Some(existing) = booking.payment_intent_id.as_deref() {
            let intent = self.gateway.get_payment_intent(existing).await?;
            if intent.status != PaymentIntentStatus::Canceled {
                return Ok(intent);
            }
            info!(booking_id = %id, payment_intent_id = existing, "Existing intent was cancelled, creating a new one");
            replacing = Some(existing);
        }

        let correlation = PaymentCorrelation::for_booking(&booking);
        let key = intent_idempotency_key(id, replacing);
        let intent = self
            .gateway
            .create_payment_intent(booking.total_price, &booking.currency, &correlation, &key)
            .await?;

        let mut updated = booking.clone();
        updated.payment_intent_id = Some(intent.id.clone());
        updated.updated_at = Utc::now();

        if !self.bookings.replace_if_state(&updated, BookingStatus::Pending).await? {
            if let Err(e) = self.gateway.cancel_payment_intent(&intent.id).await {
                warn!(payment_intent_id = %intent.id, error = %e, "Could not cancel intent for a booking that moved on");
            }
            return Err(AppError::invalid_state(format!("booking {} is no longer pending", id)));
        }

        Ok(intent)
    }

    /// Applies a verified gateway event. Conflicts and unknown bookings are
    /// acknowledged rather than surfaced, so the gateway stops redelivering;
    /// storage failures propagate so it retries.
    pub async fn handle_payment_event(&self, event: WebhookEvent) -> Result<WebhookOutcome> {
        let intent = match (&event.kind, event.payment_intent) {
            (WebhookEventKind::Other(kind), _) => {
                debug!(event_id = %event.id, kind, "Ignoring webhook event");
                return Ok(WebhookOutcome::Ignored(format!("unhandled event {}", kind)));
            }
            (_, None) => return Ok(WebhookOutcome::Ignored("event without payment intent".to_string())),
            (_, Some(intent)) => intent,
        };

        let booking_id = match PaymentCorrelation::booking_id_from(&intent.metadata) {
            Ok(id) => id,
            Err(e) => {
                error!(payment_intent_id = %intent.id, error = %e, "Unreconcilable payment event");
                return Ok(WebhookOutcome::Ignored(format!("no usable bookingId: {}", e)));
            }
        };

        match event.kind {
            WebhookEventKind::PaymentSucceeded => {
                let before = self.bookings.find_by_id(booking_id).await?;
                let already = before
                    .as_ref()
                    .map(|b| b.state == BookingState::ConfirmedPaid)
                    .unwrap_or(false);

                match self.confirm_booking(&booking_id.to_hex(), &intent.id).await {
                    Ok(_) if already => Ok(WebhookOutcome::AlreadyConfirmed(booking_id)),
                    Ok(_) => Ok(WebhookOutcome::Confirmed(booking_id)),
                    Err(e @ (AppError::NotFound(_) | AppError::InvalidState(_))) => {
                        error!(booking_id = %booking_id, payment_intent_id = %intent.id, error = %e,
                            "Payment succeeded but booking cannot be confirmed");
                        Ok(WebhookOutcome::Ignored(e.to_string()))
                    }
                    Err(e) => Err(e),
                }
            }
            WebhookEventKind::PaymentFailed => {
                let cancelled = self
                    .cancel(
                        booking_id,
                        Some(PAYMENT_FAILED_REASON.to_string()),
                        Some(PaymentStatus::Failed),
                        Some(BookingStatus::Pending),
                    )
                    .await;
                match cancelled {
                    Ok(_) => Ok(WebhookOutcome::Cancelled(booking_id)),
                    Err(AppError::NotFound(_)) => {
                        warn!(booking_id = %booking_id, "Payment failed for unknown booking");
                        Ok(WebhookOutcome::Ignored("booking not found".to_string()))
                    }
                    Err(AppError::InvalidState(reason)) => {
                        warn!(booking_id = %booking_id, reason = %reason, "Payment failure for non-pending booking ignored");
                        Ok(WebhookOutcome::Ignored("booking is not pending".to_string()))
                    }
                    Err(e) => Err(e),
                }
            }
            WebhookEventKind::Other(_) => Ok(WebhookOutcome::Ignored("unhandled event".to_string())),
        }
    }

    /// Receipt and email run detached; their failure never touches the booking.
    fn dispatch_confirmation(&self, booking: Booking) {
        let retreats = self.retreats.clone();
        let notifier = self.notifier.clone();

        tokio::spawn(async move {
            let retreat = match retreats.get_retreat(booking.retreat_id).await {
                Ok(Some(retreat)) => retreat,
                Ok(None) => {
                    warn!(booking_id = %booking.id, "Retreat vanished, confirmation email skipped");
                    return;
                }
                Err(e) => {
                    error!(booking_id = %booking.id, error = %e, "Could not load retreat for confirmation email");
                    return;
                }
            };

            let receipt = render_receipt(&booking, &retreat);
            if !notifier.send_booking_confirmation(&booking, &retreat, &receipt).await {
                warn!(booking_id = %booking.id, "Confirmation email was not delivered");
            }
        });
    }
}
