use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::BookingPolicy;
use crate::database::booking_repository::BookingRepository;
use crate::errors::{AppError, Result};
use crate::models::booking::{Booking, BookingState, BookingStats, BookingStatus};
use crate::models::payment::{
    AffectedSession, DiscrepancyReport, GatewayPayment, PaymentCorrelation, PaymentDiscrepancy,
    PaymentIntentStatus,
};
use crate::services::email_service::Notifier;
use crate::services::receipt::format_amount;
use crate::services::stripe_service::PaymentGateway;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSummary {
    pub examined: usize,
    pub cleaned: usize,
    /// Rows deleted even though the gateway refused to cancel their intent.
    pub cancel_failures: usize,
    /// Rows kept because the gateway reports their intent as paid.
    pub kept_paid: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSummary {
    pub examined: usize,
    pub completed: usize,
}

/// Periodic sweeps over booking rows plus the admin statistics read.
#[derive(Clone)]
pub struct ReconciliationService {
    bookings: Arc<dyn BookingRepository>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    policy: BookingPolicy,
    lookback: Duration,
}

impl ReconciliationService {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        policy: BookingPolicy,
        lookback: Duration,
    ) -> Self {
        Self {
            bookings,
            gateway,
            notifier,
            policy,
            lookback,
        }
    }

    pub async fn cleanup_expired_bookings(&self) -> Result<CleanupSummary> {
        self.cleanup_expired_bookings_at(Utc::now()).await
    }

    /// Purges unpaid bookings created before `now - expiry`. The remote intent
    /// is cancelled first; the row is deleted even if that cancel fails,
    /// unless the gateway says the intent was actually paid.
    pub async fn cleanup_expired_bookings_at(&self, now: DateTime<Utc>) -> Result<CleanupSummary> {
        let cutoff = now - self.policy.expiry;
        let expired = self.bookings.find_expired_pending(cutoff).await?;
        let mut summary = CleanupSummary {
            examined: expired.len(),
            ..CleanupSummary::default()
        };

        for booking in expired {
            if let Some(payment_intent_id) = booking.payment_intent_id.as_deref() {
                if let Err(e) = self.gateway.cancel_payment_intent(payment_intent_id).await {
                    if self.intent_succeeded(payment_intent_id).await {
                        warn!(booking_id = %booking.id, payment_intent_id,
                            "Expired booking has a paid intent, keeping it for confirmation");
                        summary.kept_paid += 1;
                        continue;
                    }
                    warn!(booking_id = %booking.id, payment_intent_id, error = %e,
                        "Gateway cancel failed, deleting booking anyway");
                    summary.cancel_failures += 1;
                }
            }

            match self.bookings.delete_if_expired(booking.id, cutoff).await {
                Ok(true) => {
                    debug!(booking_id = %booking.id, seats = booking.seat_count, "Expired booking purged");
                    summary.cleaned += 1;
                }
                Ok(false) => debug!(booking_id = %booking.id, "Booking changed before purge, skipped"),
                Err(e) => error!(booking_id = %booking.id, error = %e, "Failed to delete expired booking"),
            }
        }

        if summary.examined > 0 {
            info!(
                examined = summary.examined,
                cleaned = summary.cleaned,
                cancel_failures = summary.cancel_failures,
                kept_paid = summary.kept_paid,
                "🧹 Expired booking cleanup finished"
            );
        }
        Ok(summary)
    }

    async fn intent_succeeded(&self, payment_intent_id: &str) -> bool {
        match self.gateway.get_payment_intent(payment_intent_id).await {
            Ok(intent) => intent.status == PaymentIntentStatus::Succeeded,
            Err(e) => {
                debug!(payment_intent_id, error = %e, "Could not retrieve intent after failed cancel");
                false
            }
        }
    }

    pub async fn check_payment_discrepancies(&self, grace_minutes: i64) -> Result<DiscrepancyReport> {
        self.check_payment_discrepancies_at(Utc::now(), grace_minutes).await
    }

    /// Compares settled gateway charges against local bookings. Detection
    /// only: nothing is modified, and an admin alert goes out when anything
    /// is found.
    pub async fn check_payment_discrepancies_at(&self, now: DateTime<Utc>, grace_minutes: i64) -> Result<DiscrepancyReport> {
        if grace_minutes < 0 {
            return Err(AppError::invalid_data("grace period cannot be negative"));
        }
        let window_start = now - self.lookback;
        let grace_cutoff = now - Duration::minutes(grace_minutes);

        let payments: Vec<GatewayPayment> = self
            .gateway
            .list_successful_payments(window_start)
            .await?
            .into_iter()
            .filter(|p| p.created_at <= grace_cutoff)
            .collect();

        let mut orphan_payments = Vec::new();
        let mut unconfirmed_payments = Vec::new();

        for payment in &payments {
            match self.booking_for(payment).await? {
                None => orphan_payments.push(PaymentDiscrepancy::from_payment(payment)),
                Some(booking) if !matches!(booking.state, BookingState::ConfirmedPaid | BookingState::Completed) => {
                    let mut discrepancy = PaymentDiscrepancy::from_payment(payment);
                    discrepancy.booking_id.get_or_insert_with(|| booking.id.to_hex());
                    discrepancy.retreat_id.get_or_insert_with(|| booking.retreat_id.to_hex());
                    discrepancy
                        .session_start
                        .get_or_insert_with(|| booking.session_start.to_rfc3339());
                    unconfirmed_payments.push(discrepancy);
                }
                Some(_) => {}
            }
        }

        let report = DiscrepancyReport {
            checked_at: now,
            window_start,
            grace_minutes,
            payments_checked: payments.len(),
            orphan_count: orphan_payments.len(),
            affected_sessions: affected_sessions(orphan_payments.iter().chain(unconfirmed_payments.iter())),
            orphan_payments,
            unconfirmed_payments,
        };

        if report.has_discrepancies() {
            warn!(
                orphans = report.orphan_count,
                unconfirmed = report.unconfirmed_payments.len(),
                "⚠️ Payment discrepancies detected"
            );
            let body = alert_body(&report);
            if !self.notifier.send_admin_alert("Payment discrepancies detected", &body).await {
                warn!("Discrepancy alert could not be delivered");
            }
        } else {
            debug!(checked = report.payments_checked, "No payment discrepancies");
        }

        Ok(report)
    }

    async fn booking_for(&self, payment: &GatewayPayment) -> Result<Option<Booking>> {
        if let Some(payment_intent_id) = payment.payment_intent_id.as_deref() {
            if let Some(booking) = self.bookings.find_by_payment_intent(payment_intent_id).await? {
                return Ok(Some(booking));
            }
        }
        match PaymentCorrelation::booking_id_from(&payment.metadata) {
            Ok(id) => self.bookings.find_by_id(id).await,
            Err(_) => Ok(None),
        }
    }

    pub async fn complete_finished_bookings(&self) -> Result<CompletionSummary> {
        self.complete_finished_bookings_at(Utc::now()).await
    }

    /// Confirmed bookings whose session has ended move to completed.
    pub async fn complete_finished_bookings_at(&self, now: DateTime<Utc>) -> Result<CompletionSummary> {
        let finished = self.bookings.find_finished_confirmed(now).await?;
        let mut summary = CompletionSummary {
            examined: finished.len(),
            completed: 0,
        };

        for booking in finished {
            let mut completed = booking.clone();
            completed.state = BookingState::Completed;
            completed.updated_at = now;
            match self.bookings.replace_if_state(&completed, BookingStatus::Confirmed).await {
                Ok(true) => summary.completed += 1,
                Ok(false) => debug!(booking_id = %booking.id, "Booking changed before completion"),
                Err(e) => error!(booking_id = %booking.id, error = %e, "Failed to complete booking"),
            }
        }

        if summary.completed > 0 {
            info!(completed = summary.completed, "Finished sessions marked completed");
        }
        Ok(summary)
    }

    pub async fn get_stats(&self) -> Result<BookingStats> {
        self.bookings.stats().await
    }
}

fn affected_sessions<'a>(discrepancies: impl Iterator<Item = &'a PaymentDiscrepancy>) -> Vec<AffectedSession> {
    let mut grouped: BTreeMap<(Option<String>, Option<String>), u32> = BTreeMap::new();
    for d in discrepancies {
        *grouped
            .entry((d.retreat_id.clone(), d.session_start.clone()))
            .or_default() += 1;
    }
    grouped
        .into_iter()
        .map(|((retreat_id, session_start), payments)| AffectedSession {
            retreat_id,
            session_start,
            payments,
        })
        .collect()
}

fn alert_body(report: &DiscrepancyReport) -> String {
    let mut lines = vec![format!(
        "{} orphan and {} unconfirmed payment(s) between {} and {}.",
        report.orphan_count,
        report.unconfirmed_payments.len(),
        report.window_start.to_rfc3339(),
        report.checked_at.to_rfc3339()
    )];

    let describe = |label: &str, d: &PaymentDiscrepancy| {
        format!(
            "[{}] {} intent={} booking={} retreat={} session={} amount={} email={} at {}",
            label,
            d.payment_id,
            d.payment_intent_id.as_deref().unwrap_or("-"),
            d.booking_id.as_deref().unwrap_or("-"),
            d.retreat_id.as_deref().unwrap_or("-"),
            d.session_start.as_deref().unwrap_or("-"),
            format_amount(d.amount, &d.currency),
            d.client_email.as_deref().unwrap_or("-"),
            d.created_at.to_rfc3339()
        )
    };
    lines.extend(report.orphan_payments.iter().map(|d| describe("orphan", d)));
    lines.extend(report.unconfirmed_payments.iter().map(|d| describe("unconfirmed", d)));
    lines.join("\n")
}
