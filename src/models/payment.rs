use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result};
use crate::models::booking::{Booking, BookingId};

/// Metadata keys joining gateway records to local bookings.
pub const BOOKING_ID_KEY: &str = "bookingId";
pub const RETREAT_ID_KEY: &str = "retreatId";
pub const SESSION_START_KEY: &str = "sessionStart";

/// Correlation carried on every payment intent created for a booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCorrelation {
    pub booking_id: BookingId,
    pub retreat_id: String,
    pub session_start: DateTime<Utc>,
}

impl PaymentCorrelation {
    pub fn for_booking(booking: &Booking) -> Self {
        PaymentCorrelation {
            booking_id: booking.id,
            retreat_id: booking.retreat_id.to_hex(),
            session_start: booking.session_start,
        }
    }

    pub fn to_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            (BOOKING_ID_KEY.to_string(), self.booking_id.to_hex()),
            (RETREAT_ID_KEY.to_string(), self.retreat_id.clone()),
            (SESSION_START_KEY.to_string(), self.session_start.to_rfc3339()),
        ])
    }

    /// Extracts the booking id; a missing or malformed id is rejected.
    pub fn booking_id_from(metadata: &HashMap<String, String>) -> Result<BookingId> {
        let raw = metadata
            .get(BOOKING_ID_KEY)
            .ok_or_else(|| AppError::invalid_data("payment metadata has no bookingId"))?;
        BookingId::parse(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentIntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub status: PaymentIntentStatus,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A succeeded, non-refunded charge as reported by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPayment {
    pub id: String,
    pub payment_intent_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub metadata: HashMap<String, String>,
    pub customer_email: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEventKind {
    PaymentSucceeded,
    PaymentFailed,
    Other(String),
}

impl WebhookEventKind {
    pub fn from_type(kind: &str) -> Self {
        match kind {
            "payment_intent.succeeded" => WebhookEventKind::PaymentSucceeded,
            "payment_intent.payment_failed" => WebhookEventKind::PaymentFailed,
            other => WebhookEventKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub kind: WebhookEventKind,
    pub payment_intent: Option<PaymentIntent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentIntentRequest {
    pub booking_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentResponse {
    pub booking_id: String,
    pub payment_intent_id: String,
    pub client_secret: Option<String>,
    pub amount: i64,
    pub currency: String,
}

/// One gateway charge that does not line up with a confirmed booking.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDiscrepancy {
    pub payment_id: String,
    pub payment_intent_id: Option<String>,
    pub booking_id: Option<String>,
    pub retreat_id: Option<String>,
    pub session_start: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub client_email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PaymentDiscrepancy {
    pub fn from_payment(payment: &GatewayPayment) -> Self {
        PaymentDiscrepancy {
            payment_id: payment.id.clone(),
            payment_intent_id: payment.payment_intent_id.clone(),
            booking_id: payment.metadata.get(BOOKING_ID_KEY).cloned(),
            retreat_id: payment.metadata.get(RETREAT_ID_KEY).cloned(),
            session_start: payment.metadata.get(SESSION_START_KEY).cloned(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            client_email: payment.customer_email.clone(),
            created_at: payment.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedSession {
    pub retreat_id: Option<String>,
    pub session_start: Option<String>,
    pub payments: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscrepancyReport {
    pub checked_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub grace_minutes: i64,
    pub payments_checked: usize,
    pub orphan_count: usize,
    /// Charges with no local booking at all.
    pub orphan_payments: Vec<PaymentDiscrepancy>,
    /// Charges whose booking exists but was never confirmed.
    pub unconfirmed_payments: Vec<PaymentDiscrepancy>,
    pub affected_sessions: Vec<AffectedSession>,
}

impl DiscrepancyReport {
    pub fn has_discrepancies(&self) -> bool {
        !self.orphan_payments.is_empty() || !self.unconfirmed_payments.is_empty()
    }
}
