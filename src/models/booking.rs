use std::fmt;

use chrono::{DateTime, Utc};
use mongodb::bson::{self, oid::ObjectId};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::Result;
use crate::models::retreat::RetreatId;

pub const MIN_SEATS_PER_BOOKING: u32 = 1;
pub const MAX_SEATS_PER_BOOKING: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookingId(ObjectId);

impl BookingId {
    pub fn new() -> Self {
        BookingId(ObjectId::new())
    }

    /// Parses a hex id; malformed input is an `InvalidObjectId` error.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(BookingId(ObjectId::parse_str(raw.trim())?))
    }

    pub fn as_object_id(&self) -> ObjectId {
        self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl Default for BookingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

/// Lifecycle of a booking. Only the four combinations of booking status and
/// payment status that can actually occur are representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BookingState {
    PendingUnpaid,
    ConfirmedPaid,
    Cancelled { payment_status: PaymentStatus },
    Completed,
}

impl BookingState {
    pub fn status(&self) -> BookingStatus {
        match self {
            BookingState::PendingUnpaid => BookingStatus::Pending,
            BookingState::ConfirmedPaid => BookingStatus::Confirmed,
            BookingState::Cancelled { .. } => BookingStatus::Cancelled,
            BookingState::Completed => BookingStatus::Completed,
        }
    }

    pub fn payment_status(&self) -> PaymentStatus {
        match self {
            BookingState::PendingUnpaid => PaymentStatus::Pending,
            BookingState::ConfirmedPaid | BookingState::Completed => PaymentStatus::Paid,
            BookingState::Cancelled { payment_status } => *payment_status,
        }
    }

    /// Whether a booking in this state counts against session capacity.
    pub fn holds_seat(&self) -> bool {
        matches!(self, BookingState::PendingUnpaid | BookingState::ConfirmedPaid)
    }

    /// Value of the stored `state` field, used in store filters.
    pub fn tag_for(status: BookingStatus) -> &'static str {
        match status {
            BookingStatus::Pending => "pending_unpaid",
            BookingStatus::Confirmed => "confirmed_paid",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }

    /// The state a cancellation moves to; the payment side is carried over.
    pub fn cancelled_from(&self) -> BookingState {
        match self {
            BookingState::Cancelled { .. } => *self,
            other => BookingState::Cancelled {
                payment_status: other.payment_status(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[validate(length(min = 1, max = 100))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100))]
    pub last_name: String,
    #[validate(email)]
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BillingAddress {
    #[validate(length(min = 1, max = 200))]
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    #[validate(length(min = 2, max = 2))]
    pub country: String,
}

/// Stored booking document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    #[serde(rename = "_id")]
    pub id: BookingId,

    /// `None` for guest bookings.
    pub user_id: Option<String>,
    pub retreat_id: RetreatId,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub session_start: DateTime<Utc>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub session_end: DateTime<Utc>,

    pub seat_count: u32,
    /// Minor currency units, frozen at creation.
    pub total_price: i64,
    pub currency: String,

    #[serde(flatten)]
    pub state: BookingState,

    pub payment_intent_id: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    pub billing_address: Option<BillingAddress>,
    pub notes: Option<String>,

    pub cancellation_reason: Option<String>,
    #[serde(default, with = "optional_bson_datetime")]
    pub cancelled_at: Option<DateTime<Utc>>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn status(&self) -> BookingStatus {
        self.state.status()
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.state.payment_status()
    }

    pub fn holds_seat(&self) -> bool {
        self.state.holds_seat()
    }

    /// Still unpaid and created before `cutoff`.
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.state == BookingState::PendingUnpaid && self.created_at < cutoff
    }
}

mod optional_bson_datetime {
    use chrono::{DateTime, Utc};
    use mongodb::bson;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(bson::DateTime::from_chrono).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        Ok(Option::<bson::DateTime>::deserialize(deserializer)?.map(|d| d.to_chrono()))
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookingRequest {
    #[validate(length(equal = 24))]
    pub retreat_id: String,
    pub session_start: DateTime<Utc>,
    pub session_end: DateTime<Utc>,
    #[validate(range(min = 1, max = 20))]
    pub seat_count: u32,
    #[serde(default)]
    #[validate(nested)]
    pub participants: Vec<Participant>,
    #[validate(nested)]
    pub billing_address: Option<BillingAddress>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct CancelBookingRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmBookingRequest {
    pub payment_intent_id: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct BookingQuery {
    pub user_id: Option<String>,
    pub retreat_id: Option<String>,
    pub status: Option<BookingStatus>,
    pub limit: Option<i64>,
    pub skip: Option<u64>,
}

/// Store-level filter; ids already validated.
#[derive(Debug, Default, Clone)]
pub struct BookingFilter {
    pub user_id: Option<String>,
    pub retreat_id: Option<RetreatId>,
    pub status: Option<BookingStatus>,
    pub limit: Option<i64>,
    pub skip: Option<u64>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.user_id.as_ref().map_or(true, |u| booking.user_id.as_ref() == Some(u))
            && self.retreat_id.map_or(true, |r| booking.retreat_id == r)
            && self.status.map_or(true, |s| booking.status() == s)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingStats {
    pub total: u64,
    pub pending: u64,
    pub confirmed: u64,
    pub cancelled: u64,
    pub completed: u64,
    /// Sum of `total_price` over confirmed, paid bookings.
    pub revenue: i64,
}

impl BookingStats {
    pub fn record(&mut self, booking: &Booking) {
        self.total += 1;
        match booking.state {
            BookingState::PendingUnpaid => self.pending += 1,
            BookingState::ConfirmedPaid => {
                self.confirmed += 1;
                self.revenue += booking.total_price;
            }
            BookingState::Cancelled { .. } => self.cancelled += 1,
            BookingState::Completed => self.completed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingResponse {
    pub id: String,
    pub user_id: Option<String>,
    pub retreat_id: String,
    pub session_start: DateTime<Utc>,
    pub session_end: DateTime<Utc>,
    pub seat_count: u32,
    pub total_price: i64,
    pub currency: String,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub payment_intent_id: Option<String>,
    pub participants: Vec<Participant>,
    pub billing_address: Option<BillingAddress>,
    pub notes: Option<String>,
    pub cancellation_reason: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Booking> for BookingResponse {
    fn from(booking: Booking) -> Self {
        BookingResponse {
            id: booking.id.to_hex(),
            user_id: booking.user_id,
            retreat_id: booking.retreat_id.to_hex(),
            session_start: booking.session_start,
            session_end: booking.session_end,
            seat_count: booking.seat_count,
            total_price: booking.total_price,
            currency: booking.currency,
            status: booking.state.status(),
            payment_status: booking.state.payment_status(),
            payment_intent_id: booking.payment_intent_id,
            participants: booking.participants,
            billing_address: booking.billing_address,
            notes: booking.notes,
            cancellation_reason: booking.cancellation_reason,
            cancelled_at: booking.cancelled_at,
            created_at: booking.created_at,
            updated_at: booking.updated_at,
        }
    }
}
