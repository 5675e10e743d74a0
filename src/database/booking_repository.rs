use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::{
    bson::{self, doc, Bson, Document},
    Collection, Database,
};

use crate::errors::Result;
use crate::models::booking::{Booking, BookingFilter, BookingId, BookingState, BookingStats, BookingStatus};
use crate::models::retreat::RetreatId;

pub const BOOKINGS_COLLECTION: &str = "bookings";

/// Persistence for booking rows. Implementations must re-read on every call;
/// nothing here may cache reservation state.
#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn insert(&self, booking: &Booking) -> Result<()>;

    async fn find_by_id(&self, id: BookingId) -> Result<Option<Booking>>;

    async fn find_by_payment_intent(&self, payment_intent_id: &str) -> Result<Option<Booking>>;

    async fn list(&self, filter: &BookingFilter) -> Result<Vec<Booking>>;

    /// Seats held by pending-unpaid and confirmed-paid bookings of one session.
    async fn reserved_seats(&self, retreat_id: RetreatId, session_start: DateTime<Utc>) -> Result<u32>;

    /// Writes `booking` only if the stored row is still in `expected`.
    /// Returns false when another writer got there first or the row is gone.
    async fn replace_if_state(&self, booking: &Booking, expected: BookingStatus) -> Result<bool>;

    async fn find_expired_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<Booking>>;

    /// Deletes the row if it is still pending-unpaid and created before `cutoff`.
    async fn delete_if_expired(&self, id: BookingId, cutoff: DateTime<Utc>) -> Result<bool>;

    async fn find_finished_confirmed(&self, now: DateTime<Utc>) -> Result<Vec<Booking>>;

    async fn stats(&self) -> Result<BookingStats>;
}

#[derive(Clone)]
pub struct MongoBookingRepository {
    collection: Collection<Booking>,
}

impl MongoBookingRepository {
    pub fn new(db: &Database) -> Self {
        MongoBookingRepository {
            collection: db.collection(BOOKINGS_COLLECTION),
        }
    }

    fn filter_document(filter: &BookingFilter) -> Document {
        let mut query = doc! {};
        if let Some(user_id) = &filter.user_id {
            query.insert("user_id", user_id);
        }
        if let Some(retreat_id) = filter.retreat_id {
            query.insert("retreat_id", retreat_id.as_object_id());
        }
        if let Some(status) = filter.status {
            query.insert("state", BookingState::tag_for(status));
        }
        query
    }
}

fn as_i64(value: Option<&Bson>) -> i64 {
    match value {
        Some(Bson::Int32(v)) => i64::from(*v),
        Some(Bson::Int64(v)) => *v,
        Some(Bson::Double(v)) => *v as i64,
        _ => 0,
    }
}

fn seat_holding_tags() -> Vec<&'static str> {
    vec![
        BookingState::tag_for(BookingStatus::Pending),
        BookingState::tag_for(BookingStatus::Confirmed),
    ]
}

#[async_trait]
impl BookingRepository for MongoBookingRepository {
    async fn insert(&self, booking: &Booking) -> Result<()> {
        self.collection.insert_one(booking).await?;
        Ok(())
    }

    async fn find_by_id(&self, id: BookingId) -> Result<Option<Booking>> {
        Ok(self.collection.find_one(doc! { "_id": id.as_object_id() }).await?)
    }

    async fn find_by_payment_intent(&self, payment_intent_id: &str) -> Result<Option<Booking>> {
        Ok(self
            .collection
            .find_one(doc! { "payment_intent_id": payment_intent_id })
            .await?)
    }

    async fn list(&self, filter: &BookingFilter) -> Result<Vec<Booking>> {
        let mut find = self
            .collection
            .find(Self::filter_document(filter))
            .sort(doc! { "created_at": -1 });
        if let Some(limit) = filter.limit {
            find = find.limit(limit);
        }
        if let Some(skip) = filter.skip {
            find = find.skip(skip);
        }
        let cursor = find.await?;
        Ok(cursor.try_collect().await?)
    }

    async fn reserved_seats(&self, retreat_id: RetreatId, session_start: DateTime<Utc>) -> Result<u32> {
        let pipeline = vec![
            doc! { "$match": {
                "retreat_id": retreat_id.as_object_id(),
                "session_start": bson::DateTime::from_chrono(session_start),
                "state": { "$in": seat_holding_tags() },
            }},
            doc! { "$group": { "_id": Bson::Null, "seats": { "$sum": "$seat_count" } } },
        ];

        let mut cursor = self.collection.aggregate(pipeline).await?;
        let seats = match cursor.try_next().await? {
            Some(group) => as_i64(group.get("seats")),
            None => 0,
        };
        Ok(u32::try_from(seats.max(0)).unwrap_or(u32::MAX))
    }

    async fn replace_if_state(&self, booking: &Booking, expected: BookingStatus) -> Result<bool> {
        let result = self
            .collection
            .replace_one(
                doc! { "_id": booking.id.as_object_id(), "state": BookingState::tag_for(expected) },
                booking,
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn find_expired_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<Booking>> {
        let cursor = self
            .collection
            .find(doc! {
                "state": BookingState::tag_for(BookingStatus::Pending),
                "created_at": { "$lt": bson::DateTime::from_chrono(cutoff) },
            })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn delete_if_expired(&self, id: BookingId, cutoff: DateTime<Utc>) -> Result<bool> {
        let result = self
            .collection
            .delete_one(doc! {
                "_id": id.as_object_id(),
                "state": BookingState::tag_for(BookingStatus::Pending),
                "created_at": { "$lt": bson::DateTime::from_chrono(cutoff) },
            })
            .await?;
        Ok(result.deleted_count == 1)
    }

    async fn find_finished_confirmed(&self, now: DateTime<Utc>) -> Result<Vec<Booking>> {
        let cursor = self
            .collection
            .find(doc! {
                "state": BookingState::tag_for(BookingStatus::Confirmed),
                "session_end": { "$lt": bson::DateTime::from_chrono(now) },
            })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn stats(&self) -> Result<BookingStats> {
        let pipeline = vec![doc! { "$group": {
            "_id": "$state",
            "count": { "$sum": 1 },
            "revenue": { "$sum": "$total_price" },
        }}];

        let mut stats = BookingStats::default();
        let mut cursor = self.collection.aggregate(pipeline).await?;
        while let Some(group) = cursor.try_next().await? {
            let count = as_i64(group.get("count")).max(0) as u64;
            stats.total += count;
            match group.get_str("_id").unwrap_or_default() {
                "pending_unpaid" => stats.pending += count,
                "confirmed_paid" => {
                    stats.confirmed += count;
                    stats.revenue += as_i64(group.get("revenue"));
                }
                "cancelled" => stats.cancelled += count,
                "completed" => stats.completed += count,
                other => tracing::warn!(state = other, "unknown booking state in stats"),
            }
        }
        Ok(stats)
    }
}
