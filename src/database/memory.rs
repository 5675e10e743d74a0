//! In-process stores for tests and local runs without MongoDB.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::database::booking_repository::BookingRepository;
use crate::database::retreat_catalog::RetreatCatalog;
use crate::errors::{AppError, Result};
use crate::models::booking::{Booking, BookingFilter, BookingId, BookingState, BookingStats, BookingStatus};
use crate::models::retreat::{Retreat, RetreatId};

#[derive(Default)]
pub struct MemoryBookingStore {
    bookings: RwLock<HashMap<BookingId, Booking>>,
}

impl MemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.bookings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bookings.read().await.is_empty()
    }
}

#[async_trait]
impl BookingRepository for MemoryBookingStore {
    async fn insert(&self, booking: &Booking) -> Result<()> {
        let mut bookings = self.bookings.write().await;
        if bookings.contains_key(&booking.id) {
            return Err(AppError::service(format!("duplicate booking id {}", booking.id)));
        }
        bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: BookingId) -> Result<Option<Booking>> {
        Ok(self.bookings.read().await.get(&id).cloned())
    }

    async fn find_by_payment_intent(&self, payment_intent_id: &str) -> Result<Option<Booking>> {
        Ok(self
            .bookings
            .read()
            .await
            .values()
            .find(|b| b.payment_intent_id.as_deref() == Some(payment_intent_id))
            .cloned())
    }

    async fn list(&self, filter: &BookingFilter) -> Result<Vec<Booking>> {
        let mut found: Vec<Booking> = self
            .bookings
            .read()
            .await
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let skip = filter.skip.unwrap_or(0) as usize;
        let limit = filter.limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        Ok(found.into_iter().skip(skip).take(limit).collect())
    }

    async fn reserved_seats(&self, retreat_id: RetreatId, session_start: DateTime<Utc>) -> Result<u32> {
        Ok(self
            .bookings
            .read()
            .await
            .values()
            .filter(|b| b.retreat_id == retreat_id && b.session_start == session_start && b.holds_seat())
            .map(|b| b.seat_count)
            .sum())
    }

    async fn replace_if_state(&self, booking: &Booking, expected: BookingStatus) -> Result<bool> {
        let mut bookings = self.bookings.write().await;
        match bookings.get_mut(&booking.id) {
            Some(stored) if stored.status() == expected => {
                *stored = booking.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_expired_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<Booking>> {
        Ok(self
            .bookings
            .read()
            .await
            .values()
            .filter(|b| b.is_expired(cutoff))
            .cloned()
            .collect())
    }

    async fn delete_if_expired(&self, id: BookingId, cutoff: DateTime<Utc>) -> Result<bool> {
        let mut bookings = self.bookings.write().await;
        let expired = bookings
            .get(&id)
            .map(|b| b.is_expired(cutoff))
            .unwrap_or(false);
        if expired {
            bookings.remove(&id);
        }
        Ok(expired)
    }

    async fn find_finished_confirmed(&self, now: DateTime<Utc>) -> Result<Vec<Booking>> {
        Ok(self
            .bookings
            .read()
            .await
            .values()
            .filter(|b| b.state == BookingState::ConfirmedPaid && b.session_end < now)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<BookingStats> {
        let mut stats = BookingStats::default();
        for booking in self.bookings.read().await.values() {
            stats.record(booking);
        }
        Ok(stats)
    }
}

#[derive(Default)]
pub struct MemoryRetreatCatalog {
    retreats: RwLock<HashMap<RetreatId, Retreat>>,
}

impl MemoryRetreatCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, retreat: Retreat) {
        self.retreats.write().await.insert(retreat.id, retreat);
    }

    /// Catalogue-side price change; existing bookings must not follow it.
    pub async fn set_session_price(&self, id: RetreatId, start: DateTime<Utc>, price: i64) -> bool {
        let mut retreats = self.retreats.write().await;
        let session = retreats
            .get_mut(&id)
            .and_then(|r| r.sessions.iter_mut().find(|s| s.start == start));
        match session {
            Some(session) => {
                session.price = price;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl RetreatCatalog for MemoryRetreatCatalog {
    async fn get_retreat(&self, id: RetreatId) -> Result<Option<Retreat>> {
        Ok(self.retreats.read().await.get(&id).cloned())
    }
}
