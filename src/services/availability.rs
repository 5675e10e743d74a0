use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::database::booking_repository::BookingRepository;
use crate::database::retreat_catalog::RetreatCatalog;
use crate::errors::{AppError, Result};
use crate::models::retreat::{Retreat, RetreatId, RetreatSession};

/// Never negative, even if a session was transiently over-reserved.
pub fn remaining_seats(capacity: u32, reserved: u32) -> u32 {
    capacity.saturating_sub(reserved)
}

/// Looks up a bookable session. A catalogue entry whose end does not come
/// after its start is refused rather than sold.
pub fn session_for(retreat: &Retreat, session_start: DateTime<Utc>) -> Result<&RetreatSession> {
    let session = retreat.session_starting_at(session_start).ok_or_else(|| {
        AppError::not_found(format!(
            "Session starting {} of retreat {}",
            session_start.to_rfc3339(),
            retreat.id
        ))
    })?;
    if !session.is_well_formed() {
        return Err(AppError::invalid_data(format!(
            "session starting {} of retreat {} ends before it starts",
            session_start.to_rfc3339(),
            retreat.id
        )));
    }
    Ok(session)
}

/// Remaining seats per session, always computed from current booking rows.
#[derive(Clone)]
pub struct AvailabilityCalculator {
    bookings: Arc<dyn BookingRepository>,
    retreats: Arc<dyn RetreatCatalog>,
}

impl AvailabilityCalculator {
    pub fn new(bookings: Arc<dyn BookingRepository>, retreats: Arc<dyn RetreatCatalog>) -> Self {
        Self { bookings, retreats }
    }

    pub async fn load_retreat(&self, retreat_id: RetreatId) -> Result<Retreat> {
        self.retreats
            .get_retreat(retreat_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Retreat {}", retreat_id)))
    }

    pub async fn available_seats(&self, retreat_id: &str, session_start: DateTime<Utc>) -> Result<u32> {
        let retreat_id = RetreatId::parse(retreat_id)?;
        let retreat = self.load_retreat(retreat_id).await?;
        let session = session_for(&retreat, session_start)?;
        self.remaining(retreat_id, session).await
    }

    pub async fn remaining(&self, retreat_id: RetreatId, session: &RetreatSession) -> Result<u32> {
        let reserved = self.bookings.reserved_seats(retreat_id, session.start).await?;
        Ok(remaining_seats(session.capacity, reserved))
    }
}
