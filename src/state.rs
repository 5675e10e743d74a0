use std::sync::Arc;

use mongodb::Database;

use crate::services::booking_service::BookingService;
use crate::services::reconciliation_service::ReconciliationService;

#[derive(Clone)]
pub struct AppState {
    /// `None` when running on the in-memory store.
    pub db: Option<Database>,
    pub bookings: Arc<BookingService>,
    pub reconciliation: Arc<ReconciliationService>,
    pub jwt_secret: Arc<String>,
    pub discrepancy_grace_minutes: i64,
}

impl AppState {
    pub fn new(bookings: Arc<BookingService>, reconciliation: Arc<ReconciliationService>, jwt_secret: String) -> Self {
        AppState {
            db: None,
            bookings,
            reconciliation,
            jwt_secret: Arc::new(jwt_secret),
            discrepancy_grace_minutes: 30,
        }
    }

    pub fn with_db(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_grace_minutes(mut self, minutes: i64) -> Self {
        self.discrepancy_grace_minutes = minutes;
        self
    }
}
