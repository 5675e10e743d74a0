use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::models::booking::{Booking, BookingId};
use crate::models::retreat::Retreat;
use crate::services::email_service::Notifier;

#[derive(Debug, Clone, PartialEq)]
pub struct SentConfirmation {
    pub booking_id: BookingId,
    pub retreat_title: String,
    pub attachment: Vec<u8>,
}

/// Notifier that remembers what it was asked to send.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    confirmations: Mutex<Vec<SentConfirmation>>,
    alerts: Mutex<Vec<(String, String)>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every delivery as failed; calls are still recorded.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn confirmations(&self) -> Vec<SentConfirmation> {
        self.confirmations.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn alerts(&self) -> Vec<(String, String)> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_booking_confirmation(&self, booking: &Booking, retreat: &Retreat, attachment: &[u8]) -> bool {
        if let Ok(mut sent) = self.confirmations.lock() {
            sent.push(SentConfirmation {
                booking_id: booking.id,
                retreat_title: retreat.title.clone(),
                attachment: attachment.to_vec(),
            });
        }
        !self.fail.load(Ordering::SeqCst)
    }

    async fn send_admin_alert(&self, subject: &str, body: &str) -> bool {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push((subject.to_string(), body.to_string()));
        }
        !self.fail.load(Ordering::SeqCst)
    }
}
