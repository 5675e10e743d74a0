use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use reqwest::Client;
use serde_json::json;

use crate::config::EmailConfig;
use crate::errors::{AppError, Result};
use crate::models::booking::Booking;
use crate::models::retreat::Retreat;
use crate::services::receipt::{format_amount, RECEIPT_FILENAME};

/// Outbound notifications. Both calls report success as a bool and never fail
/// the booking operation that triggered them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_booking_confirmation(&self, booking: &Booking, retreat: &Retreat, attachment: &[u8]) -> bool;

    async fn send_admin_alert(&self, subject: &str, body: &str) -> bool;
}

#[derive(Clone)]
pub struct EmailService {
    config: EmailConfig,
    client: Client,
}

impl EmailService {
    pub fn new(config: EmailConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    async fn send(&self, payload: serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::external_api(format!("Email API error: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::external_api(format!(
                "Email sending failed with status: {}",
                response.status()
            )))
        }
    }
}

#[async_trait]
impl Notifier for EmailService {
    async fn send_booking_confirmation(&self, booking: &Booking, retreat: &Retreat, attachment: &[u8]) -> bool {
        let Some(recipient) = booking.participants.first().map(|p| p.email.clone()) else {
            tracing::warn!(booking_id = %booking.id, "No participant email, confirmation not sent");
            return false;
        };

        let text = format!(
            "Your booking for {} ({} - {}) is confirmed.\nSeats: {}\nTotal paid: {}\nReference: {}",
            retreat.title,
            booking.session_start.format("%Y-%m-%d"),
            booking.session_end.format("%Y-%m-%d"),
            booking.seat_count,
            format_amount(booking.total_price, &booking.currency),
            booking.id,
        );

        let payload = json!({
            "from": self.config.from,
            "to": [recipient],
            "subject": format!("Booking confirmed: {}", retreat.title),
            "text": text,
            "attachments": [{
                "filename": RECEIPT_FILENAME,
                "content": base64.encode(attachment),
            }],
        });

        match self.send(payload).await {
            Ok(()) => {
                tracing::info!(booking_id = %booking.id, "📧 Confirmation email sent");
                true
            }
            Err(e) => {
                tracing::error!(booking_id = %booking.id, error = %e, "Confirmation email failed");
                false
            }
        }
    }

    async fn send_admin_alert(&self, subject: &str, body: &str) -> bool {
        let payload = json!({
            "from": self.config.from,
            "to": [self.config.admin_email],
            "subject": subject,
            "text": body,
        });

        match self.send(payload).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, subject, "Admin alert failed");
                false
            }
        }
    }
}

/// Used when no email provider is configured.
#[derive(Clone, Default)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn send_booking_confirmation(&self, booking: &Booking, _retreat: &Retreat, _attachment: &[u8]) -> bool {
        tracing::info!(booking_id = %booking.id, "Email disabled, skipping confirmation");
        false
    }

    async fn send_admin_alert(&self, subject: &str, body: &str) -> bool {
        tracing::warn!(subject, body, "Email disabled, admin alert only logged");
        false
    }
}
