use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::{AppError, Result};
use crate::models::payment::{GatewayPayment, PaymentCorrelation, PaymentIntent, PaymentIntentStatus, WebhookEvent};
use crate::services::stripe_service::{verify_webhook_signature, PaymentGateway};

pub const MOCK_WEBHOOK_SECRET: &str = "whsec_mock";

/// Gateway that keeps intents and charges in memory. Like the real one, a
/// repeated idempotency key replays the response first given for it.
#[derive(Debug, Default)]
pub struct MockPaymentGateway {
    intents: Mutex<HashMap<String, PaymentIntent>>,
    replies: Mutex<HashMap<String, PaymentIntent>>,
    keys: Mutex<Vec<String>>,
    payments: Mutex<Vec<GatewayPayment>>,
    cancelled: Mutex<Vec<String>>,
    fail_cancellations: AtomicBool,
    sequence: AtomicU64,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `cancel_payment_intent` call fail.
    pub fn fail_cancellations(&self, fail: bool) {
        self.fail_cancellations.store(fail, Ordering::SeqCst);
    }

    pub fn succeed_intent(&self, id: &str) -> Option<PaymentIntent> {
        let mut intents = self.intents.lock().ok()?;
        let intent = intents.get_mut(id)?;
        intent.status = PaymentIntentStatus::Succeeded;
        Some(intent.clone())
    }

    pub fn intent(&self, id: &str) -> Option<PaymentIntent> {
        self.intents.lock().ok()?.get(id).cloned()
    }

    pub fn add_payment(&self, payment: GatewayPayment) {
        if let Ok(mut payments) = self.payments.lock() {
            payments.push(payment);
        }
    }

    /// Idempotency keys of every create call, in call order.
    pub fn idempotency_keys(&self) -> Vec<String> {
        self.keys.lock().map(|k| k.clone()).unwrap_or_default()
    }

    /// Intent ids the gateway was asked to cancel, in call order.
    pub fn cancelled_ids(&self) -> Vec<String> {
        self.cancelled.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn poisoned() -> AppError {
        AppError::service("mock gateway state poisoned")
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        correlation: &PaymentCorrelation,
        idempotency_key: &str,
    ) -> Result<PaymentIntent> {
        self.keys.lock().map_err(|_| Self::poisoned())?.push(idempotency_key.to_string());
        let mut replies = self.replies.lock().map_err(|_| Self::poisoned())?;
        if let Some(first) = replies.get(idempotency_key) {
            if first.amount != amount || first.currency != currency {
                return Err(AppError::gateway("idempotency key reused with different parameters"));
            }
            return Ok(first.clone());
        }

        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let intent = PaymentIntent {
            id: format!("pi_mock_{}", n),
            client_secret: Some(format!("pi_mock_{}_secret", n)),
            status: PaymentIntentStatus::RequiresPaymentMethod,
            amount,
            currency: currency.to_string(),
            metadata: correlation.to_metadata(),
        };
        self.intents
            .lock()
            .map_err(|_| Self::poisoned())?
            .insert(intent.id.clone(), intent.clone());
        replies.insert(idempotency_key.to_string(), intent.clone());
        Ok(intent)
    }

    async fn get_payment_intent(&self, id: &str) -> Result<PaymentIntent> {
        self.intents
            .lock()
            .map_err(|_| Self::poisoned())?
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::gateway(format!("no such payment intent: {}", id)))
    }

    async fn cancel_payment_intent(&self, id: &str) -> Result<()> {
        self.cancelled.lock().map_err(|_| Self::poisoned())?.push(id.to_string());
        if self.fail_cancellations.load(Ordering::SeqCst) {
            return Err(AppError::gateway("cancel rejected"));
        }
        if let Some(intent) = self.intents.lock().map_err(|_| Self::poisoned())?.get_mut(id) {
            if intent.status == PaymentIntentStatus::Succeeded {
                return Err(AppError::gateway("intent already succeeded"));
            }
            intent.status = PaymentIntentStatus::Canceled;
        }
        Ok(())
    }

    async fn list_successful_payments(&self, since: DateTime<Utc>) -> Result<Vec<GatewayPayment>> {
        Ok(self
            .payments
            .lock()
            .map_err(|_| Self::poisoned())?
            .iter()
            .filter(|p| p.created_at >= since)
            .cloned()
            .collect())
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent> {
        verify_webhook_signature(payload, signature, MOCK_WEBHOOK_SECRET, Utc::now())
    }
}
