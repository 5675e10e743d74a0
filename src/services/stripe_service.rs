// services/stripe_service.rs
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{header, Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{error, info, warn};

use crate::errors::{AppError, Result};
use crate::models::payment::{
    GatewayPayment, PaymentCorrelation, PaymentIntent, WebhookEvent, WebhookEventKind, BOOKING_ID_KEY,
};

type HmacSha256 = Hmac<Sha256>;

/// Signed webhooks older than this are rejected as replays.
pub const WEBHOOK_TOLERANCE_SECS: i64 = 300;

const CHARGES_PAGE_SIZE: u32 = 100;

/// Everything the booking core needs from the payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Requests repeated with the same `idempotency_key` get the first
    /// response back, so each distinct intent needs its own key.
    async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        correlation: &PaymentCorrelation,
        idempotency_key: &str,
    ) -> Result<PaymentIntent>;

    async fn get_payment_intent(&self, id: &str) -> Result<PaymentIntent>;

    /// Fails for intents already in a terminal state; callers log and move on.
    async fn cancel_payment_intent(&self, id: &str) -> Result<()>;

    /// Succeeded, non-refunded payments created at or after `since`.
    async fn list_successful_payments(&self, since: DateTime<Utc>) -> Result<Vec<GatewayPayment>>;

    fn verify_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent>;
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChargeList {
    data: Vec<Charge>,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct BillingDetails {
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Charge {
    id: String,
    amount: i64,
    currency: String,
    status: String,
    #[serde(default)]
    refunded: bool,
    #[serde(default)]
    amount_refunded: i64,
    payment_intent: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    receipt_email: Option<String>,
    billing_details: Option<BillingDetails>,
    created: i64,
}

impl Charge {
    fn is_settled(&self) -> bool {
        self.status == "succeeded" && !self.refunded && self.amount_refunded == 0
    }

    fn into_payment(self) -> GatewayPayment {
        let customer_email = self
            .receipt_email
            .or_else(|| self.billing_details.and_then(|b| b.email));
        GatewayPayment {
            id: self.id,
            payment_intent_id: self.payment_intent,
            amount: self.amount,
            currency: self.currency,
            metadata: self.metadata,
            customer_email,
            created_at: Utc.timestamp_opt(self.created, 0).single().unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct StripeService {
    api_base: String,
    secret_key: String,
    webhook_secret: String,
    client: Client,
}

impl StripeService {
    pub fn new(api_base: String, secret_key: String, webhook_secret: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(StripeService {
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key,
            webhook_secret,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_base, path)
    }

    async fn parse<T: DeserializeOwned>(response: Response, action: &str) -> Result<T> {
        if response.status().is_success() {
            return Ok(response.json().await?);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<StripeErrorBody>(&body)
            .ok()
            .map(|b| {
                format!(
                    "{} ({})",
                    b.error.message.unwrap_or_default(),
                    b.error.code.unwrap_or_else(|| "no code".to_string())
                )
            })
            .unwrap_or(body);

        error!("Stripe {} failed: {} - {}", action, status, message);
        Err(AppError::gateway(format!("{} failed with {}: {}", action, status, message)))
    }
}

#[async_trait]
impl PaymentGateway for StripeService {
    async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        correlation: &PaymentCorrelation,
        idempotency_key: &str,
    ) -> Result<PaymentIntent> {
        info!(booking_id = %correlation.booking_id, amount, currency, idempotency_key, "Creating payment intent");

        let mut form: Vec<(String, String)> = vec![
            ("amount".to_string(), amount.to_string()),
            ("currency".to_string(), currency.to_string()),
            ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
        ];
        for (key, value) in correlation.to_metadata() {
            form.push((format!("metadata[{}]", key), value));
        }

        let response = self
            .client
            .post(self.url("payment_intents"))
            .bearer_auth(&self.secret_key)
            .header("Idempotency-Key", idempotency_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| AppError::gateway(format!("create payment intent: {}", e)))?;

        let intent: PaymentIntent = Self::parse(response, "create payment intent").await?;
        info!(payment_intent_id = %intent.id, "Payment intent created");
        Ok(intent)
    }

    async fn get_payment_intent(&self, id: &str) -> Result<PaymentIntent> {
        let response = self
            .client
            .get(self.url(&format!("payment_intents/{}", id)))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| AppError::gateway(format!("retrieve payment intent: {}", e)))?;

        Self::parse(response, "retrieve payment intent").await
    }

    async fn cancel_payment_intent(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("payment_intents/{}/cancel", id)))
            .bearer_auth(&self.secret_key)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .send()
            .await
            .map_err(|e| AppError::gateway(format!("cancel payment intent: {}", e)))?;

        let intent: PaymentIntent = Self::parse(response, "cancel payment intent").await?;
        info!(payment_intent_id = %intent.id, "Payment intent cancelled");
        Ok(())
    }

    async fn list_successful_payments(&self, since: DateTime<Utc>) -> Result<Vec<GatewayPayment>> {
        let mut payments = Vec::new();
        let mut starting_after: Option<String> = None;

        loop {
            let mut query = vec![
                ("created[gte]".to_string(), since.timestamp().to_string()),
                ("limit".to_string(), CHARGES_PAGE_SIZE.to_string()),
            ];
            if let Some(cursor) = &starting_after {
                query.push(("starting_after".to_string(), cursor.clone()));
            }

            let response = self
                .client
                .get(self.url("charges"))
                .bearer_auth(&self.secret_key)
                .query(&query)
                .send()
                .await
                .map_err(|e| AppError::gateway(format!("list charges: {}", e)))?;

            let page: ChargeList = Self::parse(response, "list charges").await?;
            starting_after = page.data.last().map(|c| c.id.clone());
            payments.extend(page.data.into_iter().filter(Charge::is_settled).map(Charge::into_payment));

            if !page.has_more || starting_after.is_none() {
                break;
            }
        }

        info!(count = payments.len(), "Fetched successful payments since {}", since);
        Ok(payments)
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent> {
        verify_webhook_signature(payload, signature, &self.webhook_secret, Utc::now())
    }
}

/// Computes the `v1` signature for `timestamp.payload`.
pub fn sign_webhook_payload(payload: &[u8], timestamp: i64, secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::configuration(format!("webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a `t=<unix>,v1=<hex>` signature header and decodes the event.
pub fn verify_webhook_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<WebhookEvent> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => {
                if let Ok(bytes) = hex::decode(value) {
                    candidates.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(AppError::InvalidSignature)?;
    if candidates.is_empty() {
        return Err(AppError::InvalidSignature);
    }
    if (now.timestamp() - timestamp).abs() > WEBHOOK_TOLERANCE_SECS {
        warn!(timestamp, "Webhook timestamp outside tolerance");
        return Err(AppError::InvalidSignature);
    }

    let verified = candidates.iter().any(|candidate| {
        HmacSha256::new_from_slice(secret.as_bytes())
            .map(|mut mac| {
                mac.update(timestamp.to_string().as_bytes());
                mac.update(b".");
                mac.update(payload);
                mac.verify_slice(candidate).is_ok()
            })
            .unwrap_or(false)
    });
    if !verified {
        return Err(AppError::InvalidSignature);
    }

    let raw: RawEvent = serde_json::from_slice(payload)?;
    let kind = WebhookEventKind::from_type(&raw.kind);
    let payment_intent = match kind {
        WebhookEventKind::Other(_) => None,
        _ => Some(serde_json::from_value::<PaymentIntent>(raw.data.object)?),
    };

    if let Some(intent) = &payment_intent {
        if !intent.metadata.contains_key(BOOKING_ID_KEY) {
            warn!(payment_intent_id = %intent.id, "Webhook payment intent carries no bookingId");
        }
    }

    Ok(WebhookEvent {
        id: raw.id,
        kind,
        payment_intent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    fn event_payload(kind: &str) -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": kind,
            "data": { "object": {
                "id": "pi_1",
                "status": "succeeded",
                "amount": 500,
                "currency": "eur",
                "metadata": { "bookingId": "65f1a2b3c4d5e6f7a8b9c0d1" }
            }}
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn valid_signature_decodes_event() {
        let payload = event_payload("payment_intent.succeeded");
        let now = Utc::now();
        let sig = sign_webhook_payload(&payload, now.timestamp(), SECRET).unwrap();
        let header = format!("t={},v1={}", now.timestamp(), sig);

        let event = verify_webhook_signature(&payload, &header, SECRET, now).unwrap();
        assert_eq!(event.kind, WebhookEventKind::PaymentSucceeded);
        assert_eq!(event.payment_intent.unwrap().id, "pi_1");
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let payload = event_payload("payment_intent.succeeded");
        let now = Utc::now();
        let sig = sign_webhook_payload(&payload, now.timestamp(), SECRET).unwrap();
        let header = format!("t={},v1={}", now.timestamp(), sig);

        let tampered = event_payload("payment_intent.payment_failed");
        let err = verify_webhook_signature(&tampered, &header, SECRET, now).unwrap_err();
        assert!(matches!(err, AppError::InvalidSignature));
    }

    #[test]
    fn stale_signature_is_rejected() {
        let payload = event_payload("payment_intent.succeeded");
        let signed_at = Utc::now() - chrono::Duration::minutes(10);
        let sig = sign_webhook_payload(&payload, signed_at.timestamp(), SECRET).unwrap();
        let header = format!("t={},v1={}", signed_at.timestamp(), sig);

        assert!(verify_webhook_signature(&payload, &header, SECRET, Utc::now()).is_err());
    }

    #[test]
    fn unrelated_events_carry_no_intent() {
        let payload = serde_json::json!({
            "id": "evt_2", "type": "customer.created", "data": { "object": {} }
        })
        .to_string()
        .into_bytes();
        let now = Utc::now();
        let sig = sign_webhook_payload(&payload, now.timestamp(), SECRET).unwrap();
        let header = format!("t={},v1={}", now.timestamp(), sig);

        let event = verify_webhook_signature(&payload, &header, SECRET, now).unwrap();
        assert_eq!(event.kind, WebhookEventKind::Other("customer.created".to_string()));
        assert!(event.payment_intent.is_none());
    }

    type SeenKeys = std::sync::Arc<std::sync::Mutex<Vec<String>>>;

    async fn record_intent(
        axum::extract::State(seen): axum::extract::State<SeenKeys>,
        headers: axum::http::HeaderMap,
    ) -> axum::Json<serde_json::Value> {
        let key = headers
            .get("idempotency-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let mut seen = seen.lock().unwrap();
        seen.push(key);
        axum::Json(serde_json::json!({
            "id": format!("pi_stub_{}", seen.len()),
            "client_secret": "secret",
            "status": "requires_payment_method",
            "amount": 500,
            "currency": "eur",
            "metadata": {}
        }))
    }

    #[tokio::test]
    async fn create_sends_the_callers_idempotency_key() {
        let seen = SeenKeys::default();
        let app = axum::Router::new()
            .route("/v1/payment_intents", axum::routing::post(record_intent))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let stripe = StripeService::new(
            format!("http://{}", addr),
            "sk_test".to_string(),
            SECRET.to_string(),
            Duration::from_secs(5),
        )
        .unwrap();
        let correlation = PaymentCorrelation {
            booking_id: crate::models::booking::BookingId::new(),
            retreat_id: "retreat-1".to_string(),
            session_start: Utc::now(),
        };

        let first = stripe
            .create_payment_intent(500, "eur", &correlation, "booking-a")
            .await
            .unwrap();
        let second = stripe
            .create_payment_intent(500, "eur", &correlation, "booking-a-after-pi_1")
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(*seen.lock().unwrap(), vec!["booking-a", "booking-a-after-pi_1"]);
    }

    #[test]
    fn refunded_charges_are_not_settled() {
        let charge: Charge = serde_json::from_value(serde_json::json!({
            "id": "ch_1", "amount": 500, "currency": "eur", "status": "succeeded",
            "refunded": true, "amount_refunded": 500, "payment_intent": "pi_1",
            "metadata": {}, "receipt_email": null, "billing_details": null, "created": 1_700_000_000
        }))
        .unwrap();
        assert!(!charge.is_settled());
    }
}
