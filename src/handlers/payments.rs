use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json,
};
use serde_json::{json, Value};

use crate::{
    errors::{AppError, Result},
    models::payment::{CreatePaymentIntentRequest, PaymentIntentResponse},
    services::booking_service::WebhookOutcome,
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

pub async fn create_payment_intent(
    State(state): State<AppState>,
    Json(payload): Json<CreatePaymentIntentRequest>,
) -> Result<Json<PaymentIntentResponse>> {
    let intent = state.bookings.create_payment_intent(&payload.booking_id).await?;
    Ok(Json(PaymentIntentResponse {
        booking_id: payload.booking_id,
        payment_intent_id: intent.id,
        client_secret: intent.client_secret,
        amount: intent.amount,
        currency: intent.currency,
    }))
}

/// Gateway callback. The raw body is needed for signature verification.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::InvalidSignature)?;

    let event = state.bookings.gateway().verify_webhook(&body, signature)?;
    tracing::info!(event_id = %event.id, kind = ?event.kind, "📨 Payment webhook received");

    let outcome = state.bookings.handle_payment_event(event).await?;
    let (result, booking_id) = match outcome {
        WebhookOutcome::Confirmed(id) => ("confirmed", Some(id.to_hex())),
        WebhookOutcome::AlreadyConfirmed(id) => ("already_confirmed", Some(id.to_hex())),
        WebhookOutcome::Cancelled(id) => ("cancelled", Some(id.to_hex())),
        WebhookOutcome::Ignored(reason) => {
            tracing::info!(reason = %reason, "Webhook acknowledged without changes");
            ("ignored", None)
        }
    };

    Ok(Json(json!({
        "received": true,
        "result": result,
        "bookingId": booking_id,
    })))
}
