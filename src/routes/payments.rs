use axum::{
    middleware::from_fn_with_state,
    routing::post,
    Router,
};

use crate::handlers::payments::{create_payment_intent, payment_webhook};
use crate::middleware::auth::optional_auth;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        // POST /api/payments/intent - body: { "bookingId": "..." }
        .route("/intent", post(create_payment_intent))
        .route_layer(from_fn_with_state(state, optional_auth))
        // POST /api/payments/webhook - authenticated by signature, not by token
        .route("/webhook", post(payment_webhook))
}
