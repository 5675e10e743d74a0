use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};

use crate::handlers::bookings::{create_booking, get_availability, get_booking, get_my_bookings};
use crate::middleware::auth::{optional_auth, require_auth};
use crate::state::AppState;

pub fn routes(state: AppState) -> Router<AppState> {
    let signed_in = Router::new()
        // GET /api/bookings/me - bookings of the caller
        .route("/me", get(get_my_bookings))
        // GET /api/bookings/:id - owner or admin only
        .route("/:id", get(get_booking))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    Router::new()
        // POST /api/bookings - guests allowed
        .route("/", post(create_booking))
        .route_layer(from_fn_with_state(state, optional_auth))
        // GET /api/bookings/availability/:retreat_id?session_start=2025-06-01T00:00:00Z
        .route("/availability/:retreat_id", get(get_availability))
        .merge(signed_in)
}
