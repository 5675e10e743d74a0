use axum::{
    middleware::from_fn_with_state,
    routing::{get, patch, post},
    Router,
};

use crate::handlers::admin::{
    cancel_booking, confirm_booking, get_discrepancies, get_stats, list_bookings, run_cleanup,
};
use crate::middleware::auth::require_admin;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        // GET /api/admin/bookings?status=PENDING&retreat_id=...&limit=50&skip=0
        .route("/bookings", get(list_bookings))
        .route("/bookings/stats", get(get_stats))
        .route("/bookings/cleanup", post(run_cleanup))
        // GET /api/admin/bookings/discrepancies?grace_minutes=30
        .route("/bookings/discrepancies", get(get_discrepancies))
        .route("/bookings/:id/confirm", patch(confirm_booking))
        .route("/bookings/:id/cancel", patch(cancel_booking))
        .route_layer(from_fn_with_state(state, require_admin))
}
