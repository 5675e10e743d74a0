use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;

use crate::{
    errors::Result,
    models::booking::{BookingQuery, BookingResponse, BookingStats, CancelBookingRequest, ConfirmBookingRequest},
    models::payment::DiscrepancyReport,
    services::reconciliation_service::CleanupSummary,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct DiscrepancyQuery {
    pub grace_minutes: Option<i64>,
}

pub async fn list_bookings(
    State(state): State<AppState>,
    Query(query): Query<BookingQuery>,
) -> Result<Json<Vec<BookingResponse>>> {
    let bookings = state.bookings.list_bookings(query).await?;
    Ok(Json(bookings.into_iter().map(BookingResponse::from).collect()))
}

pub async fn confirm_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<ConfirmBookingRequest>,
) -> Result<Json<BookingResponse>> {
    let booking = state.bookings.confirm_booking(&id, &payload.payment_intent_id).await?;
    Ok(Json(booking.into()))
}

/// Body is optional; without one the booking is cancelled with no reason.
pub async fn cancel_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Option<Json<CancelBookingRequest>>,
) -> Result<Json<BookingResponse>> {
    let reason = payload.and_then(|Json(p)| p.reason);
    let booking = state.bookings.cancel_booking(&id, reason).await?;
    Ok(Json(booking.into()))
}

pub async fn get_stats(State(state): State<AppState>) -> Result<Json<BookingStats>> {
    Ok(Json(state.reconciliation.get_stats().await?))
}

pub async fn run_cleanup(State(state): State<AppState>) -> Result<Json<CleanupSummary>> {
    Ok(Json(state.reconciliation.cleanup_expired_bookings().await?))
}

pub async fn get_discrepancies(
    State(state): State<AppState>,
    Query(query): Query<DiscrepancyQuery>,
) -> Result<Json<DiscrepancyReport>> {
    let grace = query.grace_minutes.unwrap_or(state.discrepancy_grace_minutes);
    Ok(Json(state.reconciliation.check_payment_discrepancies(grace).await?))
}
