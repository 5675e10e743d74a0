use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    Extension,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    errors::{AppError, Result},
    models::booking::{Booking, BookingResponse, CreateBookingRequest},
    models::user::Claims,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub session_start: DateTime<Utc>,
}

/// Guests book without a token; signed-in clients get the booking tied to them.
pub async fn create_booking(
    State(state): State<AppState>,
    claims: Option<Extension<Claims>>,
    Json(payload): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<BookingResponse>)> {
    let user_id = claims.map(|Extension(c)| c.sub);
    let booking = state.bookings.create_booking(user_id, payload).await?;
    Ok((StatusCode::CREATED, Json(booking.into())))
}

fn ensure_can_view(booking: &Booking, claims: &Claims) -> Result<()> {
    if claims.is_admin() || booking.user_id.as_deref() == Some(claims.sub.as_str()) {
        Ok(())
    } else {
        Err(AppError::Unauthorized)
    }
}

pub async fn get_booking(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Json<BookingResponse>> {
    let booking = state.bookings.get_booking(&id).await?;
    ensure_can_view(&booking, &claims)?;
    Ok(Json(booking.into()))
}

pub async fn get_my_bookings(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<BookingResponse>>> {
    let bookings = state.bookings.list_user_bookings(&claims.sub).await?;
    Ok(Json(bookings.into_iter().map(BookingResponse::from).collect()))
}

pub async fn get_availability(
    State(state): State<AppState>,
    Path(retreat_id): Path<String>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<Value>> {
    let available = state.bookings.available_seats(&retreat_id, query.session_start).await?;
    Ok(Json(json!({
        "retreatId": retreat_id,
        "sessionStart": query.session_start.to_rfc3339(),
        "availableSeats": available,
    })))
}
