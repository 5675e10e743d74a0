mod common;

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{alpine_retreat, Harness};
use retreat_booking::middleware::auth::issue_token;
use retreat_booking::models::user::{Claims, Role};
use retreat_booking::routes::build_router;
use retreat_booking::state::AppState;

const SECRET: &str = "test-jwt-secret";

fn app(h: &Harness) -> Router {
    let state = AppState::new(
        Arc::new(h.service.clone()),
        Arc::new(h.reconciliation.clone()),
        SECRET.to_string(),
    );
    build_router(state)
}

fn token(role: Role, sub: &str) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        email: None,
        role,
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    format!("Bearer {}", issue_token(&claims, SECRET).unwrap())
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn guest_can_book_and_see_availability() {
    let h = alpine_retreat(2, 500).await;
    let app = app(&h);

    let body = json!({
        "retreatId": h.retreat_id.to_hex(),
        "sessionStart": h.session_start.to_rfc3339(),
        "sessionEnd": h.session_end.to_rfc3339(),
        "seatCount": 1,
    });
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/bookings")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["status"], "PENDING");
    assert_eq!(created["paymentStatus"], "PENDING");
    assert_eq!(created["totalPrice"], 500);

    let uri = format!(
        "/api/bookings/availability/{}?session_start={}",
        h.retreat_id.to_hex(),
        h.session_start.format("%Y-%m-%dT%H:%M:%SZ")
    );
    let response = app
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["availableSeats"], 1);
}

#[tokio::test]
async fn overbooking_is_a_conflict() {
    let h = alpine_retreat(1, 500).await;
    let body = json!({
        "retreatId": h.retreat_id.to_hex(),
        "sessionStart": h.session_start.to_rfc3339(),
        "sessionEnd": h.session_end.to_rfc3339(),
        "seatCount": 2,
    });
    let response = app(&h)
        .oneshot(
            Request::post("/api/bookings")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let error = body_json(response).await;
    assert_eq!(error["success"], false);
    assert_eq!(error["error"], "Insufficient seats");
}

#[tokio::test]
async fn admin_routes_require_admin_role() {
    let h = alpine_retreat(2, 500).await;
    let app = app(&h);

    let response = app
        .clone()
        .oneshot(Request::get("/api/admin/bookings/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/admin/bookings/stats")
                .header(header::AUTHORIZATION, token(Role::Client, "client-1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .oneshot(
            Request::get("/api/admin/bookings/stats")
                .header(header::AUTHORIZATION, token(Role::Admin, "admin-1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["total"], 0);
}

#[tokio::test]
async fn admin_confirms_and_owner_reads_booking() {
    let h = alpine_retreat(2, 500).await;
    let booking = h.service.create_booking(Some("client-1".into()), h.request(1)).await.unwrap();
    let app = app(&h);

    let response = app
        .clone()
        .oneshot(
            Request::patch(format!("/api/admin/bookings/{}/confirm", booking.id))
                .header(header::AUTHORIZATION, token(Role::Admin, "admin-1"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "paymentIntentId": "pi_1" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "CONFIRMED");

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/bookings/{}", booking.id))
                .header(header::AUTHORIZATION, token(Role::Client, "client-1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["paymentStatus"], "PAID");

    let response = app
        .oneshot(
            Request::get(format!("/api/bookings/{}", booking.id))
                .header(header::AUTHORIZATION, token(Role::Client, "someone-else"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn webhook_with_bad_signature_is_rejected() {
    let h = alpine_retreat(2, 500).await;
    let response = app(&h)
        .oneshot(
            Request::post("/api/payments/webhook")
                .header("stripe-signature", "t=1,v1=deadbeef")
                .body(Body::from(r#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{}}}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.store.len().await, 0);
}

#[tokio::test]
async fn signed_webhook_confirms_booking() {
    use retreat_booking::mocks::payment_gateway::MOCK_WEBHOOK_SECRET;
    use retreat_booking::services::stripe_service::sign_webhook_payload;

    let h = alpine_retreat(2, 500).await;
    let booking = h.service.create_booking(None, h.request(1)).await.unwrap();
    let intent = h.service.create_payment_intent(&booking.id.to_hex()).await.unwrap();

    let payload = json!({
        "id": "evt_ok",
        "type": "payment_intent.succeeded",
        "data": { "object": {
            "id": intent.id,
            "status": "succeeded",
            "amount": intent.amount,
            "currency": intent.currency,
            "metadata": intent.metadata,
        }}
    })
    .to_string();
    let now = chrono::Utc::now().timestamp();
    let signature = sign_webhook_payload(payload.as_bytes(), now, MOCK_WEBHOOK_SECRET).unwrap();

    let response = app(&h)
        .oneshot(
            Request::post("/api/payments/webhook")
                .header("stripe-signature", format!("t={},v1={}", now, signature))
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["result"], "confirmed");

    let stored = h.service.get_booking(&booking.id.to_hex()).await.unwrap();
    assert_eq!(stored.payment_intent_id.as_deref(), Some(intent.id.as_str()));
}
