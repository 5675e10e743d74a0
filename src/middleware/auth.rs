use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};

use crate::errors::{AppError, Result};
use crate::models::user::Claims;
use crate::state::AppState;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
}

pub fn decode_claims(token: &str, secret: &str) -> Result<Claims> {
    let decoding_key = DecodingKey::from_secret(secret.as_ref());
    decode::<Claims>(token, &decoding_key, &Validation::new(Algorithm::HS256))
        .map(|data| data.claims)
        .map_err(|e| {
            tracing::debug!(error = %e, "Rejected bearer token");
            AppError::AuthError
        })
}

/// Issues an HS256 token; used by tooling and tests.
pub fn issue_token(claims: &Claims, secret: &str) -> Result<String> {
    encode(&Header::default(), claims, &EncodingKey::from_secret(secret.as_ref()))
        .map_err(|e| AppError::service(format!("token encoding failed: {}", e)))
}

/// Requires a valid bearer token and puts its `Claims` into the request.
pub async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let token = bearer_token(&headers).ok_or(AppError::AuthError)?;
    let claims = decode_claims(token, &state.jwt_secret)?;
    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

/// Guests may pass through without a token; a token that is present must be valid.
pub async fn optional_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    if let Some(token) = bearer_token(&headers) {
        let claims = decode_claims(token, &state.jwt_secret)?;
        request.extensions_mut().insert(claims);
    }
    Ok(next.run(request).await)
}

pub async fn require_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let token = bearer_token(&headers).ok_or(AppError::AuthError)?;
    let claims = decode_claims(token, &state.jwt_secret)?;
    if !claims.is_admin() {
        tracing::warn!(user = %claims.sub, "Non-admin hit an admin route");
        return Err(AppError::Unauthorized);
    }
    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}
