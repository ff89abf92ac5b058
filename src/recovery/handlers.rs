use axum::{extract::State, routing::post, Json, Router};
use tracing::{instrument, warn};

use super::dto::{RecoveryRequest, RecoveryResponse, ResetPasswordRequest, VerifyCodeRequest};
use crate::{
    auth::{
        extractors::ClientInfo,
        handlers::{is_valid_email, normalize_email, MIN_PASSWORD_LEN},
    },
    error::{AppError, Result},
    rate_limit::LimitedRoute,
    state::AppState,
};

pub fn recovery_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/password-recovery/request", post(request_code))
        .route("/auth/password-recovery/verify", post(verify_code))
        .route("/auth/password-recovery/reset", post(reset_password))
}

fn checked_email(raw: &str) -> Result<String> {
    let email = normalize_email(raw);
    if !is_valid_email(&email) {
        warn!(%email, "invalid email");
        return Err(AppError::BadRequest("Invalid email".into()));
    }
    Ok(email)
}

#[instrument(skip(state, client, payload))]
pub async fn request_code(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<RecoveryRequest>,
) -> Result<Json<RecoveryResponse>> {
    state.throttle(&client, LimitedRoute::PasswordRecovery)?;
    let email = checked_email(&payload.email)?;

    state.recovery.request(&email).await?;

    Ok(Json(RecoveryResponse {
        message: "If the email is registered, a recovery code has been sent",
        email,
    }))
}

#[instrument(skip(state, client, payload))]
pub async fn verify_code(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<VerifyCodeRequest>,
) -> Result<Json<RecoveryResponse>> {
    state.throttle(&client, LimitedRoute::PasswordRecovery)?;
    let email = checked_email(&payload.email)?;

    state.recovery.verify(&email, payload.code.trim()).await?;

    Ok(Json(RecoveryResponse {
        message: "Code verified",
        email,
    }))
}

#[instrument(skip(state, client, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<RecoveryResponse>> {
    state.throttle(&client, LimitedRoute::PasswordRecovery)?;
    let email = checked_email(&payload.email)?;
    if payload.new_password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest("Password too short".into()));
    }

    state
        .recovery
        .reset(&email, payload.code.trim(), &payload.new_password)
        .await?;

    Ok(Json(RecoveryResponse {
        message: "Password updated successfully",
        email,
    }))
}
