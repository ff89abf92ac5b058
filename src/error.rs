//! Boundary error type: every handler failure becomes one of these.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{auth::service::AuthError, recovery::RecoveryError};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("{0}")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(&'static str),

    #[error("{message}")]
    RateLimited {
        message: &'static str,
        reset_at: OffsetDateTime,
        retry_after: u64,
    },

    #[error(transparent)]
    Recovery(RecoveryError),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    reset_at: Option<OffsetDateTime>,
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            AppError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            AppError::Recovery(e) => match e {
                RecoveryError::NoCodeRequested => (StatusCode::BAD_REQUEST, "no_code_requested"),
                RecoveryError::CodeExpired => (StatusCode::BAD_REQUEST, "code_expired"),
                RecoveryError::InvalidCode => (StatusCode::BAD_REQUEST, "invalid_code"),
                RecoveryError::UserNotFound => (StatusCode::BAD_REQUEST, "user_not_found"),
                RecoveryError::DeliveryFailed => {
                    (StatusCode::SERVICE_UNAVAILABLE, "delivery_failed")
                }
                RecoveryError::Internal(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            },
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials => AppError::Unauthorized("Invalid credentials"),
            AuthError::InvalidRefreshToken => {
                AppError::Unauthorized("Invalid or expired refresh token")
            }
            AuthError::LoginTaken => AppError::Conflict("Login already registered"),
            AuthError::EmailTaken => AppError::Conflict("Email already registered"),
            AuthError::Internal(err) => AppError::Internal(err),
        }
    }
}

impl From<RecoveryError> for AppError {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::Internal(err) => AppError::Internal(err),
            other => AppError::Recovery(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = self.status_and_code();

        if let AppError::Internal(ref err) = self {
            tracing::error!(error = %err, "internal server error");
        }

        let (retry_after, reset_at) = match &self {
            AppError::RateLimited {
                reset_at,
                retry_after,
                ..
            } => (Some(*retry_after), Some(*reset_at)),
            _ => (None, None),
        };

        let body = ErrorResponse {
            error,
            message: self.to_string(),
            retry_after,
            reset_at,
        };

        let mut res = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            res.headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        if let Some(secs) = retry_after {
            res.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        res
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
