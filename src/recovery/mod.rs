//! Three-step password recovery: request a code, verify it, reset the password.
//!
//! State lives on the user row: a hashed 4-digit code and its expiry, always
//! written and cleared together.

mod dto;
pub mod handlers;
pub mod service;

pub use service::RecoveryService;

use crate::state::AppState;
use axum::Router;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("No recovery code requested for this email")]
    NoCodeRequested,
    #[error("Recovery code has expired. Please request a new one.")]
    CodeExpired,
    #[error("Invalid recovery code")]
    InvalidCode,
    #[error("User not found")]
    UserNotFound,
    #[error("Failed to send recovery email. Please try again later.")]
    DeliveryFailed,
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

pub fn router() -> Router<AppState> {
    handlers::recovery_routes()
}
