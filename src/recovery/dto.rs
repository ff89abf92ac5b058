use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct RecoveryRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyCodeRequest {
    pub email: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub email: String,
    pub code: String,
    pub new_password: String,
}

/// Same shape for every step so nothing hints at whether the account exists.
#[derive(Debug, Serialize)]
pub struct RecoveryResponse {
    pub message: &'static str,
    pub email: String,
}
