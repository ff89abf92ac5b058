use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::store::User;

/// Request body for user registration.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub login: String,
    pub password: String,
    pub email: String,
    #[serde(default)]
    pub plan: Option<String>,
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
}

/// Request body for token refresh.
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Query string of `GET /users`.
#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutAllRequest {
    #[serde(default)]
    pub keep_refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogoutAllResponse {
    pub revoked: u64,
}

/// Response returned after login, register or refresh.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub user: PublicUser,
}

impl AuthResponse {
    pub fn bearer(access_token: String, refresh_token: String, user: User) -> Self {
        Self {
            access_token,
            refresh_token,
            token_type: "bearer",
            user: user.into(),
        }
    }
}

/// Public part of the user returned to the client.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: i64,
    pub login: String,
    pub email: String,
    pub tag: String,
    pub plan: String,
    #[serde(with = "time::serde::rfc3339")]
    pub plan_date: OffsetDateTime,
    pub selected_path: Option<String>,
    pub progress: Option<serde_json::Value>,
}

impl From<User> for PublicUser {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            login: u.login,
            email: u.email,
            tag: u.tag,
            plan: u.plan,
            plan_date: u.plan_date,
            selected_path: u.selected_path,
            progress: u.progress,
        }
    }
}
