//! Persistence for users and refresh tokens.
//!
//! Services talk to [`CredentialStore`]; production wires in [`PgStore`],
//! tests use [`MemoryStore`]. Every method is one commit boundary.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub login: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,                           // Argon2 PHC string
    pub tag: String,
    pub plan: String,
    pub plan_date: OffsetDateTime,
    #[serde(skip_serializing)]
    pub recovery_code_hash: Option<String>,
    #[serde(skip_serializing)]
    pub recovery_code_expires_at: Option<OffsetDateTime>,
    pub selected_path: Option<String>,
    pub selected_feelings: Option<serde_json::Value>,
    pub test_results: Option<serde_json::Value>,
    pub progress: Option<serde_json::Value>,
    pub created_at: OffsetDateTime,
}

impl User {
    /// The pending one-time code, if both halves are present.
    pub fn recovery_code(&self) -> Option<RecoveryCode> {
        match (&self.recovery_code_hash, self.recovery_code_expires_at) {
            (Some(hash), Some(expires_at)) => Some(RecoveryCode {
                hash: hash.clone(),
                expires_at,
            }),
            _ => None,
        }
    }
}

/// Hashed one-time code and the instant it stops being accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryCode {
    pub hash: String,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub login: String,
    pub email: String,
    pub password_hash: String,
    pub tag: String,
    pub plan: String,
}

/// Refresh token row. `token_hash` is the SHA-256 hex digest of the bearer string.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: i64,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub expires_at: OffsetDateTime,
    pub revoked: bool,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub user_id: i64,
    pub token_hash: String,
    pub expires_at: OffsetDateTime,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CreateUserError {
    #[error("login already registered")]
    LoginTaken,
    #[error("email already registered")]
    EmailTaken,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_user_by_id(&self, id: i64) -> anyhow::Result<Option<User>>;
    async fn find_user_by_login(&self, login: &str) -> anyhow::Result<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn create_user(&self, user: NewUser) -> Result<User, CreateUserError>;
    /// Users ordered by id.
    async fn list_users(&self, skip: i64, limit: i64) -> anyhow::Result<Vec<User>>;

    /// Writes or clears both one-time-code columns together.
    async fn set_recovery_code(
        &self,
        user_id: i64,
        code: Option<&RecoveryCode>,
    ) -> anyhow::Result<()>;

    /// Clears the one-time code only if it is still the one hashed as
    /// `expected_hash`. Returns `false` when a different code (or none) is
    /// stored, leaving it untouched.
    async fn clear_recovery_code_if(
        &self,
        user_id: i64,
        expected_hash: &str,
    ) -> anyhow::Result<bool>;

    /// Replaces the password hash and clears the one-time code in a single
    /// update. Returns `false` when the user no longer exists.
    async fn reset_password(&self, user_id: i64, password_hash: &str) -> anyhow::Result<bool>;

    async fn insert_refresh_token(&self, token: NewRefreshToken) -> anyhow::Result<RefreshToken>;

    /// Revokes every live token of `token.user_id`, then inserts `token`.
    async fn replace_user_tokens(&self, token: NewRefreshToken) -> anyhow::Result<RefreshToken>;

    /// Looks a token up among non-revoked rows only.
    async fn find_active_refresh_token(
        &self,
        token_hash: &str,
    ) -> anyhow::Result<Option<RefreshToken>>;

    /// Sets `last_used_at` and `expires_at` if the token is still live.
    async fn touch_refresh_token(
        &self,
        id: Uuid,
        used_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<bool>;

    async fn revoke_refresh_token(&self, id: Uuid) -> anyhow::Result<()>;

    /// Revokes `id` (stamping `last_used_at`) and inserts `replacement`, but
    /// only if `id` was still live. `None` means someone else got there first.
    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        used_at: OffsetDateTime,
        replacement: NewRefreshToken,
    ) -> anyhow::Result<Option<RefreshToken>>;

    /// Revokes all live tokens of a user, sparing `except_hash` if given.
    async fn revoke_user_tokens(
        &self,
        user_id: i64,
        except_hash: Option<&str>,
    ) -> anyhow::Result<u64>;
}
