use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    CreateUserError, CredentialStore, NewRefreshToken, NewUser, RecoveryCode, RefreshToken, User,
};

/// Process-local store with the same semantics as the Postgres one.
/// Each method runs under a single lock, which stands in for a transaction.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_user_id: i64,
    users: HashMap<i64, User>,
    tokens: HashMap<Uuid, RefreshToken>,
}

impl Inner {
    fn insert_token(&mut self, token: NewRefreshToken) -> RefreshToken {
        let row = RefreshToken {
            id: Uuid::new_v4(),
            user_id: token.user_id,
            token_hash: token.token_hash,
            expires_at: token.expires_at,
            revoked: false,
            created_at: OffsetDateTime::now_utc(),
            last_used_at: None,
            ip_address: token.ip_address,
            user_agent: token.user_agent,
        };
        self.tokens.insert(row.id, row.clone());
        row
    }

    fn revoke_user(&mut self, user_id: i64, except_hash: Option<&str>) -> u64 {
        let mut n = 0;
        for t in self.tokens.values_mut() {
            if t.user_id == user_id && !t.revoked && Some(t.token_hash.as_str()) != except_hash {
                t.revoked = true;
                n += 1;
            }
        }
        n
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }

    /// All token rows of a user, revoked ones included.
    pub fn tokens_of(&self, user_id: i64) -> Vec<RefreshToken> {
        self.lock()
            .map(|g| {
                g.tokens
                    .values()
                    .filter(|t| t.user_id == user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Overwrites the expiry of a stored token.
    pub fn set_token_expiry(&self, id: Uuid, expires_at: OffsetDateTime) {
        if let Ok(mut g) = self.lock() {
            if let Some(t) = g.tokens.get_mut(&id) {
                t.expires_at = expires_at;
            }
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_user_by_id(&self, id: i64) -> anyhow::Result<Option<User>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    async fn find_user_by_login(&self, login: &str) -> anyhow::Result<Option<User>> {
        Ok(self.lock()?.users.values().find(|u| u.login == login).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        Ok(self.lock()?.users.values().find(|u| u.email == email).cloned())
    }

    async fn create_user(&self, user: NewUser) -> Result<User, CreateUserError> {
        let mut g = self.lock()?;
        if g.users.values().any(|u| u.login == user.login) {
            return Err(CreateUserError::LoginTaken);
        }
        if g.users.values().any(|u| u.email == user.email) {
            return Err(CreateUserError::EmailTaken);
        }
        g.next_user_id += 1;
        let now = OffsetDateTime::now_utc();
        let row = User {
            id: g.next_user_id,
            login: user.login,
            email: user.email,
            password_hash: user.password_hash,
            tag: user.tag,
            plan: user.plan,
            plan_date: now,
            recovery_code_hash: None,
            recovery_code_expires_at: None,
            selected_path: None,
            selected_feelings: None,
            test_results: None,
            progress: None,
            created_at: now,
        };
        g.users.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list_users(&self, skip: i64, limit: i64) -> anyhow::Result<Vec<User>> {
        let g = self.lock()?;
        let mut users: Vec<User> = g.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        Ok(users
            .into_iter()
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn set_recovery_code(
        &self,
        user_id: i64,
        code: Option<&RecoveryCode>,
    ) -> anyhow::Result<()> {
        let mut g = self.lock()?;
        if let Some(u) = g.users.get_mut(&user_id) {
            u.recovery_code_hash = code.map(|c| c.hash.clone());
            u.recovery_code_expires_at = code.map(|c| c.expires_at);
        }
        Ok(())
    }

    async fn clear_recovery_code_if(
        &self,
        user_id: i64,
        expected_hash: &str,
    ) -> anyhow::Result<bool> {
        let mut g = self.lock()?;
        match g.users.get_mut(&user_id) {
            Some(u) if u.recovery_code_hash.as_deref() == Some(expected_hash) => {
                u.recovery_code_hash = None;
                u.recovery_code_expires_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_password(&self, user_id: i64, password_hash: &str) -> anyhow::Result<bool> {
        let mut g = self.lock()?;
        let Some(u) = g.users.get_mut(&user_id) else {
            return Ok(false);
        };
        u.password_hash = password_hash.to_string();
        u.recovery_code_hash = None;
        u.recovery_code_expires_at = None;
        Ok(true)
    }

    async fn insert_refresh_token(&self, token: NewRefreshToken) -> anyhow::Result<RefreshToken> {
        Ok(self.lock()?.insert_token(token))
    }

    async fn replace_user_tokens(&self, token: NewRefreshToken) -> anyhow::Result<RefreshToken> {
        let mut g = self.lock()?;
        g.revoke_user(token.user_id, None);
        Ok(g.insert_token(token))
    }

    async fn find_active_refresh_token(
        &self,
        token_hash: &str,
    ) -> anyhow::Result<Option<RefreshToken>> {
        Ok(self
            .lock()?
            .tokens
            .values()
            .find(|t| !t.revoked && t.token_hash == token_hash)
            .cloned())
    }

    async fn touch_refresh_token(
        &self,
        id: Uuid,
        used_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<bool> {
        let mut g = self.lock()?;
        match g.tokens.get_mut(&id) {
            Some(t) if !t.revoked => {
                t.last_used_at = Some(used_at);
                t.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_refresh_token(&self, id: Uuid) -> anyhow::Result<()> {
        if let Some(t) = self.lock()?.tokens.get_mut(&id) {
            t.revoked = true;
        }
        Ok(())
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        used_at: OffsetDateTime,
        replacement: NewRefreshToken,
    ) -> anyhow::Result<Option<RefreshToken>> {
        let mut g = self.lock()?;
        match g.tokens.get_mut(&id) {
            Some(t) if !t.revoked => {
                t.revoked = true;
                t.last_used_at = Some(used_at);
            }
            _ => return Ok(None),
        }
        Ok(Some(g.insert_token(replacement)))
    }

    async fn revoke_user_tokens(
        &self,
        user_id: i64,
        except_hash: Option<&str>,
    ) -> anyhow::Result<u64> {
        Ok(self.lock()?.revoke_user(user_id, except_hash))
    }
}
