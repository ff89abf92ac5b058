use std::sync::Arc;

use rand::{rngs::OsRng, Rng};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use super::RecoveryError;
use crate::{
    auth::password::SecretHasher,
    notify::Notifier,
    store::{CredentialStore, RecoveryCode, User},
};

const CODE_LEN: usize = 4;

pub struct RecoveryService {
    store: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,
    hasher: SecretHasher,
    code_ttl: Duration,
}

impl RecoveryService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        notifier: Arc<dyn Notifier>,
        hasher: SecretHasher,
        code_ttl_minutes: i64,
    ) -> Self {
        Self {
            store,
            notifier,
            hasher,
            code_ttl: Duration::minutes(code_ttl_minutes),
        }
    }

    /// Issues a fresh code and mails it. Unknown emails succeed without
    /// touching storage. If the mail cannot be sent, this request's code is
    /// cleared again (a code stored since by another request is kept) and
    /// `DeliveryFailed` is returned.
    pub async fn request(&self, email: &str) -> Result<(), RecoveryError> {
        let Some(user) = self.store.find_user_by_email(email).await? else {
            info!("recovery requested for unknown email");
            return Ok(());
        };

        let code = generate_code();
        let pending = RecoveryCode {
            hash: self.hasher.hash_async(&code).await?,
            expires_at: OffsetDateTime::now_utc() + self.code_ttl,
        };
        self.store.set_recovery_code(user.id, Some(&pending)).await?;

        if !self
            .notifier
            .send_recovery_code(&user.email, &user.login, &code)
            .await
        {
            self.store
                .clear_recovery_code_if(user.id, &pending.hash)
                .await?;
            warn!(user_id = user.id, "recovery code not delivered; rolled back");
            return Err(RecoveryError::DeliveryFailed);
        }

        info!(user_id = user.id, "recovery code issued");
        Ok(())
    }

    /// Checks a code without consuming it.
    pub async fn verify(&self, email: &str, code: &str) -> Result<(), RecoveryError> {
        self.check(email, code).await.map(|_| ())
    }

    /// Verifies the code, then sets the new password and clears the code in
    /// one write, and revokes every refresh token of the account. Any
    /// verification failure is returned untouched.
    pub async fn reset(
        &self,
        email: &str,
        code: &str,
        new_password: &str,
    ) -> Result<(), RecoveryError> {
        let user = self.check(email, code).await?;
        let password_hash = self.hasher.hash_async(new_password).await?;
        if !self.store.reset_password(user.id, &password_hash).await? {
            return Err(RecoveryError::UserNotFound);
        }
        let revoked = self.store.revoke_user_tokens(user.id, None).await?;
        info!(user_id = user.id, revoked, "password reset");
        Ok(())
    }

    async fn check(&self, email: &str, code: &str) -> Result<User, RecoveryError> {
        let Some(user) = self.store.find_user_by_email(email).await? else {
            return Err(RecoveryError::InvalidCode);
        };
        let Some(pending) = user.recovery_code() else {
            return Err(RecoveryError::NoCodeRequested);
        };

        if OffsetDateTime::now_utc() >= pending.expires_at {
            self.store
                .clear_recovery_code_if(user.id, &pending.hash)
                .await?;
            info!(user_id = user.id, "expired recovery code cleared");
            return Err(RecoveryError::CodeExpired);
        }

        if !is_well_formed(code) || !self.hasher.verify_async(code, &pending.hash).await? {
            return Err(RecoveryError::InvalidCode);
        }
        Ok(user)
    }
}

/// Four independent uniform digits; leading zeros allowed.
fn generate_code() -> String {
    let mut rng = OsRng;
    (0..CODE_LEN)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

fn is_well_formed(code: &str) -> bool {
    code.len() == CODE_LEN && code.bytes().all(|b| b.is_ascii_digit())
}
