//! Credential verification and the access/refresh token lifecycle.
//!
//! Access tokens are stateless JWTs and cannot be revoked before they expire.
//! Refresh tokens are opaque random strings tracked server-side by digest.
//! What happens on redemption depends on [`RefreshRotation`]:
//!
//! * `Rotate`: the presented token is revoked and a replacement with a fresh
//!   30-day expiry is returned. Replaying the old string fails.
//! * `Slide`: the presented token stays valid, its expiry moves to now + 30
//!   days and the same string is handed back.

use std::sync::Arc;

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use super::{jwt::JwtKeys, password::SecretHasher};
use crate::{
    config::{RefreshRotation, SessionConfig},
    notify::Notifier,
    store::{CreateUserError, CredentialStore, NewRefreshToken, NewUser, User},
};

const REFRESH_TOKEN_BYTES: usize = 64;
/// Verified against when the login is unknown, so both failure paths pay
/// for one Argon2 run.
const DUMMY_PASSWORD: &str = "edenmap-no-such-account";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid or expired refresh token")]
    InvalidRefreshToken,
    #[error("login already registered")]
    LoginTaken,
    #[error("email already registered")]
    EmailTaken,
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

/// Where a token request came from; stored with every refresh token.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub user: User,
}

#[derive(Debug)]
pub struct Redeemed {
    pub user: User,
    /// The refresh token the client should keep from now on.
    pub refresh_token: String,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub login: String,
    pub email: String,
    pub password: String,
    pub tag: String,
    pub plan: String,
}

pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,
    hasher: SecretHasher,
    dummy_hash: String,
    jwt: JwtKeys,
    refresh_ttl: Duration,
    rotation: RefreshRotation,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        notifier: Arc<dyn Notifier>,
        hasher: SecretHasher,
        jwt: JwtKeys,
        session: &SessionConfig,
    ) -> anyhow::Result<Self> {
        let dummy_hash = hasher.hash(DUMMY_PASSWORD)?;
        Ok(Self {
            store,
            notifier,
            hasher,
            dummy_hash,
            jwt,
            refresh_ttl: Duration::days(session.refresh_ttl_days),
            rotation: session.rotation,
        })
    }

    /// Checks login + password and starts a new session lineage: every
    /// refresh token the user held before is revoked.
    pub async fn login(
        &self,
        login: &str,
        password: &str,
        meta: &ClientMeta,
    ) -> Result<TokenPair, AuthError> {
        let Some(user) = self.store.find_user_by_login(login).await? else {
            self.hasher.verify_async(password, &self.dummy_hash).await?;
            warn!("login for unknown account");
            return Err(AuthError::InvalidCredentials);
        };

        if !self
            .hasher
            .verify_async(password, &user.password_hash)
            .await?
        {
            warn!(user_id = user.id, "login with wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        let (refresh_token, row) = self.mint_refresh(user.id, meta);
        self.store.replace_user_tokens(row).await?;
        let access_token = self.jwt.sign_access(&user)?;

        info!(user_id = user.id, "user logged in");
        Ok(TokenPair {
            access_token,
            refresh_token,
            user,
        })
    }

    /// Redeems a refresh token and signs a new access token for its owner.
    pub async fn refresh(&self, token: &str, meta: &ClientMeta) -> Result<TokenPair, AuthError> {
        let Redeemed {
            user,
            refresh_token,
        } = self.redeem(token, meta).await?;
        let access_token = self.jwt.sign_access(&user)?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            user,
        })
    }

    pub async fn redeem(&self, token: &str, meta: &ClientMeta) -> Result<Redeemed, AuthError> {
        let digest = digest_token(token);
        let Some(row) = self.store.find_active_refresh_token(&digest).await? else {
            return Err(AuthError::InvalidRefreshToken);
        };

        let now = OffsetDateTime::now_utc();
        if row.expires_at <= now {
            self.store.revoke_refresh_token(row.id).await?;
            info!(user_id = row.user_id, token_id = %row.id, "expired refresh token revoked");
            return Err(AuthError::InvalidRefreshToken);
        }

        let refresh_token = match self.rotation {
            RefreshRotation::Slide => {
                let extended = self
                    .store
                    .touch_refresh_token(row.id, now, now + self.refresh_ttl)
                    .await?;
                if !extended {
                    return Err(AuthError::InvalidRefreshToken);
                }
                token.to_string()
            }
            RefreshRotation::Rotate => {
                let (plain, replacement) = self.mint_refresh(row.user_id, meta);
                self.store
                    .rotate_refresh_token(row.id, now, replacement)
                    .await?
                    .ok_or(AuthError::InvalidRefreshToken)?;
                plain
            }
        };

        let user = self
            .store
            .find_user_by_id(row.user_id)
            .await?
            .ok_or(AuthError::InvalidRefreshToken)?;

        Ok(Redeemed {
            user,
            refresh_token,
        })
    }

    /// Revokes every live refresh token of a user, optionally sparing one.
    pub async fn revoke_all(&self, user_id: i64, except_token: Option<&str>) -> anyhow::Result<u64> {
        let except = except_token.map(digest_token);
        let n = self
            .store
            .revoke_user_tokens(user_id, except.as_deref())
            .await?;
        info!(user_id, revoked = n, "refresh tokens revoked");
        Ok(n)
    }

    /// Creates the account and opens a first session. The welcome mail is
    /// best-effort: a failed send is logged and otherwise ignored.
    pub async fn register(
        &self,
        reg: Registration,
        meta: &ClientMeta,
    ) -> Result<TokenPair, AuthError> {
        let password_hash = self.hasher.hash_async(&reg.password).await?;
        let user = self
            .store
            .create_user(NewUser {
                login: reg.login,
                email: reg.email,
                password_hash,
                tag: reg.tag,
                plan: reg.plan,
            })
            .await
            .map_err(|e| match e {
                CreateUserError::LoginTaken => AuthError::LoginTaken,
                CreateUserError::EmailTaken => AuthError::EmailTaken,
                CreateUserError::Other(err) => AuthError::Internal(err),
            })?;

        if !self
            .notifier
            .send_welcome(&user.email, &user.login, &user.plan)
            .await
        {
            warn!(user_id = user.id, "welcome email not delivered");
        }

        let (refresh_token, row) = self.mint_refresh(user.id, meta);
        self.store.insert_refresh_token(row).await?;
        let access_token = self.jwt.sign_access(&user)?;

        info!(user_id = user.id, "user registered");
        Ok(TokenPair {
            access_token,
            refresh_token,
            user,
        })
    }

    fn mint_refresh(&self, user_id: i64, meta: &ClientMeta) -> (String, NewRefreshToken) {
        let plain = generate_refresh_token();
        let row = NewRefreshToken {
            user_id,
            token_hash: digest_token(&plain),
            expires_at: OffsetDateTime::now_utc() + self.refresh_ttl,
            ip_address: meta.ip.clone(),
            user_agent: meta.user_agent.clone(),
        };
        (plain, row)
    }
}

/// 64 bytes from the OS CSPRNG, URL-safe base64 without padding.
fn generate_refresh_token() -> String {
    let mut buf = [0u8; REFRESH_TOKEN_BYTES];
    OsRng.fill_bytes(&mut buf);
    Base64UrlUnpadded::encode_string(&buf)
}

pub(crate) fn digest_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{AppConfig, RefreshRotation},
        notify::testing::RecordingNotifier,
        store::MemoryStore,
    };

    struct Harness {
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        service: AuthService,
        hasher: SecretHasher,
    }

    fn harness(rotation: RefreshRotation) -> Harness {
        let mut cfg = AppConfig::test_default();
        cfg.session.rotation = rotation;
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let hasher = SecretHasher::new(&cfg.hashing).unwrap();
        let service = AuthService::new(
            store.clone(),
            notifier.clone(),
            hasher.clone(),
            JwtKeys::new(&cfg.jwt),
            &cfg.session,
        )
        .unwrap();
        Harness {
            store,
            notifier,
            service,
            hasher,
        }
    }

    async fn seed_alice(h: &Harness) -> User {
        h.store
            .create_user(NewUser {
                login: "alice".into(),
                email: "alice@example.com".into(),
                password_hash: h.hasher.hash("P@ss1").unwrap(),
                tag: "client".into(),
                plan: "trial".into(),
            })
            .await
            .unwrap()
    }

    fn meta() -> ClientMeta {
        ClientMeta {
            ip: Some("203.0.113.7".into()),
            user_agent: Some("tests/1.0".into()),
        }
    }

    #[tokio::test]
    async fn login_issues_pair_and_records_client() {
        let h = harness(RefreshRotation::Rotate);
        let alice = seed_alice(&h).await;

        let pair = h.service.login("alice", "P@ss1", &meta()).await.unwrap();
        assert_eq!(pair.user.id, alice.id);
        assert!(pair.refresh_token.len() >= 86);
        assert!(!pair.access_token.is_empty());

        let tokens = h.store.tokens_of(alice.id);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].token_hash, digest_token(&pair.refresh_token));
        assert_ne!(tokens[0].token_hash, pair.refresh_token);
        assert_eq!(tokens[0].ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(tokens[0].user_agent.as_deref(), Some("tests/1.0"));
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() {
        let h = harness(RefreshRotation::Rotate);
        seed_alice(&h).await;

        let unknown = h.service.login("mallory", "P@ss1", &meta()).await.unwrap_err();
        let wrong = h.service.login("alice", "nope", &meta()).await.unwrap_err();
        assert!(matches!(unknown, AuthError::InvalidCredentials));
        assert!(matches!(wrong, AuthError::InvalidCredentials));
        assert_eq!(unknown.to_string(), wrong.to_string());
    }

    #[tokio::test]
    async fn unknown_login_still_runs_the_hasher() {
        let h = harness(RefreshRotation::Rotate);
        seed_alice(&h).await;

        let before = h.hasher.verification_count();
        let err = h.service.login("mallory", "P@ss1", &meta()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        assert_eq!(h.hasher.verification_count(), before + 1);

        h.service.login("alice", "wrong", &meta()).await.unwrap_err();
        assert_eq!(h.hasher.verification_count(), before + 2);
    }

    #[tokio::test]
    async fn second_login_revokes_first_lineage() {
        let h = harness(RefreshRotation::Rotate);
        seed_alice(&h).await;

        let first = h.service.login("alice", "P@ss1", &meta()).await.unwrap();
        let second = h.service.login("alice", "P@ss1", &meta()).await.unwrap();

        let err = h.service.refresh(&first.refresh_token, &meta()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidRefreshToken));
        assert!(h.service.refresh(&second.refresh_token, &meta()).await.is_ok());
    }

    #[tokio::test]
    async fn rotate_replaces_token_and_blocks_replay() {
        let h = harness(RefreshRotation::Rotate);
        let alice = seed_alice(&h).await;
        let pair = h.service.login("alice", "P@ss1", &meta()).await.unwrap();
        let before = h.store.tokens_of(alice.id)[0].clone();

        let refreshed = h.service.refresh(&pair.refresh_token, &meta()).await.unwrap();
        assert_ne!(refreshed.refresh_token, pair.refresh_token);
        assert_eq!(refreshed.user.id, alice.id);

        let rows = h.store.tokens_of(alice.id);
        let old = rows.iter().find(|t| t.id == before.id).unwrap();
        assert!(old.revoked);
        assert!(old.last_used_at.is_some());
        let new = rows.iter().find(|t| !t.revoked).unwrap();
        assert!(new.expires_at > before.expires_at);

        let replay = h.service.refresh(&pair.refresh_token, &meta()).await.unwrap_err();
        assert!(matches!(replay, AuthError::InvalidRefreshToken));
    }

    #[tokio::test]
    async fn slide_extends_the_same_token() {
        let h = harness(RefreshRotation::Slide);
        let alice = seed_alice(&h).await;
        let pair = h.service.login("alice", "P@ss1", &meta()).await.unwrap();
        let before = h.store.tokens_of(alice.id)[0].clone();
        assert!(before.last_used_at.is_none());

        let refreshed = h.service.refresh(&pair.refresh_token, &meta()).await.unwrap();
        assert_eq!(refreshed.refresh_token, pair.refresh_token);

        let after = h.store.tokens_of(alice.id)[0].clone();
        assert_eq!(after.id, before.id);
        assert!(!after.revoked);
        assert!(after.expires_at > before.expires_at);
        assert!(after.last_used_at.is_some());

        // still usable
        assert!(h.service.refresh(&pair.refresh_token, &meta()).await.is_ok());
    }

    #[tokio::test]
    async fn expired_token_is_revoked_on_redeem() {
        let h = harness(RefreshRotation::Slide);
        let alice = seed_alice(&h).await;
        let pair = h.service.login("alice", "P@ss1", &meta()).await.unwrap();
        let row = h.store.tokens_of(alice.id)[0].clone();
        h.store
            .set_token_expiry(row.id, OffsetDateTime::now_utc() - Duration::seconds(1));

        let err = h.service.refresh(&pair.refresh_token, &meta()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidRefreshToken));
        assert!(h.store.tokens_of(alice.id)[0].revoked);
    }

    #[tokio::test]
    async fn unknown_refresh_token_fails() {
        let h = harness(RefreshRotation::Rotate);
        let err = h.service.refresh("not-a-token", &meta()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidRefreshToken));
    }

    #[tokio::test]
    async fn revoke_all_can_spare_current_session() {
        let h = harness(RefreshRotation::Slide);
        let alice = seed_alice(&h).await;
        let pair = h.service.login("alice", "P@ss1", &meta()).await.unwrap();
        let (_, extra) = h.service.mint_refresh(alice.id, &meta());
        h.store.insert_refresh_token(extra).await.unwrap();

        let n = h
            .service
            .revoke_all(alice.id, Some(&pair.refresh_token))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert!(h.service.refresh(&pair.refresh_token, &meta()).await.is_ok());

        h.service.revoke_all(alice.id, None).await.unwrap();
        assert!(h.service.refresh(&pair.refresh_token, &meta()).await.is_err());
    }

    #[tokio::test]
    async fn register_survives_failed_welcome_mail() {
        let h = harness(RefreshRotation::Rotate);
        h.notifier.fail_sends(true);

        let pair = h
            .service
            .register(
                Registration {
                    login: "bob".into(),
                    email: "bob@example.com".into(),
                    password: "hunter22!".into(),
                    tag: "client".into(),
                    plan: "trial".into(),
                },
                &meta(),
            )
            .await
            .unwrap();

        assert_eq!(pair.user.login, "bob");
        assert_eq!(h.notifier.welcomes().len(), 1);
        assert!(h.service.login("bob", "hunter22!", &meta()).await.is_ok());
    }

    #[tokio::test]
    async fn register_rejects_duplicates() {
        let h = harness(RefreshRotation::Rotate);
        seed_alice(&h).await;
        let reg = |login: &str, email: &str| Registration {
            login: login.into(),
            email: email.into(),
            password: "whatever1".into(),
            tag: "client".into(),
            plan: "trial".into(),
        };

        let err = h
            .service
            .register(reg("alice", "new@example.com"), &meta())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::LoginTaken));

        let err = h
            .service
            .register(reg("someone", "alice@example.com"), &meta())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::EmailTaken));
    }

    #[test]
    fn refresh_tokens_are_url_safe_and_unique() {
        let a = generate_refresh_token();
        let b = generate_refresh_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 86);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
