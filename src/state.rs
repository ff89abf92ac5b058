use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    auth::{extractors::ClientInfo, jwt::JwtKeys, password::SecretHasher, service::AuthService},
    config::AppConfig,
    error::AppError,
    notify::{BrevoNotifier, LogNotifier, Notifier},
    rate_limit::{LimitedRoute, RateLimitDecision, RateLimiter},
    recovery::RecoveryService,
    store::{CredentialStore, PgStore},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn CredentialStore>,
    pub limiter: Arc<RateLimiter>,
    pub jwt: JwtKeys,
    pub auth: Arc<AuthService>,
    pub recovery: Arc<RecoveryService>,
}

impl AppState {
    /// Connects to Postgres, applies migrations and picks a notifier.
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let db = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&db).await?;
        info!("database migrations applied");

        let notifier: Arc<dyn Notifier> = match &config.email.brevo_api_key {
            Some(key) => Arc::new(BrevoNotifier::new(
                key.clone(),
                &config.email,
                config.session.recovery_code_ttl_minutes,
            )?),
            None => {
                warn!("BREVO_API_KEY not set; emails will only be logged");
                Arc::new(LogNotifier)
            }
        };

        let store = Arc::new(PgStore::new(db)) as Arc<dyn CredentialStore>;
        Self::from_parts(config, store, notifier)
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        store: Arc<dyn CredentialStore>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        let hasher = SecretHasher::new(&config.hashing)?;
        let jwt = JwtKeys::new(&config.jwt);

        let auth = Arc::new(AuthService::new(
            store.clone(),
            notifier.clone(),
            hasher.clone(),
            jwt.clone(),
            &config.session,
        )?);
        let recovery = Arc::new(RecoveryService::new(
            store.clone(),
            notifier,
            hasher,
            config.session.recovery_code_ttl_minutes,
        ));

        Ok(Self {
            config,
            store,
            limiter: Arc::new(RateLimiter::new()),
            jwt,
            auth,
            recovery,
        })
    }

    /// Counts the request against the route's ceiling; `Err` once exhausted.
    pub fn throttle(&self, client: &ClientInfo, route: LimitedRoute) -> Result<(), AppError> {
        let limits = &self.config.rate_limits;
        let (max, message) = match route {
            LimitedRoute::Register => (
                limits.register,
                "Too many registration attempts. Try again later.",
            ),
            LimitedRoute::Login => (limits.login, "Too many login attempts. Try again later."),
            LimitedRoute::Refresh => (
                limits.refresh,
                "Too many token refresh attempts. Try again later.",
            ),
            LimitedRoute::PasswordRecovery => (
                limits.password_recovery,
                "Too many password recovery attempts. Try again later.",
            ),
        };

        match self.limiter.check(client.key(), route, max) {
            RateLimitDecision::Allowed { .. } => Ok(()),
            RateLimitDecision::Limited {
                reset_at,
                retry_after,
            } => {
                warn!(route = route.as_str(), retry_after, "request throttled");
                Err(AppError::RateLimited {
                    message,
                    reset_at,
                    retry_after,
                })
            }
        }
    }

    /// State over the in-memory store, with a notifier the test can inspect.
    #[cfg(test)]
    pub fn fake() -> (Self, Arc<crate::store::MemoryStore>, Arc<crate::notify::testing::RecordingNotifier>) {
        let store = Arc::new(crate::store::MemoryStore::new());
        let notifier = Arc::new(crate::notify::testing::RecordingNotifier::default());
        let state = Self::from_parts(
            Arc::new(AppConfig::test_default()),
            store.clone(),
            notifier.clone(),
        )
        .expect("test state");
        (state, store, notifier)
    }
}
