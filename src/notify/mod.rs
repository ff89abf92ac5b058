//! Outbound email. Sends are best-effort and report success as a bool;
//! callers decide whether a failed send matters.

mod brevo;
mod templates;

pub use brevo::BrevoNotifier;

use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_recovery_code(&self, email: &str, login: &str, code: &str) -> bool;
    async fn send_welcome(&self, email: &str, login: &str, plan: &str) -> bool;
}

/// Stand-in used when no email provider is configured. Nothing leaves the
/// process; sends are logged and reported as delivered.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_recovery_code(&self, email: &str, login: &str, _code: &str) -> bool {
        warn!(%email, %login, "email provider not configured; recovery code not sent");
        true
    }

    async fn send_welcome(&self, email: &str, login: &str, plan: &str) -> bool {
        warn!(%email, %login, %plan, "email provider not configured; welcome email not sent");
        true
    }
}
