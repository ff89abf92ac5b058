use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};

use super::{templates, Notifier};
use crate::config::EmailConfig;

const BREVO_SEND_URL: &str = "https://api.brevo.com/v3/smtp/email";

/// Transactional email through the Brevo HTTP API.
#[derive(Clone)]
pub struct BrevoNotifier {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    sender_email: String,
    sender_name: String,
    code_ttl_minutes: i64,
}

#[derive(Serialize)]
struct Contact<'a> {
    email: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendEmail<'a> {
    sender: Contact<'a>,
    to: [Contact<'a>; 1],
    subject: &'a str,
    html_content: &'a str,
}

impl BrevoNotifier {
    pub fn new(api_key: String, cfg: &EmailConfig, code_ttl_minutes: i64) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            api_key,
            endpoint: BREVO_SEND_URL.to_string(),
            sender_email: cfg.sender_email.clone(),
            sender_name: cfg.sender_name.clone(),
            code_ttl_minutes,
        })
    }

    async fn send(&self, to: &str, message: templates::Message) -> bool {
        let name = to.split('@').next().unwrap_or(to);
        let payload = SendEmail {
            sender: Contact {
                email: &self.sender_email,
                name: &self.sender_name,
            },
            to: [Contact { email: to, name }],
            subject: &message.subject,
            html_content: &message.html,
        };

        let res = self
            .http
            .post(&self.endpoint)
            .header("api-key", &self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&payload)
            .send()
            .await;

        match res {
            Ok(r) if r.status().as_u16() == 200 || r.status().as_u16() == 201 => {
                info!(%to, "email sent");
                true
            }
            Ok(r) => {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                error!(%to, %status, %body, "email provider rejected message");
                false
            }
            Err(e) => {
                error!(%to, error = %e, "email provider unreachable");
                false
            }
        }
    }
}

#[async_trait]
impl Notifier for BrevoNotifier {
    async fn send_recovery_code(&self, email: &str, login: &str, code: &str) -> bool {
        self.send(email, templates::recovery_code(login, code, self.code_ttl_minutes))
            .await
    }

    async fn send_welcome(&self, email: &str, login: &str, plan: &str) -> bool {
        self.send(email, templates::welcome(login, email, plan)).await
    }
}
