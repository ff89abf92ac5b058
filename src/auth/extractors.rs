use std::{convert::Infallible, net::SocketAddr};

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{header::USER_AGENT, request::Parts},
};

use super::service::ClientMeta;

/// Key used for throttling when the peer address is not available.
const UNKNOWN_CLIENT: &str = "unknown";

/// Peer address and User-Agent of the caller.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    /// Identifier fed to the rate limiter.
    pub fn key(&self) -> &str {
        self.ip.as_deref().unwrap_or(UNKNOWN_CLIENT)
    }

    pub fn meta(&self) -> ClientMeta {
        ClientMeta {
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Ok(ClientInfo { ip, user_agent })
    }
}
