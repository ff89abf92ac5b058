//! In-memory fixed-window request throttling keyed by client address and route.
//!
//! Each instance keeps its own table; nothing is shared between processes.

use dashmap::{mapref::entry::Entry, DashMap};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use tracing::debug;

/// Routes with their own ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitedRoute {
    Register,
    Login,
    Refresh,
    PasswordRecovery,
}

impl LimitedRoute {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Login => "login",
            Self::Refresh => "refresh",
            Self::PasswordRecovery => "password_recovery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed {
        remaining: u32,
        reset_at: OffsetDateTime,
    },
    Limited {
        reset_at: OffsetDateTime,
        /// Whole seconds until the window reopens, never zero.
        retry_after: u64,
    },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Record {
    count: u32,
    reset_at: OffsetDateTime,
}

pub struct RateLimiter {
    window: Duration,
    records: DashMap<String, Record>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_window(Duration::hours(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            records: DashMap::new(),
        }
    }

    pub fn check(&self, client: &str, route: LimitedRoute, max_requests: u32) -> RateLimitDecision {
        self.check_at(client, route, max_requests, OffsetDateTime::now_utc())
    }

    pub(crate) fn check_at(
        &self,
        client: &str,
        route: LimitedRoute,
        max_requests: u32,
        now: OffsetDateTime,
    ) -> RateLimitDecision {
        // Must run before entry(): retain locks every shard in turn.
        self.records.retain(|_, r| now < r.reset_at);

        let id = identifier(client, route);
        let fresh = Record {
            count: 1,
            reset_at: now + self.window,
        };

        let decision = match self.records.entry(id) {
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                RateLimitDecision::Allowed {
                    remaining: max_requests.saturating_sub(1),
                    reset_at: fresh.reset_at,
                }
            }
            Entry::Occupied(mut slot) => {
                let rec = slot.get_mut();
                if now >= rec.reset_at {
                    *rec = fresh;
                    RateLimitDecision::Allowed {
                        remaining: max_requests.saturating_sub(1),
                        reset_at: rec.reset_at,
                    }
                } else if rec.count >= max_requests {
                    RateLimitDecision::Limited {
                        reset_at: rec.reset_at,
                        retry_after: seconds_until(now, rec.reset_at),
                    }
                } else {
                    rec.count += 1;
                    RateLimitDecision::Allowed {
                        remaining: max_requests - rec.count,
                        reset_at: rec.reset_at,
                    }
                }
            }
        };

        if !decision.is_allowed() {
            debug!(route = route.as_str(), "rate limit exceeded");
        }
        decision
    }

    /// Number of live records (expired ones are dropped on every check).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn identifier(client: &str, route: LimitedRoute) -> String {
    let digest = Sha256::digest(format!("{}:{}", client, route.as_str()).as_bytes());
    hex::encode(digest)
}

fn seconds_until(now: OffsetDateTime, at: OffsetDateTime) -> u64 {
    let ms = (at - now).whole_milliseconds().max(0) as u64;
    ms.div_ceil(1000).max(1)
}
