//! Quota and timeout governance
//!
//! The [`Governor`] turns manifest limits plus platform ceilings into a
//! per-run [`Budget`]. A budget is owned by exactly one run; nothing in it is
//! shared, so counters cannot leak between runs.
//!
//! Ceilings per mode (defaults, see [`PlatformLimits`]):
//!
//! | Mode | Wall clock | Tokens |
//! |------|-----------|--------|
//! | `try` | 10 s | 4 000 |
//! | `use` | 120 s | 100 000 |

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::PlatformLimits;
use crate::error::QuotaError;
use crate::manifest::{Engine, Manifest, NetworkPolicy};
use crate::net::outbound_host;
use crate::runtime::RunMode;

#[derive(Debug, Clone)]
pub struct Governor {
    limits: PlatformLimits,
}

impl Governor {
    pub fn new(limits: PlatformLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &PlatformLimits {
        &self.limits
    }

    /// Effective wall-clock limit: manifest value clamped to the mode ceiling
    pub fn timeout_ms(&self, manifest: &Manifest, mode: RunMode) -> u64 {
        let ceiling = match mode {
            RunMode::Try => self.limits.try_timeout_ceiling_ms,
            RunMode::Use => self.limits.use_timeout_ceiling_ms,
        };
        manifest.limits.timeout_ms.map_or(ceiling, |ms| ms.min(ceiling))
    }

    pub fn token_budget(&self, manifest: &Manifest, mode: RunMode) -> u64 {
        let ceiling = match mode {
            RunMode::Try => self.limits.try_token_ceiling,
            RunMode::Use => self.limits.use_token_ceiling,
        };
        manifest.limits.token_budget.map_or(ceiling, |t| t.min(ceiling))
    }

    /// Start the clock for one run
    pub fn budget(&self, manifest: &Manifest, mode: RunMode) -> Budget {
        let timeout_ms = self.timeout_ms(manifest, mode);
        let token_budget = self.token_budget(manifest, mode);

        // A remote app's own endpoint is implicitly allowed
        let mut hosts = manifest.limits.network.allowed_hosts().to_vec();
        if let Engine::Remote(target) = &manifest.engine {
            if let Ok(parsed) = url::Url::parse(&target.url) {
                if let Some(host) = parsed.host_str() {
                    hosts.push(host.to_string());
                }
            }
        }

        debug!(
            app_id = %manifest.id,
            mode = %mode,
            timeout_ms,
            token_budget,
            "budget opened"
        );

        let started = Instant::now();
        Budget {
            started,
            deadline: started + Duration::from_millis(timeout_ms),
            timeout_ms,
            token_budget,
            tokens_used: 0,
            network: NetworkPolicy::new(hosts),
            allow_private: self.limits.allow_private_hosts,
        }
    }
}

/// Per-run quota state
#[derive(Debug, Clone)]
pub struct Budget {
    started: Instant,
    deadline: Instant,
    timeout_ms: u64,
    token_budget: u64,
    tokens_used: u64,
    network: NetworkPolicy,
    allow_private: bool,
}

impl Budget {
    /// Deadline and token checks; run before every step
    pub fn check_budget(&self) -> Result<(), QuotaError> {
        if Instant::now() >= self.deadline {
            return Err(QuotaError::Deadline {
                limit_ms: self.timeout_ms,
            });
        }
        if self.tokens_used >= self.token_budget {
            return Err(QuotaError::TokenBudget {
                used: self.tokens_used,
                budget: self.token_budget,
            });
        }
        Ok(())
    }

    /// SSRF guard, then allowlist membership of the URL's host
    pub fn check_url(&self, url: &str) -> Result<(), QuotaError> {
        let host = outbound_host(url, self.allow_private).map_err(|reason| QuotaError::Network {
            host: url::Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(String::from))
                .unwrap_or_default(),
            reason,
        })?;

        if !self.network.permits_host(&host) {
            return Err(QuotaError::Network {
                host,
                reason: "not in the app's network allowlist".to_string(),
            });
        }
        Ok(())
    }

    pub fn record_tokens(&mut self, tokens: u64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    pub fn token_budget(&self) -> u64 {
        self.token_budget
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline (zero once passed)
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
