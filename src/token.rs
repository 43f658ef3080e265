//! Capability tokens
//!
//! A [`CapabilityToken`] is an immutable value bound to exactly one
//! `(run, permission)` pair. Handlers call [`CapabilityToken::authorize`]
//! with the capability they implement before touching the credential, so a
//! token presented to the wrong handler, or after its expiry, is refused at
//! the point of use.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::credential::Credential;
use crate::error::TokenError;

#[derive(Clone)]
pub struct CapabilityToken {
    id: Uuid,
    run_id: Uuid,
    permission: String,
    scope: String,
    issued_at: Instant,
    expires_at: Instant,
    credential: Arc<Credential>,
}

impl CapabilityToken {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn permission(&self) -> &str {
        &self.permission
    }

    /// Capability this token may be presented to
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left before expiry (zero once expired)
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Check scope and expiry, then hand out the underlying credential
    pub fn authorize(&self, capability: &str) -> Result<&Credential, TokenError> {
        if self.scope != capability {
            return Err(TokenError::ScopeMismatch {
                expected: capability.to_string(),
                actual: self.scope.clone(),
            });
        }
        if self.is_expired() {
            return Err(TokenError::Expired {
                permission: self.permission.clone(),
            });
        }
        Ok(&self.credential)
    }

    /// Opaque bearer form used by the remote adapter
    pub fn bearer(&self) -> String {
        format!("cap_{}", self.id.simple())
    }
}

impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityToken")
            .field("id", &self.id)
            .field("run_id", &self.run_id)
            .field("scope", &self.scope)
            .field("remaining", &self.remaining())
            .field("provider", &self.credential.provider)
            .finish_non_exhaustive()
    }
}

/// Issues tokens with `expires_at = min(run deadline, now + max_ttl)`
#[derive(Debug, Clone)]
pub struct TokenMinter {
    max_ttl: Duration,
}

impl TokenMinter {
    pub fn new(max_ttl: Duration) -> Self {
        Self { max_ttl }
    }

    pub fn max_ttl(&self) -> Duration {
        self.max_ttl
    }

    pub fn mint(
        &self,
        run_id: Uuid,
        permission: &str,
        credential: Arc<Credential>,
        run_deadline: Instant,
    ) -> CapabilityToken {
        let now = Instant::now();
        let expires_at = run_deadline.min(now + self.max_ttl);

        tracing::debug!(
            %run_id,
            permission,
            ttl_ms = expires_at.saturating_duration_since(now).as_millis() as u64,
            "capability token minted"
        );

        CapabilityToken {
            id: Uuid::new_v4(),
            run_id,
            permission: permission.to_string(),
            scope: permission.to_string(),
            issued_at: now,
            expires_at,
            credential,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CredentialSource, Secret};

    fn credential() -> Arc<Credential> {
        Arc::new(Credential::new(
            None,
            "openai",
            CredentialSource::PlatformTry,
            Secret::new("sk-test"),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_min_of_deadline_and_ttl() {
        let minter = TokenMinter::new(Duration::from_secs(60));
        let now = Instant::now();

        let short = minter.mint(Uuid::new_v4(), "llm.complete", credential(), now + Duration::from_secs(5));
        assert_eq!(short.expires_at(), now + Duration::from_secs(5));

        let long = minter.mint(Uuid::new_v4(), "llm.complete", credential(), now + Duration::from_secs(600));
        assert_eq!(long.expires_at(), now + Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn token_is_rejected_by_other_capabilities() {
        let minter = TokenMinter::new(Duration::from_secs(60));
        let token = minter.mint(
            Uuid::new_v4(),
            "llm.complete",
            credential(),
            Instant::now() + Duration::from_secs(10),
        );

        assert!(token.authorize("llm.complete").is_ok());
        for other in ["openai.chat", "email.send", "http.fetch", "image.transform"] {
            assert_eq!(
                token.authorize(other).unwrap_err(),
                TokenError::ScopeMismatch {
                    expected: other.to_string(),
                    actual: "llm.complete".to_string()
                }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_is_rejected() {
        let minter = TokenMinter::new(Duration::from_millis(100));
        let token = minter.mint(
            Uuid::new_v4(),
            "email.send",
            credential(),
            Instant::now() + Duration::from_secs(10),
        );

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(token.is_expired());
        assert_eq!(
            token.authorize("email.send").unwrap_err(),
            TokenError::Expired {
                permission: "email.send".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn debug_never_shows_secret() {
        let minter = TokenMinter::new(Duration::from_secs(1));
        let token = minter.mint(Uuid::new_v4(), "llm.complete", credential(), Instant::now() + Duration::from_secs(1));
        let printed = format!("{:?}", token);
        assert!(!printed.contains("sk-test"));
        assert!(token.bearer().starts_with("cap_"));
        assert!(!token.bearer().contains("sk-test"));
    }
}
