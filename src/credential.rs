//! Credential Resolver
//!
//! Turns `(user, permission, mode, fallback_allowed)` into a usable
//! [`Credential`]:
//!
//! | Mode | Order |
//! |------|-------|
//! | `use` | user secret from the vault, then platform key if `fallback_allowed` |
//! | `try` | constrained platform key only, user secrets are never read |
//!
//! Secret material lives in [`Secret`], whose `Debug` is redacted. The
//! resolver never logs or stores it; callers hold it for one run at most.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::CredentialError;
use crate::runtime::RunMode;

/// Decrypted secret material (API key). Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw value, for building the downstream request only
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Where a resolved credential came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// The caller's own key (BYOK)
    User,
    /// Platform-wide key (use-mode fallback)
    Platform,
    /// Constrained platform key (try mode)
    PlatformTry,
    /// Capability needs no provider credential
    Anonymous,
}

#[derive(Clone)]
pub struct Credential {
    pub user_id: Option<String>,
    pub provider: String,
    pub source: CredentialSource,
    secret: Secret,
}

impl Credential {
    pub fn new(
        user_id: Option<String>,
        provider: impl Into<String>,
        source: CredentialSource,
        secret: Secret,
    ) -> Self {
        Self {
            user_id,
            provider: provider.into(),
            source,
            secret,
        }
    }

    /// Credential for capabilities that call no keyed provider (e.g. `http.fetch`)
    pub fn anonymous(user_id: Option<String>) -> Self {
        Self::new(user_id, "none", CredentialSource::Anonymous, Secret::new(""))
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("source", &self.source)
            .field("secret", &self.secret)
            .finish()
    }
}

// ═══════════════════════════════════════════
// COLLABORATORS
// ═══════════════════════════════════════════

/// External encrypted vault of user-owned provider keys (read-only here)
#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn user_secret(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<Secret>, CredentialError>;
}

/// Vault backed by a concurrent map, for tests and the CLI `--secrets` file
#[derive(Default)]
pub struct InMemoryVault {
    secrets: DashMap<(String, String), Secret>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: impl Into<String>, provider: impl Into<String>, secret: Secret) {
        self.secrets.insert((user_id.into(), provider.into()), secret);
    }

    pub fn with_secret(
        self,
        user_id: impl Into<String>,
        provider: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        self.insert(user_id, provider, Secret::new(secret));
        self
    }

    /// Load `{ "<user>": { "<provider>": "<key>" } }`
    pub fn from_json(json: &str) -> Result<Self, CredentialError> {
        let parsed: BTreeMap<String, BTreeMap<String, String>> =
            serde_json::from_str(json).map_err(|e| CredentialError::Vault {
                reason: format!("invalid secrets file: {}", e),
            })?;

        let vault = Self::new();
        for (user, providers) in parsed {
            for (provider, key) in providers {
                vault.insert(user.clone(), provider, Secret::new(key));
            }
        }
        Ok(vault)
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[async_trait]
impl CredentialVault for InMemoryVault {
    async fn user_secret(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<Secret>, CredentialError> {
        Ok(self
            .secrets
            .get(&(user_id.to_string(), provider.to_string()))
            .map(|s| s.value().clone())
            .filter(|s| !s.is_empty()))
    }
}

/// Platform-owned keys. `constrained` selects the try-mode key set.
pub trait PlatformCredentialProvider: Send + Sync {
    fn platform_credential(&self, provider: &str, constrained: bool) -> Option<Secret>;
}

/// Platform keys taken from [`RuntimeConfig`]
#[derive(Default)]
pub struct ConfigPlatformCredentials {
    full: BTreeMap<String, Secret>,
    constrained: BTreeMap<String, Secret>,
}

impl ConfigPlatformCredentials {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let wrap = |keys: &BTreeMap<String, String>| {
            keys.iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, v)| (k.clone(), Secret::new(v.clone())))
                .collect()
        };
        Self {
            full: wrap(&config.platform),
            constrained: wrap(&config.platform_try),
        }
    }

    /// Same key for every provider in both sets (mock runs)
    pub fn uniform(providers: &[&str], key: &str) -> Self {
        let keys: BTreeMap<String, Secret> = providers
            .iter()
            .map(|p| (p.to_string(), Secret::new(key)))
            .collect();
        Self {
            full: keys.clone(),
            constrained: keys,
        }
    }
}

impl PlatformCredentialProvider for ConfigPlatformCredentials {
    fn platform_credential(&self, provider: &str, constrained: bool) -> Option<Secret> {
        let keys = if constrained {
            &self.constrained
        } else {
            &self.full
        };
        keys.get(provider).cloned()
    }
}

// ═══════════════════════════════════════════
// RESOLVER
// ═══════════════════════════════════════════

pub struct CredentialResolver {
    vault: Arc<dyn CredentialVault>,
    platform: Arc<dyn PlatformCredentialProvider>,
    /// permission → provider it draws keys from (`None`: no key needed)
    providers: BTreeMap<String, Option<String>>,
}

impl CredentialResolver {
    pub fn new(
        vault: Arc<dyn CredentialVault>,
        platform: Arc<dyn PlatformCredentialProvider>,
        providers: BTreeMap<String, Option<String>>,
    ) -> Self {
        Self {
            vault,
            platform,
            providers,
        }
    }

    /// Provider a permission draws its key from
    pub fn provider_for(&self, permission: &str) -> Option<&str> {
        self.providers.get(permission).and_then(|p| p.as_deref())
    }

    pub async fn resolve(
        &self,
        user_id: Option<&str>,
        permission: &str,
        mode: RunMode,
        fallback_allowed: bool,
    ) -> Result<Credential, CredentialError> {
        let provider = match self.providers.get(permission) {
            Some(Some(provider)) => provider.as_str(),
            Some(None) => return Ok(Credential::anonymous(user_id.map(String::from))),
            None => {
                return Err(CredentialError::Missing {
                    permission: permission.to_string(),
                    provider: "unknown".to_string(),
                })
            }
        };

        let missing = || CredentialError::Missing {
            permission: permission.to_string(),
            provider: provider.to_string(),
        };

        let (secret, source) = match mode {
            RunMode::Try => {
                let secret = self
                    .platform
                    .platform_credential(provider, true)
                    .ok_or_else(missing)?;
                (secret, CredentialSource::PlatformTry)
            }
            RunMode::Use => {
                let own = match user_id {
                    Some(user) => self.vault.user_secret(user, provider).await?,
                    None => None,
                };
                match own {
                    Some(secret) => (secret, CredentialSource::User),
                    None if fallback_allowed => {
                        let secret = self
                            .platform
                            .platform_credential(provider, false)
                            .ok_or_else(missing)?;
                        (secret, CredentialSource::Platform)
                    }
                    None => return Err(missing()),
                }
            }
        };

        debug!(permission, provider, source = ?source, "credential resolved");

        Ok(Credential::new(
            user_id.map(String::from),
            provider,
            source,
            secret,
        ))
    }
}
