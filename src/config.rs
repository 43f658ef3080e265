//! Runtime configuration
//!
//! Platform ceilings, platform-wide provider keys and provider endpoints.
//! Config is stored in `~/.config/apprun/config.toml`.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Environment variables (`OPENAI_API_KEY`, `APPRUN_TRY_TIMEOUT_MS`, ...)
//! 2. Config file (`~/.config/apprun/config.toml`)
//! 3. Defaults

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub limits: PlatformLimits,

    /// Full platform credentials, keyed by provider (`openai`, `anthropic`, ...)
    #[serde(default)]
    pub platform: BTreeMap<String, String>,

    /// Constrained platform credentials used by try mode
    #[serde(default)]
    pub platform_try: BTreeMap<String, String>,

    #[serde(default)]
    pub providers: ProviderSettings,
}

/// Hard platform ceilings applied on top of manifest limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlatformLimits {
    pub try_timeout_ceiling_ms: u64,
    pub use_timeout_ceiling_ms: u64,
    pub try_token_ceiling: u64,
    pub use_token_ceiling: u64,
    /// Upper bound on any capability token lifetime
    pub token_ttl_max_ms: u64,
    /// Disable loopback/private address blocking (dev and tests only)
    pub allow_private_hosts: bool,
}

impl Default for PlatformLimits {
    fn default() -> Self {
        Self {
            try_timeout_ceiling_ms: 10_000,
            use_timeout_ceiling_ms: 120_000,
            try_token_ceiling: 4_000,
            use_token_ceiling: 100_000,
            token_ttl_max_ms: 60_000,
            allow_private_hosts: false,
        }
    }
}

impl PlatformLimits {
    pub fn token_ttl_max(&self) -> Duration {
        Duration::from_millis(self.token_ttl_max_ms)
    }
}

/// Provider selection and endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderSettings {
    /// Provider backing `llm.complete`
    pub llm_default: String,
    pub openai_base_url: String,
    pub anthropic_base_url: String,
    pub email_endpoint: String,
    pub image_endpoint: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            llm_default: "openai".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            anthropic_base_url: "https://api.anthropic.com/v1".to_string(),
            email_endpoint: "https://api.resend.com/emails".to_string(),
            image_endpoint: "https://images.apprun.dev/v1/transform".to_string(),
        }
    }
}

/// Env var → (table, provider) for platform keys
const KEY_VARS: &[(&str, bool, &str)] = &[
    ("OPENAI_API_KEY", false, "openai"),
    ("ANTHROPIC_API_KEY", false, "anthropic"),
    ("APPRUN_EMAIL_API_KEY", false, "email"),
    ("APPRUN_IMAGE_API_KEY", false, "image"),
    ("APPRUN_TRY_OPENAI_API_KEY", true, "openai"),
    ("APPRUN_TRY_ANTHROPIC_API_KEY", true, "anthropic"),
];

impl RuntimeConfig {
    /// Returns `~/.config/apprun/` on Unix, `%APPDATA%/apprun/` on Windows
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("apprun")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load from the default path; missing file means defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from an explicit path; missing file means defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| RuntimeError::Config {
            reason: format!("Failed to read config file: {}", e),
        })?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RuntimeError::Config {
            reason: format!("Failed to parse config file: {}", e),
        })
    }

    /// Merge process environment variables (they win over the file)
    pub fn with_env(self) -> Self {
        self.with_env_from(|name| std::env::var(name).ok())
    }

    /// Merge variables from an arbitrary lookup (empty values are ignored)
    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        for &(var, constrained, provider) in KEY_VARS {
            if let Some(key) = get(var) {
                let table = if constrained {
                    &mut self.platform_try
                } else {
                    &mut self.platform
                };
                table.insert(provider.to_string(), key);
            }
        }

        let millis = |name: &str| get(name).and_then(|v| v.parse::<u64>().ok());
        if let Some(ms) = millis("APPRUN_TRY_TIMEOUT_MS") {
            self.limits.try_timeout_ceiling_ms = ms;
        }
        if let Some(ms) = millis("APPRUN_USE_TIMEOUT_MS") {
            self.limits.use_timeout_ceiling_ms = ms;
        }
        if let Some(ms) = millis("APPRUN_TOKEN_TTL_MS") {
            self.limits.token_ttl_max_ms = ms;
        }
        if let Some(provider) = get("APPRUN_LLM_PROVIDER") {
            self.providers.llm_default = provider;
        }

        self
    }

    /// Reject configurations that cannot produce a usable budget
    pub fn validate(&self) -> Result<()> {
        let l = &self.limits;
        if l.try_timeout_ceiling_ms == 0 || l.use_timeout_ceiling_ms == 0 {
            return Err(RuntimeError::Config {
                reason: "timeout ceilings must be greater than zero".to_string(),
            });
        }
        if l.try_timeout_ceiling_ms > l.use_timeout_ceiling_ms {
            return Err(RuntimeError::Config {
                reason: "try-mode timeout ceiling cannot exceed the use-mode ceiling".to_string(),
            });
        }
        if l.token_ttl_max_ms == 0 {
            return Err(RuntimeError::Config {
                reason: "token_ttl_max_ms must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Mask a secret for display, e.g. "sk-proj***"
pub fn mask_secret(key: &str, visible_chars: usize) -> String {
    if key.is_empty() {
        return String::new();
    }

    let visible = key
        .char_indices()
        .nth(visible_chars)
        .map(|(i, _)| i)
        .unwrap_or(key.len());
    format!("{}***", &key[..visible])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn config_path_contains_apprun() {
        let path = RuntimeConfig::config_path();
        assert!(path.to_string_lossy().contains("apprun"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn defaults_match_platform_policy() {
        let config = RuntimeConfig::default();
        assert_eq!(config.limits.try_timeout_ceiling_ms, 10_000);
        assert_eq!(config.limits.use_timeout_ceiling_ms, 120_000);
        assert_eq!(config.providers.llm_default, "openai");
        assert!(config.platform.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[limits]
try_timeout_ceiling_ms = 5000

[platform]
openai = "sk-platform"

[platform_try]
openai = "sk-try"
"#,
        )
        .unwrap();

        let config = RuntimeConfig::load_from(&path).unwrap();
        assert_eq!(config.limits.try_timeout_ceiling_ms, 5000);
        assert_eq!(config.limits.use_timeout_ceiling_ms, 120_000);
        assert_eq!(config.platform.get("openai").unwrap(), "sk-platform");
        assert_eq!(config.platform_try.get("openai").unwrap(), "sk-try");
    }

    #[test]
    fn missing_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let config = RuntimeConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn malformed_file_is_config_error() {
        let err = RuntimeConfig::from_toml("limits = 3").unwrap_err();
        assert!(matches!(err, RuntimeError::Config { .. }));
    }

    #[test]
    fn env_overrides_file() {
        let config = RuntimeConfig {
            platform: BTreeMap::from([("openai".to_string(), "sk-file".to_string())]),
            ..Default::default()
        }
        .with_env_from(env(&[
            ("OPENAI_API_KEY", "sk-env"),
            ("APPRUN_TRY_OPENAI_API_KEY", "sk-try-env"),
            ("APPRUN_TRY_TIMEOUT_MS", "2500"),
        ]));

        assert_eq!(config.platform.get("openai").unwrap(), "sk-env");
        assert_eq!(config.platform_try.get("openai").unwrap(), "sk-try-env");
        assert_eq!(config.limits.try_timeout_ceiling_ms, 2500);
    }

    #[test]
    fn empty_env_does_not_override() {
        let config = RuntimeConfig {
            platform: BTreeMap::from([("openai".to_string(), "sk-file".to_string())]),
            ..Default::default()
        }
        .with_env_from(env(&[("OPENAI_API_KEY", "")]));

        assert_eq!(config.platform.get("openai").unwrap(), "sk-file");
    }

    #[test]
    fn try_ceiling_above_use_ceiling_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.limits.try_timeout_ceiling_ms = 500_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn mask_secret_keeps_prefix() {
        assert_eq!(mask_secret("sk-proj-abcdef", 7), "sk-proj***");
        assert_eq!(mask_secret("short", 10), "short***");
        assert_eq!(mask_secret("", 10), "");
    }
}
