//! Runtime configuration: deposit limits, revenue share and payment provider access.
//!
//! Values come from [`CommerceConfig::default`], optionally overridden by a
//! TOML file ([`CommerceConfig::load`]) and then by `COURSEPAY_*` environment
//! variables ([`CommerceConfig::from_env`]). Invalid environment values are
//! ignored with a warning so a typo never takes the service down.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Default minimum deposit, in wallet currency units.
pub const DEFAULT_MIN_DEPOSIT: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// Default instructor revenue share (80%).
pub const DEFAULT_INSTRUCTOR_SHARE: Decimal = Decimal::from_parts(80, 0, 0, false, 2);

/// Default prefix of deposit idempotency keys.
pub const DEFAULT_DEPOSIT_KEY_PREFIX: &str = "CPD";

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
}

// =============================================================================
// Configuration
// =============================================================================

/// Access to the external payment provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the provider API. Empty means not configured.
    pub base_url: String,
    /// Bearer token sent with every provider request.
    pub api_key: Option<String>,
    /// Account number the provider should route deposits into.
    pub receiving_account: String,
    /// HTTP request timeout in seconds.
    pub http_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            receiving_account: String::new(),
            http_timeout_secs: 10,
        }
    }
}

impl ProviderConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.receiving_account.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommerceConfig {
    /// Smallest accepted deposit.
    pub min_deposit: Decimal,
    /// Largest accepted deposit, unbounded when absent.
    pub max_deposit: Option<Decimal>,
    /// Share of each purchase credited to the course instructor when the
    /// course does not carry its own rate.
    pub instructor_share: Decimal,
    /// Prefix of generated deposit keys. Must be ASCII alphanumeric.
    pub deposit_key_prefix: String,
    pub provider: ProviderConfig,
}

impl Default for CommerceConfig {
    fn default() -> Self {
        Self {
            min_deposit: DEFAULT_MIN_DEPOSIT,
            max_deposit: None,
            instructor_share: DEFAULT_INSTRUCTOR_SHARE,
            deposit_key_prefix: DEFAULT_DEPOSIT_KEY_PREFIX.to_string(),
            provider: ProviderConfig::default(),
        }
    }
}

impl CommerceConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&source)?.with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `COURSEPAY_*` overrides read through `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parse_var::<Decimal>(&lookup, "COURSEPAY_MIN_DEPOSIT") {
            self.min_deposit = v;
        }
        if let Some(v) = parse_var::<Decimal>(&lookup, "COURSEPAY_MAX_DEPOSIT") {
            self.max_deposit = Some(v);
        }
        if let Some(v) = parse_var::<Decimal>(&lookup, "COURSEPAY_INSTRUCTOR_SHARE") {
            self.instructor_share = v;
        }
        if let Some(prefix) = non_empty(&lookup, "COURSEPAY_DEPOSIT_PREFIX") {
            self.deposit_key_prefix = prefix.to_ascii_uppercase();
        }
        if let Some(url) = non_empty(&lookup, "COURSEPAY_PROVIDER_URL") {
            self.provider.base_url = url;
        }
        if let Some(key) = non_empty(&lookup, "COURSEPAY_PROVIDER_API_KEY") {
            self.provider.api_key = Some(key);
        }
        if let Some(account) = non_empty(&lookup, "COURSEPAY_RECEIVING_ACCOUNT") {
            self.provider.receiving_account = account;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "COURSEPAY_PROVIDER_TIMEOUT_SECS") {
            self.provider.http_timeout_secs = secs;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_deposit <= Decimal::ZERO {
            return Err(ConfigError::Invalid("min_deposit must be positive".into()));
        }
        if let Some(max) = self.max_deposit {
            if max < self.min_deposit {
                return Err(ConfigError::Invalid(format!(
                    "max_deposit {max} is below min_deposit {}",
                    self.min_deposit
                )));
            }
        }
        if self.instructor_share < Decimal::ZERO || self.instructor_share > Decimal::ONE {
            return Err(ConfigError::Invalid(format!(
                "instructor_share {} must be within [0, 1]",
                self.instructor_share
            )));
        }
        if self.deposit_key_prefix.is_empty()
            || !self
                .deposit_key_prefix
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            return Err(ConfigError::Invalid(
                "deposit_key_prefix must be non-empty uppercase ASCII alphanumeric".into(),
            ));
        }
        Ok(())
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = non_empty(lookup, key)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable configuration override");
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
