use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::access::{AccessTable, ModelAccessRule};
use crate::health::BreakerConfig;
use crate::router::RetryPolicy;
use crate::store::MonthlyCap;
use crate::types::Tier;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub models: Vec<ModelAccessRule>,
    #[serde(default)]
    pub tiers: BTreeMap<Tier, TierQuota>,
    #[serde(default)]
    pub retry: RetryPolicyConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: String,
    /// Platform credential for this provider. BYOK secrets never appear
    /// here; they live encrypted in the datastore.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("headers", &"<redacted>")
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Monthly credit grant for a tier.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TierQuota {
    /// Credits granted at each monthly reset, in micros. `None` means
    /// the tier is unmetered.
    #[serde(default)]
    pub monthly_credit_micros: Option<u64>,
}

impl TierQuota {
    pub fn monthly_cap(&self) -> MonthlyCap {
        match self.monthly_credit_micros {
            Some(v) => MonthlyCap::Limited(v),
            None => MonthlyCap::Unlimited,
        }
    }
}

/// Serde-friendly mirror of [`RetryPolicy`] so every knob has a TOML
/// default.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    pub max_per_provider: u32,
    pub base_backoff_ms: u64,
    pub attempt_timeout_ms: u64,
    pub overall_deadline_ms: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        let p = RetryPolicy::default();
        Self {
            max_attempts: p.max_attempts,
            max_per_provider: p.max_per_provider,
            base_backoff_ms: p.base_backoff_ms,
            attempt_timeout_ms: p.attempt_timeout_ms,
            overall_deadline_ms: p.overall_deadline_ms,
        }
    }
}

impl RetryPolicyConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            max_per_provider: self.max_per_provider,
            base_backoff_ms: self.base_backoff_ms,
            attempt_timeout_ms: self.attempt_timeout_ms,
            overall_deadline_ms: self.overall_deadline_ms,
        }
    }
}

impl EngineConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0".into()));
        }
        if self.retry.max_per_provider == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_per_provider must be > 0".into(),
            ));
        }
        for provider in &self.providers {
            if provider.id.is_empty() {
                return Err(ConfigError::Invalid("provider id must not be empty".into()));
            }
        }
        for rule in &self.models {
            let known = self.providers.iter().any(|p| p.id == rule.provider);
            if !known {
                return Err(ConfigError::Invalid(format!(
                    "model {} references unknown provider {}",
                    rule.model_id, rule.provider
                )));
            }
        }
        Ok(())
    }

    pub fn quota_for(&self, tier: Tier) -> Option<TierQuota> {
        self.tiers.get(&tier).copied()
    }
}

/// One validated, immutable view of the config. Requests pin the snapshot
/// they started with, so a concurrent reload never changes pricing or
/// access mid-request.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: EngineConfig,
    pub access: AccessTable,
}

impl ConfigSnapshot {
    fn build(version: u64, config: EngineConfig) -> Arc<Self> {
        let (access, warnings) = AccessTable::load(config.models.clone());
        for message in warnings {
            warn!(version, %message, "model access rule warning");
        }
        Arc::new(Self {
            version,
            config,
            access,
        })
    }
}

/// Atomically swappable config handle. Readers take a cheap `Arc` clone;
/// `reload` installs a new snapshot without disturbing in-flight requests.
pub struct ConfigHandle {
    current: RwLock<Arc<ConfigSnapshot>>,
    version: AtomicU64,
}

impl ConfigHandle {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            current: RwLock::new(ConfigSnapshot::build(1, config)),
            version: AtomicU64::new(1),
        }
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            // A poisoned lock still holds a valid snapshot.
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Validates and installs a new config. On any error the previous
    /// snapshot stays live.
    pub fn reload(&self, config: EngineConfig) -> Result<u64, ConfigError> {
        config.validate()?;
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = ConfigSnapshot::build(version, config);
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
        Ok(version)
    }

    pub fn reload_from_path(&self, path: &Path) -> Result<u64, ConfigError> {
        let config = EngineConfig::from_path(path)?;
        self.reload(config)
    }
}
