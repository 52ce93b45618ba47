//! Service configuration
//!
//! Every field has a default, so an empty file (or none at all) is a valid
//! configuration apart from the key-encryption secret. Values are read from
//! the TOML file named by `KEYCUSTODY_CONFIG`, then overridden from the
//! environment.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::crypto::codec::DEFAULT_PBKDF2_ITERATIONS;
use crate::crypto::HumanSecret;
use crate::error::{CustodyError, CustodyResult};

pub const CONFIG_PATH_ENV: &str = "KEYCUSTODY_CONFIG";
pub const DATABASE_URL_ENV: &str = "KEYCUSTODY_DATABASE_URL";
pub const SECRET_ENV: &str = "KEYCUSTODY_SECRET";
pub const NOTIFY_URL_ENV: &str = "KEYCUSTODY_NOTIFY_URL";

/// Largest one-time pre-key batch accepted from clients or generated at once
pub const MAX_PREKEY_BATCH: u32 = 100;

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    /// Operator secret that custodial identity private keys are wrapped under
    pub key_encryption_secret: HumanSecret,
    pub pbkdf2_iterations: u32,
    pub log_filter: String,
    pub cache: CacheConfig,
    pub keys: KeyPolicy,
    pub scheduler: SchedulerConfig,
    pub notifier: NotifierConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:keycustody.db".to_string(),
            key_encryption_secret: HumanSecret::default(),
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            log_filter: "keycustody=info".to_string(),
            cache: CacheConfig::default(),
            keys: KeyPolicy::default(),
            scheduler: SchedulerConfig::default(),
            notifier: NotifierConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub session_ttl_secs: u64,
    pub key_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 60 * 60,
            key_ttl_secs: DAY_SECS,
        }
    }
}

impl CacheConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn key_ttl(&self) -> Duration {
        Duration::from_secs(self.key_ttl_secs)
    }
}

/// Lifetimes applied to newly created key material
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyPolicy {
    pub signed_pre_key_lifetime_days: i64,
    pub one_time_pre_key_lifetime_days: i64,
    /// How long a deactivated signed pre-key still answers `contains`
    pub signed_pre_key_grace_days: i64,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            signed_pre_key_lifetime_days: 30,
            one_time_pre_key_lifetime_days: 90,
            signed_pre_key_grace_days: 7,
        }
    }
}

impl KeyPolicy {
    pub fn signed_pre_key_lifetime(&self) -> chrono::Duration {
        chrono::Duration::days(self.signed_pre_key_lifetime_days)
    }

    pub fn one_time_pre_key_lifetime(&self) -> chrono::Duration {
        chrono::Duration::days(self.one_time_pre_key_lifetime_days)
    }

    pub fn signed_pre_key_grace(&self) -> chrono::Duration {
        chrono::Duration::days(self.signed_pre_key_grace_days)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub rotation_interval_secs: u64,
    pub replenish_interval_secs: u64,
    /// Rotate signed pre-keys expiring within this many days
    pub rotation_lookahead_days: i64,
    pub prekey_floor: u32,
    pub prekey_batch: u32,
    pub user_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rotation_interval_secs: 7 * DAY_SECS,
            replenish_interval_secs: DAY_SECS,
            rotation_lookahead_days: 7,
            prekey_floor: 20,
            prekey_batch: MAX_PREKEY_BATCH,
            user_timeout_secs: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn replenish_interval(&self) -> Duration {
        Duration::from_secs(self.replenish_interval_secs)
    }

    pub fn rotation_lookahead(&self) -> chrono::Duration {
        chrono::Duration::days(self.rotation_lookahead_days)
    }

    pub fn user_timeout(&self) -> Duration {
        Duration::from_secs(self.user_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Base URL of the notification service; unset means log-only
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 5,
        }
    }
}

impl NotifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load from `KEYCUSTODY_CONFIG` (if set) plus environment overrides
    pub fn load() -> CustodyResult<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> CustodyResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CustodyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> CustodyResult<Self> {
        toml::from_str(text).map_err(|e| CustodyError::Config(e.to_string()))
    }

    /// Apply environment-style overrides through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(DATABASE_URL_ENV) {
            self.database_url = url;
        }
        if let Some(secret) = lookup(SECRET_ENV) {
            self.key_encryption_secret = HumanSecret::new(secret);
        }
        if let Some(endpoint) = lookup(NOTIFY_URL_ENV) {
            self.notifier.endpoint = Some(endpoint);
        }
    }

    pub fn validate(&self) -> CustodyResult<()> {
        if self.key_encryption_secret.is_empty() {
            return Err(CustodyError::Config(format!(
                "key encryption secret is empty; set {}",
                SECRET_ENV
            )));
        }
        if self.pbkdf2_iterations == 0 {
            return Err(CustodyError::Config("pbkdf2_iterations must be positive".into()));
        }
        if self.scheduler.prekey_floor == 0 {
            return Err(CustodyError::Config("scheduler.prekey_floor must be positive".into()));
        }
        if !(1..=MAX_PREKEY_BATCH).contains(&self.scheduler.prekey_batch) {
            return Err(CustodyError::Config(format!(
                "scheduler.prekey_batch must be within 1..={}",
                MAX_PREKEY_BATCH
            )));
        }
        if self.keys.signed_pre_key_lifetime_days <= 0
            || self.keys.one_time_pre_key_lifetime_days <= 0
        {
            return Err(CustodyError::Config("key lifetimes must be positive".into()));
        }
        if self.keys.signed_pre_key_grace_days < 0 {
            return Err(CustodyError::Config("signed_pre_key_grace_days cannot be negative".into()));
        }
        Ok(())
    }
}
