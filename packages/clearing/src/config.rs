//! Clearing Configuration
//!
//! Defaults plus environment variable overrides. Storage backend is
//! auto-detected from common database URL variables.

use std::env;
use std::time::Duration;

use crate::account::AccountLimits;
use crate::scheduler::SchedulerConfig;
use crate::types::Amount;

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// In-memory, for tests and single-process deployments.
    Memory,
    /// Durable relational backend.
    Postgres,
}

/// Storage backend options.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            database_url: None,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Core engine configuration.
#[derive(Debug, Clone)]
pub struct ClearingConfig {
    /// Limits applied to new accounts unless overridden per account.
    pub default_limits: AccountLimits,
    /// Account credited with collected fees; fees are burned when unset.
    pub fee_sink: Option<String>,
    pub enable_audit_log: bool,
    /// Operation-level deadline; exceeding it rolls the transaction back.
    pub operation_timeout: Option<Duration>,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
}

impl Default for ClearingConfig {
    fn default() -> Self {
        Self {
            default_limits: AccountLimits::default(),
            fee_sink: None,
            enable_audit_log: true,
            operation_timeout: None,
            scheduler: SchedulerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ClearingConfig {
    /// Build configuration from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        apply_env_overrides(&mut config);

        config.storage.database_url = detect_database();
        if config.storage.database_url.is_some() {
            config.storage.backend = StorageBackend::Postgres;
        }

        config
    }
}

/// Apply environment variable overrides.
fn apply_env_overrides(config: &mut ClearingConfig) {
    if let Ok(sink) = env::var("ROBOPAY_FEE_SINK") {
        if !sink.is_empty() {
            config.fee_sink = Some(sink);
        }
    }

    if let Ok(flag) = env::var("ROBOPAY_AUDIT_LOG") {
        config.enable_audit_log = flag != "0" && flag.to_lowercase() != "false";
    }

    if let Ok(ms) = env::var("ROBOPAY_CHECK_INTERVAL_MS") {
        if let Ok(ms) = ms.parse::<u64>() {
            config.scheduler.check_interval = Duration::from_millis(ms);
        }
    }

    if let Ok(max) = env::var("ROBOPAY_MAX_FAILURES") {
        if let Ok(max) = max.parse() {
            config.scheduler.max_failures = max;
        }
    }

    if let Ok(ms) = env::var("ROBOPAY_OPERATION_TIMEOUT_MS") {
        if let Ok(ms) = ms.parse::<u64>() {
            config.operation_timeout = Some(Duration::from_millis(ms));
        }
    }

    if let Ok(max) = env::var("ROBOPAY_POOL_SIZE") {
        if let Ok(max) = max.parse() {
            config.storage.max_connections = max;
        }
    }

    if let Ok(amount) = env::var("ROBOPAY_MAX_TRANSFER") {
        config.default_limits.max_transfer_amount = Amount::parse(&amount);
    }

    if let Ok(amount) = env::var("ROBOPAY_DAILY_LIMIT") {
        config.default_limits.daily_transfer_limit = Amount::parse(&amount);
    }
}

/// Auto-detect database from common environment variables.
fn detect_database() -> Option<String> {
    env::var("DATABASE_URL")
        .or_else(|_| env::var("DB_URL"))
        .or_else(|_| env::var("POSTGRES_URL"))
        .ok()
        .filter(|url| !url.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClearingConfig::default();
        assert!(config.fee_sink.is_none());
        assert!(config.enable_audit_log);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.max_connections, 10);
        assert_eq!(config.storage.acquire_timeout, Duration::from_secs(10));
        assert_eq!(config.scheduler.check_interval, Duration::from_secs(60));
        assert_eq!(config.scheduler.max_failures, 3);
    }
}
