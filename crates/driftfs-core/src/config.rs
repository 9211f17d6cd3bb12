//! Prefetcher configuration with layered loading.
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: hardcoded in the `default_*` functions below
//! 2. **Config file**: TOML file named by the `DRIFTFS_CONFIG` env var
//! 3. **Environment variables**: `DRIFTFS_*` vars override specific fields
//!    (e.g. `DRIFTFS_MAX_ACTIVE_PREFETCHES=500`)
//!
//! Invalid configurations (zero limits, a multiplier below one) are rejected
//! at load time rather than failing silently later.
//!
//! # Example
//!
//! ```toml
//! prefetch_timeout_secs = 86400
//! max_active_prefetches = 10000
//!
//! [backoff]
//! initial_interval_ms = 500
//! multiplier = 1.5
//! max_interval_ms = 60000
//! ```

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level prefetcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetcherConfig {
    /// Overall deadline for a single prefetch subtree, in seconds. Defaults
    /// to 24 hours.
    #[serde(default = "default_prefetch_timeout_secs")]
    pub prefetch_timeout_secs: u64,

    /// Soft ceiling on concurrently tracked prefetches. A request that would
    /// create a new top-level prefetch beyond this is deferred with backoff.
    /// Defaults to `10000`.
    #[serde(default = "default_max_active_prefetches")]
    pub max_active_prefetches: usize,

    /// Backoff schedule for prefetches deferred under cache pressure.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Exponential backoff schedule for rescheduled prefetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First retry delay, in milliseconds. Defaults to `500`.
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Growth factor applied after each retry. Must be `>= 1.0`. Defaults to
    /// `1.5`.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Random jitter applied around each delay, as a fraction of the delay.
    /// Defaults to `0.5` (each delay lands in `[0.5d, 1.5d]`).
    #[serde(default = "default_randomization_factor")]
    pub randomization_factor: f64,

    /// Ceiling on any single delay, in milliseconds. Defaults to `60000`.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Total budget after which rescheduling stops, in milliseconds.
    /// Defaults to `900000` (15 minutes).
    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
}

fn default_prefetch_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_active_prefetches() -> usize {
    10_000
}

fn default_initial_interval_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_randomization_factor() -> f64 {
    0.5
}

fn default_max_interval_ms() -> u64 {
    60_000
}

fn default_max_elapsed_ms() -> u64 {
    15 * 60 * 1000
}

impl Default for PrefetcherConfig {
    fn default() -> Self {
        Self {
            prefetch_timeout_secs: default_prefetch_timeout_secs(),
            max_active_prefetches: default_max_active_prefetches(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            multiplier: default_multiplier(),
            randomization_factor: default_randomization_factor(),
            max_interval_ms: default_max_interval_ms(),
            max_elapsed_ms: default_max_elapsed_ms(),
        }
    }
}

impl PrefetcherConfig {
    /// Loads configuration from the layered sources described in the module
    /// docs.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a named file is unreadable, a field fails
    /// to parse, or [`validate`](Self::validate) rejects the result.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Ok(path) = std::env::var("DRIFTFS_CONFIG") {
            builder = builder.add_source(File::with_name(&path));
        }
        let loaded: Self = builder
            .add_source(Environment::with_prefix("DRIFTFS").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Rejects configurations that would stall or never defer work.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Message` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch_timeout_secs == 0 {
            return Err(ConfigError::Message("prefetch_timeout_secs must be nonzero".into()));
        }
        if self.max_active_prefetches == 0 {
            return Err(ConfigError::Message("max_active_prefetches must be nonzero".into()));
        }
        self.backoff.validate()
    }

    /// The per-prefetch deadline as a [`Duration`].
    #[must_use]
    pub fn prefetch_timeout(&self) -> Duration {
        Duration::from_secs(self.prefetch_timeout_secs)
    }
}

impl BackoffConfig {
    /// # Errors
    ///
    /// Returns `ConfigError::Message` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_interval_ms == 0 {
            return Err(ConfigError::Message("backoff.initial_interval_ms must be nonzero".into()));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::Message("backoff.multiplier must be >= 1.0".into()));
        }
        if !(0.0..1.0).contains(&self.randomization_factor) {
            return Err(ConfigError::Message(
                "backoff.randomization_factor must be in [0, 1)".into(),
            ));
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err(ConfigError::Message(
                "backoff.max_interval_ms must be >= backoff.initial_interval_ms".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    #[must_use]
    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    #[must_use]
    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }
}
