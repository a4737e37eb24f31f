//! Configuration management for keylimit.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};

/// Main configuration for a keylimit deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeylimitConfig {
    /// Token bucket limiter configuration
    #[serde(default)]
    pub token_bucket: TokenBucketConfig,

    /// Windowed counter limiter configuration
    #[serde(default)]
    pub window: WindowConfig,

    /// Request facade configuration
    #[serde(default)]
    pub facade: FacadeConfig,
}

/// How a token bucket reacts when asked for more tokens than it holds.
///
/// A bucket is built with one policy and keeps it for its whole lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecrementPolicy {
    /// Reject with `InsufficientCapacity` and leave the bucket untouched.
    #[default]
    Strict,
    /// Never reject. A bucket holding any tokens pays the full amount, possibly going
    /// negative; an empty or negative bucket is left as is.
    Clamped,
}

/// Token bucket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Maximum number of tokens a bucket holds
    #[serde(default = "default_bucket_limit")]
    pub limit: u64,

    /// Tokens restored on every replenishment tick
    #[serde(default = "default_increment")]
    pub increment: u64,

    /// Milliseconds between replenishment ticks
    #[serde(default = "default_increment_interval_ms")]
    pub increment_interval_ms: u64,

    /// Behaviour when a bucket runs dry
    #[serde(default)]
    pub policy: DecrementPolicy,

    /// Periodically drop buckets that have fully recovered
    #[serde(default = "default_evict_idle")]
    pub evict_idle: bool,

    /// Milliseconds between eviction sweeps, defaults to the increment interval
    #[serde(default)]
    pub eviction_interval_ms: Option<u64>,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            limit: default_bucket_limit(),
            increment: default_increment(),
            increment_interval_ms: default_increment_interval_ms(),
            policy: DecrementPolicy::default(),
            evict_idle: default_evict_idle(),
            eviction_interval_ms: None,
        }
    }
}

fn default_bucket_limit() -> u64 {
    25
}

fn default_increment() -> u64 {
    1
}

fn default_increment_interval_ms() -> u64 {
    5000
}

fn default_evict_idle() -> bool {
    true
}

impl TokenBucketConfig {
    /// Preset for a fast-refilling request counter that throttles silently.
    pub fn request_counter() -> Self {
        Self {
            limit: 25,
            increment: 1,
            increment_interval_ms: 500,
            policy: DecrementPolicy::Clamped,
            ..Self::default()
        }
    }

    /// Time between replenishment ticks.
    pub fn increment_interval(&self) -> Duration {
        Duration::from_millis(self.increment_interval_ms)
    }

    /// Time between eviction sweeps.
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(
            self.eviction_interval_ms
                .unwrap_or(self.increment_interval_ms),
        )
    }

    /// Check that the numeric knobs can drive a bucket.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(LimiterError::Config(
                "token_bucket.limit must be greater than zero".to_string(),
            ));
        }
        if self.limit > i64::MAX as u64 {
            return Err(LimiterError::Config(format!(
                "token_bucket.limit must not exceed {}",
                i64::MAX
            )));
        }
        if self.increment == 0 {
            return Err(LimiterError::Config(
                "token_bucket.increment must be greater than zero".to_string(),
            ));
        }
        if self.increment_interval_ms == 0 {
            return Err(LimiterError::Config(
                "token_bucket.increment_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.eviction_interval_ms == Some(0) {
            return Err(LimiterError::Config(
                "token_bucket.eviction_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Windowed counter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Requests admitted per window
    #[serde(default = "default_window_limit")]
    pub limit: u64,

    /// Window length in milliseconds; zero expires the window on every check
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            limit: default_window_limit(),
            period_ms: default_period_ms(),
        }
    }
}

fn default_window_limit() -> u64 {
    20
}

fn default_period_ms() -> u64 {
    5000
}

impl WindowConfig {
    /// Length of one window.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// Which counter algorithm backs the facade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Continuously refilling token bucket
    TokenBucket,
    /// Fixed window counter with rolling reset
    #[default]
    Window,
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "token_bucket" | "bucket" => Ok(Algorithm::TokenBucket),
            "window" | "windowed" => Ok(Algorithm::Window),
            other => Err(format!("unknown algorithm '{}'", other)),
        }
    }
}

/// Request facade configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacadeConfig {
    /// Dotted path selecting the rate limit key inside a request record
    #[serde(default = "default_key_path")]
    pub key: String,

    /// Counter algorithm used per key
    #[serde(default)]
    pub algorithm: Algorithm,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            key: default_key_path(),
            algorithm: Algorithm::default(),
        }
    }
}

fn default_key_path() -> String {
    "ip".to_string()
}

impl KeylimitConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading keylimit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: KeylimitConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, layered under `KEYLIMIT_*` environment
    /// overrides such as `KEYLIMIT_TOKEN_BUCKET__LIMIT=50`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading keylimit configuration");
            builder = builder.add_source(::config::File::from(path));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("KEYLIMIT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: KeylimitConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LimiterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.token_bucket.validate()?;
        if self.facade.key.trim().is_empty() {
            return Err(LimiterError::Config(
                "facade.key must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
