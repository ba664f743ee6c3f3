//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, TollgateError};

/// Prefix for environment variable overrides, e.g. `TOLLGATE__RATE_LIMITING__CAPACITY`.
const ENV_PREFIX: &str = "TOLLGATE";
const ENV_SEPARATOR: &str = "__";

/// Upper bound for `sweep_interval_secs` and `idle_threshold_secs`: 30 years.
pub const MAX_DURATION_SECS: u64 = 30 * 365 * 86_400;

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: LimiterConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Parameters shared by every bucket in a [`LimiterRegistry`](crate::ratelimit::LimiterRegistry).
///
/// Out-of-range values are not rejected; [`LimiterConfig::normalize`] swaps
/// them for the defaults so the admission path stays available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Tokens added per second per key
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Maximum burst per key
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Seconds between idle-eviction passes
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Seconds of inactivity after which a key is evicted
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            capacity: default_capacity(),
            sweep_interval_secs: default_sweep_interval(),
            idle_threshold_secs: default_idle_threshold(),
        }
    }
}

fn default_rate() -> f64 {
    1.0
}

fn default_capacity() -> u32 {
    5
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_idle_threshold() -> u64 {
    180
}

impl LimiterConfig {
    /// Replace every out-of-range field with its default.
    ///
    /// Durations above [`MAX_DURATION_SECS`] are clamped to it instead.
    ///
    /// Returns the names of the fields that were adjusted. Each adjustment is
    /// also logged at `warn` level.
    pub fn normalize(&mut self) -> Vec<&'static str> {
        let mut adjusted = Vec::new();

        if !self.rate.is_finite() || self.rate <= 0.0 {
            warn!(rate = self.rate, default = default_rate(), "Invalid rate, using default");
            self.rate = default_rate();
            adjusted.push("rate");
        }

        if self.capacity == 0 {
            warn!(default = default_capacity(), "Capacity must be at least 1, using default");
            self.capacity = default_capacity();
            adjusted.push("capacity");
        }

        if self.sweep_interval_secs == 0 {
            warn!(
                default = default_sweep_interval(),
                "Sweep interval must be at least one second, using default"
            );
            self.sweep_interval_secs = default_sweep_interval();
            adjusted.push("sweep_interval_secs");
        } else if self.sweep_interval_secs > MAX_DURATION_SECS {
            warn!(
                sweep_interval_secs = self.sweep_interval_secs,
                max = MAX_DURATION_SECS,
                "Sweep interval too large, clamping"
            );
            self.sweep_interval_secs = MAX_DURATION_SECS;
            adjusted.push("sweep_interval_secs");
        }

        if self.idle_threshold_secs == 0 {
            warn!(
                default = default_idle_threshold(),
                "Idle threshold must be at least one second, using default"
            );
            self.idle_threshold_secs = default_idle_threshold();
            adjusted.push("idle_threshold_secs");
        } else if self.idle_threshold_secs > MAX_DURATION_SECS {
            warn!(
                idle_threshold_secs = self.idle_threshold_secs,
                max = MAX_DURATION_SECS,
                "Idle threshold too large, clamping"
            );
            self.idle_threshold_secs = MAX_DURATION_SECS;
            adjusted.push("idle_threshold_secs");
        }

        adjusted
    }

    /// Consume the config and return its normalized form.
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Period between sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Age at which an untouched key is evicted.
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional YAML file layered under
    /// `TOLLGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`TollgateConfig::load`], reading overrides from `env` instead of
    /// the process environment when it is given.
    fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .source(env),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
