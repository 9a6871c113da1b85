use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the cyclone engine.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Number of shard workers. 0 means one per CPU core.
    #[serde(default)]
    pub shards: usize,

    /// Bound of each shard's transport input queue.
    #[serde(default = "default_handler_queue_length")]
    pub handler_queue_length: usize,

    /// Samples older than this at ingest are discarded. Default: 30m.
    #[serde(default = "default_metrics_max_age", with = "humantime_serde")]
    pub metrics_max_age: Duration,

    /// Interval of the internal liveness sample. Default: 5s.
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Exact-match metric paths to drop before any work.
    #[serde(default)]
    pub discard_metrics: Vec<String>,

    /// Alarm dispatch configuration.
    #[serde(default)]
    pub alarming: AlarmingConfig,

    /// Dispatcher retry behavior.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Threshold lookup service endpoint.
    #[serde(default)]
    pub lookup: LookupConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Alarm dispatch configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AlarmingConfig {
    /// Destination URI for alarm POSTs.
    #[serde(default)]
    pub destination: String,

    /// API version string stamped into every alarm event.
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Evaluate only; suppress outbound alarm POSTs.
    #[serde(default)]
    pub testmode: bool,

    /// Response statuses at or above this are treated as dispatch
    /// failures. Default: 209.
    #[serde(default = "default_error_status_threshold")]
    pub error_status_threshold: u16,
}

/// Dispatcher retry behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt. Default: 3.
    #[serde(default = "default_retry_count")]
    pub count: u32,

    /// Initial backoff between attempts. Default: 50ms.
    #[serde(default = "default_retry_min_wait", with = "humantime_serde")]
    pub min_wait: Duration,

    /// Backoff ceiling. Default: 500ms.
    #[serde(default = "default_retry_max_wait", with = "humantime_serde")]
    pub max_wait: Duration,
}

/// Threshold lookup service endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct LookupConfig {
    /// URL scheme. Default: "http".
    #[serde(default = "default_lookup_scheme")]
    pub scheme: String,

    /// Lookup service host.
    #[serde(default)]
    pub host: String,

    /// Lookup service port. Default: 9876.
    #[serde(default = "default_lookup_port")]
    pub port: u16,

    /// Base path of the configuration endpoint.
    #[serde(default = "default_lookup_path")]
    pub path: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_lookup_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_handler_queue_length() -> usize {
    16
}

fn default_metrics_max_age() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_api_version() -> String {
    "1.0".to_string()
}

fn default_error_status_threshold() -> u16 {
    209
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_min_wait() -> Duration {
    Duration::from_millis(50)
}

fn default_retry_max_wait() -> Duration {
    Duration::from_millis(500)
}

fn default_lookup_scheme() -> String {
    "http".to_string()
}

fn default_lookup_port() -> u16 {
    9876
}

fn default_lookup_path() -> String {
    "api/v1/configurations".to_string()
}

fn default_lookup_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            shards: 0,
            handler_queue_length: default_handler_queue_length(),
            metrics_max_age: default_metrics_max_age(),
            heartbeat_interval: default_heartbeat_interval(),
            discard_metrics: Vec::new(),
            alarming: AlarmingConfig::default(),
            retry: RetryConfig::default(),
            lookup: LookupConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for AlarmingConfig {
    fn default() -> Self {
        Self {
            destination: String::new(),
            api_version: default_api_version(),
            testmode: false,
            error_status_threshold: default_error_status_threshold(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            count: default_retry_count(),
            min_wait: default_retry_min_wait(),
            max_wait: default_retry_max_wait(),
        }
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            scheme: default_lookup_scheme(),
            host: String::new(),
            port: default_lookup_port(),
            path: default_lookup_path(),
            timeout: default_lookup_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.alarming.destination.is_empty() && !self.alarming.testmode {
            bail!("alarming.destination is required unless testmode is set");
        }

        if self.alarming.error_status_threshold < 200 {
            bail!("alarming.error_status_threshold must be at least 200");
        }

        if self.lookup.host.is_empty() {
            bail!("lookup.host is required");
        }

        if self.handler_queue_length == 0 {
            bail!("handler_queue_length must be positive");
        }

        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat_interval must be positive");
        }

        if self.retry.min_wait > self.retry.max_wait {
            bail!("retry.min_wait must not exceed retry.max_wait");
        }

        Ok(())
    }

    /// Effective shard count: configured value, or one per CPU core.
    pub fn shard_count(&self) -> usize {
        if self.shards > 0 {
            return self.shards;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
