//! Threshold rule lookup.
//!
//! The rule store is consulted per sample via a deterministic lookup id.
//! The core consumes it through the [`ThresholdSource`] trait; the
//! [`Client`] here is the HTTP implementation against the lookup service.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::LookupConfig;

/// One threshold rule, keyed by its id in the lookup response.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub id: String,
    pub predicate: String,
    /// Alarm level ("0".."9") to integer threshold. Absent levels are
    /// skipped during evaluation.
    #[serde(default)]
    pub thresholds: HashMap<String, i64>,
    #[serde(default)]
    pub oncall: String,
    #[serde(default)]
    pub meta_targethost: String,
    #[serde(default)]
    pub meta_source: String,
    #[serde(default)]
    pub meta_monitoring: String,
    #[serde(default)]
    pub meta_team: String,
}

/// Rule id to rule, as returned by the lookup service. Empty means no
/// thresholds are configured for the lookup id.
pub type RuleSet = HashMap<String, Rule>;

/// Errors from consulting the rule store.
#[derive(Error, Debug)]
pub enum LookupError {
    /// The endpoint configuration itself is unusable. This is the only
    /// variant that escalates to a worker death.
    #[error("invalid lookup endpoint: {0}")]
    Config(String),

    #[error("lookup service unreachable: {0}")]
    Unavailable(#[source] reqwest::Error),

    #[error("unexpected status {status} from lookup service")]
    Status { status: u16 },

    #[error("decoding lookup response: {0}")]
    Decode(#[source] reqwest::Error),
}

impl LookupError {
    /// Structural failures that a retry cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LookupError::Config(_))
    }
}

/// Rule store interface consumed by the shard workers.
pub trait ThresholdSource: Send + Sync + 'static {
    fn lookup(
        &self,
        lookup_id: &str,
    ) -> impl std::future::Future<Output = Result<RuleSet, LookupError>> + Send;
}

/// Callback type for recording lookup request metrics:
/// (status label, duration).
pub type MetricsCallback = Box<dyn Fn(&str, Duration) + Send + Sync>;

/// HTTP client against the threshold lookup service.
pub struct Client {
    http: reqwest::Client,
    base: String,
    metrics: Option<MetricsCallback>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("http", &self.http)
            .field("base", &self.base)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl Client {
    pub fn new(cfg: &LookupConfig) -> Result<Self, LookupError> {
        if cfg.host.is_empty() {
            return Err(LookupError::Config("lookup.host is empty".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| LookupError::Config(format!("building HTTP client: {e}")))?;

        let base = format!(
            "{}://{}:{}/{}",
            cfg.scheme,
            cfg.host,
            cfg.port,
            cfg.path.trim_matches('/'),
        );

        Ok(Self {
            http,
            base,
            metrics: None,
        })
    }

    /// Set a metrics callback receiving (status label, duration) per
    /// request.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(status, duration);
        }
    }
}

impl ThresholdSource for Client {
    async fn lookup(&self, lookup_id: &str) -> Result<RuleSet, LookupError> {
        let start = Instant::now();
        let url = format!("{}/{}", self.base, lookup_id);

        debug!(lookup_id, "fetching threshold rules");

        let response = match self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.record_request("unreachable", start.elapsed());
                return Err(LookupError::Unavailable(e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.record_request("error", start.elapsed());
            return Err(LookupError::Status {
                status: status.as_u16(),
            });
        }

        let rules: RuleSet = match response.json().await {
            Ok(rules) => rules,
            Err(e) => {
                self.record_request("decode_error", start.elapsed());
                return Err(LookupError::Decode(e));
            }
        };

        self.record_request("success", start.elapsed());

        Ok(rules)
    }
}
