use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Process-wide prometheus metrics for engine health and throughput.
///
/// All metrics use the "cyclone" namespace. The pipeline meters
/// (processed / discarded / evaluations / alarms) are the engine's core
/// throughput signal; the rest are operational diagnostics.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Pipeline meters ===
    /// Total non-heartbeat samples accepted for processing.
    pub samples_processed: Counter,
    /// Total samples dropped by the discard filter or the age cutoff.
    pub samples_discarded: Counter,
    /// Total samples forwarded to threshold evaluation.
    pub evaluations: Counter,
    /// Total alarm events handed to the dispatcher.
    pub alarms_dispatched: Counter,

    // === Diagnostics ===
    /// Total envelope payloads that failed to decode.
    pub parse_errors: Counter,
    /// Total failed threshold lookups.
    pub lookup_errors: Counter,
    /// Lookup requests by status label.
    pub lookup_requests: CounterVec,
    /// Lookup request duration.
    pub lookup_duration: Histogram,
    /// Evaluations by rule id.
    pub evaluations_by_rule: CounterVec,
    /// Total heartbeat ticks observed by shard 0.
    pub heartbeats: Counter,
    /// Alarm dispatches currently in flight.
    pub inflight_dispatches: Gauge,
    /// Envelopes routed per shard.
    pub shard_routed: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let samples_processed = Counter::with_opts(
            Opts::new(
                "samples_processed_total",
                "Total non-heartbeat samples accepted for processing.",
            )
            .namespace("cyclone"),
        )?;
        let samples_discarded = Counter::with_opts(
            Opts::new(
                "samples_discarded_total",
                "Total samples dropped by the discard filter or the age cutoff.",
            )
            .namespace("cyclone"),
        )?;
        let evaluations = Counter::with_opts(
            Opts::new(
                "evaluations_total",
                "Total samples forwarded to threshold evaluation.",
            )
            .namespace("cyclone"),
        )?;
        let alarms_dispatched = Counter::with_opts(
            Opts::new(
                "alarms_dispatched_total",
                "Total alarm events handed to the dispatcher.",
            )
            .namespace("cyclone"),
        )?;
        let parse_errors = Counter::with_opts(
            Opts::new(
                "parse_errors_total",
                "Total envelope payloads that failed to decode.",
            )
            .namespace("cyclone"),
        )?;
        let lookup_errors = Counter::with_opts(
            Opts::new("lookup_errors_total", "Total failed threshold lookups.")
                .namespace("cyclone"),
        )?;
        let lookup_requests = CounterVec::new(
            Opts::new(
                "lookup_requests_total",
                "Total threshold lookup requests by status.",
            )
            .namespace("cyclone"),
            &["status"],
        )?;
        let lookup_duration = Histogram::with_opts(
            HistogramOpts::new(
                "lookup_duration_seconds",
                "Threshold lookup request duration.",
            )
            .namespace("cyclone")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let evaluations_by_rule = CounterVec::new(
            Opts::new(
                "evaluations_by_rule_total",
                "Total rule evaluations by rule id.",
            )
            .namespace("cyclone"),
            &["rule_id"],
        )?;
        let heartbeats = Counter::with_opts(
            Opts::new(
                "heartbeats_total",
                "Total heartbeat ticks observed by shard 0.",
            )
            .namespace("cyclone"),
        )?;
        let inflight_dispatches = Gauge::with_opts(
            Opts::new(
                "inflight_dispatches",
                "Alarm dispatches currently in flight.",
            )
            .namespace("cyclone"),
        )?;
        let shard_routed = CounterVec::new(
            Opts::new("shard_routed_total", "Envelopes routed per shard.").namespace("cyclone"),
            &["shard"],
        )?;

        registry.register(Box::new(samples_processed.clone()))?;
        registry.register(Box::new(samples_discarded.clone()))?;
        registry.register(Box::new(evaluations.clone()))?;
        registry.register(Box::new(alarms_dispatched.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(lookup_errors.clone()))?;
        registry.register(Box::new(lookup_requests.clone()))?;
        registry.register(Box::new(lookup_duration.clone()))?;
        registry.register(Box::new(evaluations_by_rule.clone()))?;
        registry.register(Box::new(heartbeats.clone()))?;
        registry.register(Box::new(inflight_dispatches.clone()))?;
        registry.register(Box::new(shard_routed.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            samples_processed,
            samples_discarded,
            evaluations,
            alarms_dispatched,
            parse_errors,
            lookup_errors,
            lookup_requests,
            lookup_duration,
            evaluations_by_rule,
            heartbeats,
            inflight_dispatches,
            shard_routed,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_count() {
        let metrics = HealthMetrics::new(":0").expect("metrics build");

        metrics.samples_processed.inc();
        metrics.samples_processed.inc();
        metrics.samples_discarded.inc();
        metrics
            .evaluations_by_rule
            .with_label_values(&["rule-1"])
            .inc();

        assert_eq!(metrics.samples_processed.get(), 2.0);
        assert_eq!(metrics.samples_discarded.get(), 1.0);
        assert_eq!(
            metrics
                .evaluations_by_rule
                .with_label_values(&["rule-1"])
                .get(),
            1.0,
        );
    }

    #[test]
    fn test_registry_gathers_namespaced_families() {
        let metrics = HealthMetrics::new(":0").expect("metrics build");
        metrics.samples_processed.inc();

        let families = metrics.registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "cyclone_samples_processed_total"));
    }
}
