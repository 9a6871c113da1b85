//! Engine orchestration: shard pool, router, heartbeat, shutdown.

pub mod inflight;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::alarm::Dispatcher;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::lookup::ThresholdSource;
use crate::metric::{self, DiscardFilter, MetricValue, Sample, HEARTBEAT_PATH};
use crate::shard::{Shard, ShardContext, ShardHandle};
use crate::transport::{self, Envelope};

use self::inflight::InFlight;

/// Engine wires the ingest input to a fixed pool of shard workers and
/// owns the supporting tasks: the router, the heartbeat timer, and the
/// death watcher that turns a shard failure into a full shutdown.
pub struct Engine<L> {
    cfg: Config,
    metrics: Arc<HealthMetrics>,
    lookup: Arc<L>,
    inflight: Arc<InFlight>,
    cancel: CancellationToken,
    input_tx: mpsc::Sender<Envelope>,
    input_rx: Option<mpsc::Receiver<Envelope>>,
    handles: Vec<ShardHandle>,
    shard_tasks: Vec<JoinHandle<()>>,
}

impl<L: ThresholdSource> Engine<L> {
    /// Creates a new engine, initializing its own health metrics.
    pub fn new(cfg: Config, lookup: L) -> Result<Self> {
        let metrics =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        Ok(Self::with_metrics(cfg, lookup, metrics))
    }

    /// Creates a new engine sharing an externally built metrics registry,
    /// so collaborators like the lookup client can report into it.
    pub fn with_metrics(cfg: Config, lookup: L, metrics: Arc<HealthMetrics>) -> Self {
        let (input_tx, input_rx) = mpsc::channel(cfg.handler_queue_length);

        Self {
            cfg,
            metrics,
            lookup: Arc::new(lookup),
            inflight: InFlight::new(),
            cancel: CancellationToken::new(),
            input_tx,
            input_rx: Some(input_rx),
            handles: Vec::new(),
            shard_tasks: Vec::new(),
        }
    }

    /// The ingest-facing input channel.
    pub fn input(&self) -> mpsc::Sender<Envelope> {
        self.input_tx.clone()
    }

    /// Token cancelled when the engine shuts down.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.metrics)
    }

    /// The threshold source shared by the shard workers.
    pub fn lookup_source(&self) -> &L {
        &self.lookup
    }

    /// Start the health server, shard pool, and supporting tasks.
    pub async fn start(&mut self) -> Result<()> {
        self.metrics
            .start()
            .await
            .context("starting health metrics server")?;

        let dispatcher = Arc::new(
            Dispatcher::new(&self.cfg.alarming, &self.cfg.retry)
                .context("creating alarm dispatcher")?,
        );
        let discard = Arc::new(DiscardFilter::new(&self.cfg.discard_metrics));

        let shard_count = self.cfg.shard_count();
        let (death_tx, death_rx) = mpsc::channel(shard_count);

        for num in 0..shard_count {
            let ctx = ShardContext {
                lookup: Arc::clone(&self.lookup),
                dispatcher: Arc::clone(&dispatcher),
                metrics: Arc::clone(&self.metrics),
                inflight: Arc::clone(&self.inflight),
                discard: Arc::clone(&discard),
                api_version: self.cfg.alarming.api_version.clone(),
                testmode: self.cfg.alarming.testmode,
            };

            let (shard, handle) = Shard::new(
                num,
                self.cfg.handler_queue_length,
                ctx,
                self.cancel.clone(),
                death_tx.clone(),
            );

            self.handles.push(handle);
            self.shard_tasks.push(tokio::spawn(shard.run()));
        }
        drop(death_tx);

        self.spawn_death_watcher(death_rx);
        self.spawn_router();
        self.spawn_heartbeat();

        info!(
            shards = shard_count,
            testmode = self.cfg.alarming.testmode,
            "engine started",
        );

        Ok(())
    }

    /// Gracefully stop: signal shutdown, let the shards drain, then wait
    /// out the in-flight dispatches before declaring the engine stopped.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        // Dropping the shard handles closes the input channels so the
        // shard drain loops can terminate.
        self.handles.clear();

        for task in self.shard_tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "shard task join failed");
            }
        }

        self.inflight.wait().await;

        self.metrics.stop().await?;

        info!("engine stopped");

        Ok(())
    }

    /// Turn the first shard death into a broadcast shutdown.
    fn spawn_death_watcher(&self, mut death_rx: mpsc::Receiver<anyhow::Error>) {
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                Some(err) = death_rx.recv() => {
                    error!(error = %err, "shard died, initiating shutdown");
                    cancel.cancel();
                }
            }
        });
    }

    /// Route ingest envelopes to their owning shard, applying the
    /// universal ignore set and the age cutoff before shard selection.
    fn spawn_router(&mut self) {
        let mut input = self.input_rx.take().expect("start called more than once");
        let handles = self.handles.clone();
        let cancel = self.cancel.clone();
        let metrics = Arc::clone(&self.metrics);
        let max_age = chrono::Duration::from_std(self.cfg.metrics_max_age)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = input.recv() => {
                        let Some(envelope) = msg else { return };
                        route(envelope, &handles, &metrics, max_age).await;
                    }
                }
            }
        });
    }

    /// Inject the liveness sample into shard 0 on a fixed interval.
    fn spawn_heartbeat(&self) {
        let Some(shard0) = self.handles.first().cloned() else {
            return;
        };
        let cancel = self.cancel.clone();
        let interval = self.cfg.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Consume the immediate first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let beat = Sample {
                            path: HEARTBEAT_PATH.to_string(),
                            asset_id: 0,
                            timestamp: Utc::now(),
                            value: MetricValue::Integer(1),
                            tags: Vec::new(),
                        };

                        if shard0.internal.try_send(beat).is_err() {
                            warn!("shard 0 internal queue full, dropping heartbeat");
                        }
                    }
                }
            }
        });
    }
}

/// Forward one envelope to its shard, or ack it right away when ingest
/// filtering drops it.
async fn route(
    envelope: Envelope,
    handles: &[ShardHandle],
    metrics: &HealthMetrics,
    max_age: chrono::Duration,
) {
    let info = match transport::peek_route(&envelope.value) {
        Ok(info) => info,
        Err(_) => {
            // Undecodable payloads go to shard 0, whose full parse logs
            // and acks them.
            if let Some(first) = handles.first() {
                let _ = first.input.send(envelope).await;
            }
            return;
        }
    };

    if metric::is_universally_ignored(&info.path) {
        metrics.samples_discarded.inc();
        ack_now(envelope);
        return;
    }

    // Metrics too old for useful alerting are not worth a shard's time.
    if info.timestamp < Utc::now() - max_age {
        metrics.samples_discarded.inc();
        warn!(
            path = %info.path,
            timestamp = %info.timestamp,
            "skipping metric due to age",
        );
        ack_now(envelope);
        return;
    }

    let index = shard_index(info.asset_id, handles.len());
    metrics
        .shard_routed
        .with_label_values(&[&index.to_string()])
        .inc();

    if handles[index].input.send(envelope).await.is_err() {
        warn!(shard = index, "shard input closed, dropping envelope");
    }
}

fn ack_now(envelope: Envelope) {
    let ack = envelope.ack();
    let _ = envelope.commit.send(ack);
}

/// Stable shard assignment: every sample of one asset lands on the same
/// shard, which is what keeps derivation state shard-exclusive.
pub fn shard_index(asset_id: i64, shards: usize) -> usize {
    asset_id.rem_euclid(shards as i64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_index_affinity() {
        for asset_id in [0i64, 1, 7, 8, 1_000_003] {
            let first = shard_index(asset_id, 8);
            assert!(first < 8);
            assert_eq!(first, shard_index(asset_id, 8));
        }
    }

    #[test]
    fn test_shard_index_handles_negative_asset_ids() {
        let index = shard_index(-3, 8);
        assert!(index < 8);
    }

    #[test]
    fn test_shard_index_single_shard() {
        assert_eq!(shard_index(12345, 1), 0);
    }
}
