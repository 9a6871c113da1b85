//! Shard handler worker.
//!
//! One shard owns all derivation state for the assets routed to it and
//! processes its envelopes strictly sequentially, which is what makes the
//! per-partition ack ordering and the lock-free derivation maps sound.
//! Alarm dispatches are the only concurrency a shard creates, and those
//! are detached tasks coordinated by the in-flight tracker.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::alarm::Dispatcher;
use crate::derive::{self, Cpu, Ctx, Disk, Mem};
use crate::engine::inflight::InFlight;
use crate::eval;
use crate::export::health::HealthMetrics;
use crate::lookup::ThresholdSource;
use crate::metric::{self, DiscardFilter, Sample, HEARTBEAT_PATH};
use crate::transport::Envelope;

/// Capacity of the internal re-injection queue.
const INTERNAL_QUEUE: usize = 32;

/// Channel endpoints for feeding a shard.
#[derive(Clone)]
pub struct ShardHandle {
    /// Transport envelopes, bounded to the configured queue length.
    pub input: mpsc::Sender<Envelope>,
    /// Internal samples: derived disk metrics and supervisor heartbeats.
    /// Samples on this queue carry no commit channel and are never acked.
    pub internal: mpsc::Sender<Sample>,
}

/// Shared collaborators handed to each shard.
pub struct ShardContext<L> {
    pub lookup: Arc<L>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<HealthMetrics>,
    pub inflight: Arc<InFlight>,
    pub discard: Arc<DiscardFilter>,
    pub api_version: String,
    pub testmode: bool,
}

impl<L> Clone for ShardContext<L> {
    fn clone(&self) -> Self {
        Self {
            lookup: Arc::clone(&self.lookup),
            dispatcher: Arc::clone(&self.dispatcher),
            metrics: Arc::clone(&self.metrics),
            inflight: Arc::clone(&self.inflight),
            discard: Arc::clone(&self.discard),
            api_version: self.api_version.clone(),
            testmode: self.testmode,
        }
    }
}

pub struct Shard<L> {
    num: usize,
    ctx: ShardContext<L>,
    cancel: CancellationToken,
    death: mpsc::Sender<anyhow::Error>,
    input: mpsc::Receiver<Envelope>,
    internal_rx: mpsc::Receiver<Sample>,
    internal_tx: mpsc::Sender<Sample>,
    cpu_data: HashMap<i64, Cpu>,
    ctx_data: HashMap<i64, Ctx>,
    mem_data: HashMap<i64, Mem>,
    disk_data: HashMap<i64, HashMap<String, Disk>>,
}

impl<L: ThresholdSource> Shard<L> {
    pub fn new(
        num: usize,
        queue_length: usize,
        ctx: ShardContext<L>,
        cancel: CancellationToken,
        death: mpsc::Sender<anyhow::Error>,
    ) -> (Self, ShardHandle) {
        let (input_tx, input_rx) = mpsc::channel(queue_length);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_QUEUE);

        let handle = ShardHandle {
            input: input_tx,
            internal: internal_tx.clone(),
        };

        let shard = Self {
            num,
            ctx,
            cancel,
            death,
            input: input_rx,
            internal_rx,
            internal_tx,
            cpu_data: HashMap::new(),
            ctx_data: HashMap::new(),
            mem_data: HashMap::new(),
            disk_data: HashMap::new(),
        };

        (shard, handle)
    }

    /// Event loop: process until shutdown, then drain whatever is still
    /// buffered best-effort.
    pub async fn run(mut self) {
        debug!(shard = self.num, "shard started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                Some(sample) = self.internal_rx.recv() => {
                    if let Err(e) = self.process_sample(sample).await {
                        self.die(e).await;
                        break;
                    }
                }

                msg = self.input.recv() => {
                    match msg {
                        Some(envelope) => {
                            if let Err(e) = self.process_envelope(envelope).await {
                                self.die(e).await;
                                break;
                            }
                        }
                        // Input closed before the shutdown signal.
                        None => break,
                    }
                }
            }
        }

        self.drain().await;

        debug!(shard = self.num, "shard stopped");
    }

    /// Report a fatal error and wait for the supervisor to broadcast
    /// shutdown before draining.
    async fn die(&self, err: anyhow::Error) {
        error!(shard = self.num, error = %err, "shard fatal error");
        let _ = self.death.send(err).await;
        self.cancel.cancelled().await;
    }

    /// Best-effort processing of remaining buffered input. The input
    /// channel closes once the supervisor drops the shard handles.
    async fn drain(&mut self) {
        self.drain_internal().await;

        while let Some(envelope) = self.input.recv().await {
            let _ = self.process_envelope(envelope).await;
            self.drain_internal().await;
        }
    }

    async fn drain_internal(&mut self) {
        while let Ok(sample) = self.internal_rx.try_recv() {
            let _ = self.process_sample(sample).await;
        }
    }

    async fn process_envelope(&mut self, envelope: Envelope) -> Result<()> {
        // Empty payload: nothing to decode, but the offset still commits.
        if envelope.value.is_empty() {
            warn!(
                shard = self.num,
                host_id = envelope.host_id,
                "ignoring empty envelope",
            );
            self.ack(envelope);
            return Ok(());
        }

        let sample = match metric::parse_sample(&envelope.value) {
            Ok(sample) => sample,
            Err(e) => {
                self.ctx.metrics.parse_errors.inc();
                warn!(shard = self.num, error = %e, "undecodable sample payload");
                self.ack(envelope);
                return Ok(());
            }
        };

        let result = self.process_sample(sample).await;

        // Exactly one ack per envelope, regardless of processing outcome.
        self.ack(envelope);

        result
    }

    fn ack(&self, envelope: Envelope) {
        let ack = envelope.ack();
        if envelope.commit.send(ack).is_err() {
            warn!(shard = self.num, "commit channel closed before ack");
        }
    }

    async fn process_sample(&mut self, sample: Sample) -> Result<()> {
        if sample.path == HEARTBEAT_PATH {
            self.heartbeat();
            return Ok(());
        }

        if self.ctx.discard.matches(&sample.path) {
            self.ctx.metrics.samples_discarded.inc();
            return Ok(());
        }

        // Non-heartbeat metrics count towards processed metrics.
        self.ctx.metrics.samples_processed.inc();

        let Some(sample) = self.derive(sample) else {
            debug!(shard = self.num, "metric consumed by derivation");
            return Ok(());
        };

        let lookup_id = sample.lookup_id();
        let rules = match self.ctx.lookup.lookup(&lookup_id).await {
            Ok(rules) => rules,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                self.ctx.metrics.lookup_errors.inc();
                error!(
                    shard = self.num,
                    error = %e,
                    "fetching threshold rules, lookup service available?",
                );
                return Ok(());
            }
        };

        if rules.is_empty() {
            debug!(
                shard = self.num,
                path = %sample.path,
                asset_id = sample.asset_id,
                "no thresholds configured",
            );
            return Ok(());
        }

        debug!(
            shard = self.num,
            path = %sample.path,
            asset_id = sample.asset_id,
            lookup_id = %lookup_id,
            "forwarding for evaluation",
        );
        self.ctx.metrics.evaluations.inc();

        let events = eval::evaluate_sample(&sample, &rules, &self.ctx.api_version);
        if events.is_empty() {
            debug!(
                shard = self.num,
                path = %sample.path,
                asset_id = sample.asset_id,
                "metric matched no configurations",
            );
            return Ok(());
        }

        for event in events {
            self.ctx
                .metrics
                .evaluations_by_rule
                .with_label_values(&[&event.event_id])
                .inc();

            // Testmode counts evaluations but never posts.
            if self.ctx.testmode {
                continue;
            }

            self.ctx.metrics.alarms_dispatched.inc();
            self.ctx.metrics.inflight_dispatches.inc();

            let guard = self.ctx.inflight.use_one();
            let dispatcher = Arc::clone(&self.ctx.dispatcher);
            let metrics = Arc::clone(&self.ctx.metrics);
            tokio::spawn(async move {
                dispatcher.dispatch(&event).await;
                metrics.inflight_dispatches.dec();
                drop(guard);
            });
        }

        Ok(())
    }

    fn heartbeat(&self) {
        self.ctx.metrics.heartbeats.inc();
        debug!(shard = self.num, "heartbeat");
    }

    /// Feed derivation-source samples into the owning accumulator.
    ///
    /// CPU, CTX and memory derivations replace the sample with their
    /// emission (or consume it). Disk derivations re-inject their
    /// emissions through the internal queue and always consume the
    /// source sample.
    fn derive(&mut self, sample: Sample) -> Option<Sample> {
        let path = sample.path.as_str();

        if path == derive::ctx::SOURCE {
            return self
                .ctx_data
                .entry(sample.asset_id)
                .or_default()
                .update(&sample);
        }

        if derive::cpu::is_source(path) {
            return self
                .cpu_data
                .entry(sample.asset_id)
                .or_default()
                .update(&sample);
        }

        if derive::mem::is_source(path) {
            return self
                .mem_data
                .entry(sample.asset_id)
                .or_default()
                .update(&sample);
        }

        if derive::disk::is_source(path) {
            // The mountpoint tag keys the per-mountpoint state.
            let mount = sample.tags.first()?.clone();
            let unit = self
                .disk_data
                .entry(sample.asset_id)
                .or_default()
                .entry(mount)
                .or_default();

            for derived in unit.update(&sample) {
                // The shard itself is the only consumer of this queue, so
                // a full queue must drop rather than block.
                if self.internal_tx.try_send(derived).is_err() {
                    warn!(shard = self.num, "internal queue full, dropping derived sample");
                }
            }
            return None;
        }

        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::oneshot;

    use crate::config::{AlarmingConfig, RetryConfig};
    use crate::lookup::{LookupError, RuleSet};
    use crate::transport::Ack;

    use super::*;

    struct StaticSource {
        rules: RuleSet,
        calls: AtomicUsize,
    }

    impl StaticSource {
        fn empty() -> Self {
            Self {
                rules: RuleSet::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ThresholdSource for StaticSource {
        async fn lookup(&self, _lookup_id: &str) -> Result<RuleSet, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rules.clone())
        }
    }

    fn context(source: StaticSource) -> ShardContext<StaticSource> {
        let alarming = AlarmingConfig {
            destination: "http://alarms.invalid/events".to_string(),
            testmode: true,
            ..Default::default()
        };
        ShardContext {
            lookup: Arc::new(source),
            dispatcher: Arc::new(
                Dispatcher::new(&alarming, &RetryConfig::default()).expect("dispatcher"),
            ),
            metrics: Arc::new(HealthMetrics::new(":0").expect("metrics")),
            inflight: InFlight::new(),
            discard: Arc::new(DiscardFilter::new(&["drop.me".to_string()])),
            api_version: "1.0".to_string(),
            testmode: true,
        }
    }

    fn envelope(offset: i64, payload: &[u8]) -> (Envelope, oneshot::Receiver<Ack>) {
        let (commit, rx) = oneshot::channel();
        (
            Envelope {
                topic: "metrics".to_string(),
                partition: 0,
                offset,
                host_id: 1,
                value: payload.to_vec(),
                commit,
            },
            rx,
        )
    }

    fn payload(path: &str, asset_id: i64, value: i64, tags: &[&str]) -> Vec<u8> {
        let tags = tags
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            r#"{{"path":"{path}","assetID":{asset_id},"type":"integer","value":{value},"tags":[{tags}],"timestamp":"2024-03-01T12:00:00Z"}}"#,
        )
        .into_bytes()
    }

    async fn run_shard(
        source: StaticSource,
        envelopes: Vec<Envelope>,
    ) -> ShardContext<StaticSource> {
        let ctx = context(source);
        let cancel = CancellationToken::new();
        let (death_tx, _death_rx) = mpsc::channel(1);

        let (shard, handle) = Shard::new(0, 16, ctx.clone(), cancel.clone(), death_tx);
        let task = tokio::spawn(shard.run());

        for envelope in envelopes {
            handle.input.send(envelope).await.expect("shard alive");
        }

        // Give the shard a moment to settle, then shut it down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("shard drained")
            .expect("shard task");

        ctx
    }

    #[tokio::test]
    async fn test_every_envelope_acked_exactly_once() {
        let (good, good_rx) = envelope(1, &payload("some.metric", 1, 5, &[]));
        let (bad, bad_rx) = envelope(2, b"not json");
        let (discarded, discarded_rx) = envelope(3, &payload("drop.me", 1, 5, &[]));
        let (empty, empty_rx) = envelope(4, b"");

        let ctx = run_shard(StaticSource::empty(), vec![good, bad, discarded, empty]).await;

        assert_eq!(good_rx.await.expect("acked").offset, 1);
        assert_eq!(bad_rx.await.expect("acked").offset, 2);
        assert_eq!(discarded_rx.await.expect("acked").offset, 3);
        assert_eq!(empty_rx.await.expect("acked").offset, 4);

        assert_eq!(ctx.metrics.parse_errors.get(), 1.0);
        assert_eq!(ctx.metrics.samples_discarded.get(), 1.0);
    }

    #[tokio::test]
    async fn test_discarded_sample_makes_no_lookup() {
        let (env, rx) = envelope(1, &payload("drop.me", 1, 5, &[]));
        let ctx = run_shard(StaticSource::empty(), vec![env]).await;

        rx.await.expect("acked");
        assert_eq!(ctx.lookup.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.metrics.samples_processed.get(), 0.0);
    }

    #[tokio::test]
    async fn test_empty_ruleset_counts_processed_without_alarm() {
        let (env, rx) = envelope(1, &payload("some.metric", 1, 10, &[]));
        let ctx = run_shard(StaticSource::empty(), vec![env]).await;

        rx.await.expect("acked");
        assert_eq!(ctx.lookup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.metrics.samples_processed.get(), 1.0);
        assert_eq!(ctx.metrics.evaluations.get(), 0.0);
        assert_eq!(ctx.metrics.alarms_dispatched.get(), 0.0);
    }

    #[tokio::test]
    async fn test_heartbeat_touches_hook_without_lookup_or_ack() {
        let ctx = context(StaticSource::empty());
        let cancel = CancellationToken::new();
        let (death_tx, _death_rx) = mpsc::channel(1);

        let (shard, handle) = Shard::new(0, 16, ctx.clone(), cancel.clone(), death_tx);
        let task = tokio::spawn(shard.run());

        let beat = Sample {
            path: HEARTBEAT_PATH.to_string(),
            asset_id: 0,
            timestamp: Utc::now(),
            value: crate::metric::MetricValue::Integer(1),
            tags: Vec::new(),
        };
        handle.internal.send(beat).await.expect("shard alive");

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        drop(handle);
        task.await.expect("shard task");

        assert_eq!(ctx.metrics.heartbeats.get(), 1.0);
        assert_eq!(ctx.lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_derivation_source_consumed_without_lookup_on_first_sample() {
        let (env, rx) = envelope(1, &payload("/sys/cpu/ctx", 9, 1000, &[]));
        let ctx = run_shard(StaticSource::empty(), vec![env]).await;

        rx.await.expect("acked");
        // First CTX observation only seeds state; nothing to evaluate.
        assert_eq!(ctx.lookup.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.metrics.samples_processed.get(), 1.0);
    }

    #[tokio::test]
    async fn test_disk_derivations_reinjected_and_evaluated() {
        let (total, total_rx) = envelope(1, &payload("/sys/disk/blk_total", 9, 1000, &["/var"]));
        let (used, used_rx) = envelope(2, &payload("/sys/disk/blk_used", 9, 250, &["/var"]));

        let ctx = run_shard(StaticSource::empty(), vec![total, used]).await;

        total_rx.await.expect("acked");
        used_rx.await.expect("acked");

        // Both raw counters processed, plus the two re-injected derived
        // samples (disk.free and disk.usage.percent), which are internal
        // metrics and go through lookup.
        assert_eq!(ctx.metrics.samples_processed.get(), 4.0);
        assert_eq!(ctx.lookup.calls.load(Ordering::SeqCst), 2);
    }
}
