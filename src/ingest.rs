//! NDJSON stdin ingest driver.
//!
//! Stand-in for an external stream transport: every stdin line is one
//! sample payload, wrapped into an envelope on a single partition with
//! monotonically increasing offsets. A commit watcher consumes the acks
//! in receipt order and maintains the per-partition watermark, logging
//! offset gaps the way the upstream consumer does.

use std::collections::HashMap;

use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::transport::{Ack, Envelope};

const TOPIC: &str = "stdin";

/// Read sample payloads from stdin and feed them to the engine until EOF
/// or cancellation. Returns the number of acknowledged envelopes.
pub async fn run_stdin(input: mpsc::Sender<Envelope>, cancel: CancellationToken) -> u64 {
    let (pending_tx, pending_rx) = mpsc::unbounded_channel();
    let watcher = tokio::spawn(watch_commits(pending_rx));

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut offset = 0i64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        let (commit, commit_rx) = oneshot::channel();
                        let envelope = Envelope {
                            topic: TOPIC.to_string(),
                            partition: 0,
                            offset,
                            host_id: 0,
                            value: line.into_bytes(),
                            commit,
                        };

                        if pending_tx.send(commit_rx).is_err() {
                            break;
                        }

                        // The engine applies backpressure through this
                        // bounded channel; racing the cancellation keeps
                        // shutdown from hanging on a full queue.
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            result = input.send(envelope) => {
                                if result.is_err() {
                                    warn!("engine input closed, stopping ingest");
                                    break;
                                }
                            }
                        }

                        offset += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "reading stdin");
                        break;
                    }
                }
            }
        }
    }

    drop(pending_tx);
    let processed = watcher.await.unwrap_or(0);

    info!(processed, "ingest finished");

    processed
}

/// Consume acks in receipt order and keep the commit watermark per
/// (topic, partition). An out-of-order or gapped offset is logged; a
/// dropped commit channel means the envelope was lost in shutdown.
async fn watch_commits(mut pending: mpsc::UnboundedReceiver<oneshot::Receiver<Ack>>) -> u64 {
    let mut watermarks: HashMap<(String, i32), i64> = HashMap::new();
    let mut processed = 0u64;

    while let Some(commit_rx) = pending.recv().await {
        let Ok(ack) = commit_rx.await else {
            warn!("envelope dropped without acknowledgement");
            continue;
        };

        let key = (ack.topic.clone(), ack.partition);
        if let Some(prev) = watermarks.get(&key) {
            if ack.offset != prev + 1 {
                warn!(
                    topic = %ack.topic,
                    partition = ack.partition,
                    expected = prev + 1,
                    found = ack.offset,
                    "unexpected commit offset",
                );
            }
        }
        watermarks.insert(key, ack.offset);
        processed += 1;
    }

    processed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(offset: i64) -> Ack {
        Ack {
            topic: TOPIC.to_string(),
            partition: 0,
            offset,
        }
    }

    #[tokio::test]
    async fn test_watch_commits_counts_in_receipt_order() {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let watcher = tokio::spawn(watch_commits(pending_rx));

        let mut senders = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            pending_tx.send(rx).expect("watcher alive");
            senders.push(tx);
        }
        drop(pending_tx);

        // Resolve out of order; the watcher still consumes in receipt
        // order, so the watermark advances 0, 1, 2.
        for (offset, tx) in senders.into_iter().enumerate().rev() {
            tx.send(ack(offset as i64)).expect("watcher waiting");
        }

        assert_eq!(watcher.await.expect("watcher task"), 3);
    }

    #[tokio::test]
    async fn test_watch_commits_survives_dropped_envelopes() {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let watcher = tokio::spawn(watch_commits(pending_rx));

        let (first, first_rx) = oneshot::channel();
        let (lost, lost_rx) = oneshot::channel::<Ack>();
        let (third, third_rx) = oneshot::channel();
        pending_tx.send(first_rx).expect("watcher alive");
        pending_tx.send(lost_rx).expect("watcher alive");
        pending_tx.send(third_rx).expect("watcher alive");
        drop(pending_tx);

        first.send(ack(0)).expect("watcher waiting");
        drop(lost);
        third.send(ack(2)).expect("watcher waiting");

        assert_eq!(watcher.await.expect("watcher task"), 2);
    }
}
