//! Per-mountpoint disk derivation.
//!
//! A disk counter sample names its mountpoint in `tags[0]`; the shard
//! keys one [`Disk`] instance per (asset, mountpoint). One update can
//! emit up to four derived samples, each suffixed with the mountpoint:
//! `disk.free:<mount>`, `disk.usage.percent:<mount>`,
//! `disk.read.per.second:<mount>`, `disk.write.per.second:<mount>`.

use chrono::{DateTime, Utc};

use crate::metric::{MetricValue, Sample};

use super::{counter_value, elapsed_secs};

pub const BLK_TOTAL: &str = "/sys/disk/blk_total";
pub const BLK_USED: &str = "/sys/disk/blk_used";
pub const BLK_READ: &str = "/sys/disk/blk_read";
pub const BLK_WRTN: &str = "/sys/disk/blk_wrtn";

/// Returns true for paths belonging to the disk counter family.
pub fn is_source(path: &str) -> bool {
    matches!(path, BLK_TOTAL | BLK_USED | BLK_READ | BLK_WRTN)
}

type Observation = (DateTime<Utc>, i64);

/// Per-(asset, mountpoint) disk counter state.
#[derive(Debug, Default)]
pub struct Disk {
    total: Option<Observation>,
    used: Option<Observation>,
    read: Option<Observation>,
    wrtn: Option<Observation>,
    emitted_usage_at: Option<DateTime<Utc>>,
}

impl Disk {
    pub fn update(&mut self, sample: &Sample) -> Vec<Sample> {
        let Some(mount) = sample.tags.first() else {
            // A disk counter without a mountpoint tag cannot be keyed.
            return Vec::new();
        };
        let Some(value) = counter_value(sample) else {
            return Vec::new();
        };

        let mut out = Vec::new();

        match sample.path.as_str() {
            BLK_TOTAL => {
                store_latest(&mut self.total, sample.timestamp, value);
                self.emit_capacity(mount, sample, &mut out);
            }
            BLK_USED => {
                store_latest(&mut self.used, sample.timestamp, value);
                self.emit_capacity(mount, sample, &mut out);
            }
            BLK_READ => {
                if let Some(rate) = advance_counter(&mut self.read, sample.timestamp, value) {
                    out.push(derived(
                        format!("disk.read.per.second:{mount}"),
                        sample,
                        MetricValue::Real(rate),
                        sample.timestamp,
                    ));
                }
            }
            BLK_WRTN => {
                if let Some(rate) = advance_counter(&mut self.wrtn, sample.timestamp, value) {
                    out.push(derived(
                        format!("disk.write.per.second:{mount}"),
                        sample,
                        MetricValue::Real(rate),
                        sample.timestamp,
                    ));
                }
            }
            _ => {}
        }

        out
    }

    /// Emit free space and usage percent once total and used share the
    /// latest timestamp. Each matched pair is consumed at most once.
    fn emit_capacity(&mut self, mount: &str, origin: &Sample, out: &mut Vec<Sample>) {
        let (Some((total_ts, total)), Some((used_ts, used))) = (self.total, self.used) else {
            return;
        };
        if total_ts != used_ts || total <= 0 {
            return;
        }
        if self.emitted_usage_at == Some(total_ts) {
            return;
        }
        self.emitted_usage_at = Some(total_ts);

        out.push(derived(
            format!("disk.free:{mount}"),
            origin,
            MetricValue::Integer(total - used),
            total_ts,
        ));
        out.push(derived(
            format!("disk.usage.percent:{mount}"),
            origin,
            MetricValue::Real(100.0 * used as f64 / total as f64),
            total_ts,
        ));
    }
}

fn derived(
    path: String,
    origin: &Sample,
    value: MetricValue,
    timestamp: DateTime<Utc>,
) -> Sample {
    Sample {
        path,
        asset_id: origin.asset_id,
        timestamp,
        value,
        tags: origin.tags.clone(),
    }
}

/// Keep the newest observation for a gauge-like counter.
fn store_latest(slot: &mut Option<Observation>, ts: DateTime<Utc>, value: i64) {
    match *slot {
        Some((prev_ts, _)) if ts < prev_ts => {}
        _ => *slot = Some((ts, value)),
    }
}

/// Advance a monotonic counter, returning the per-second rate against the
/// previous observation. A regression reseeds without a rate.
fn advance_counter(slot: &mut Option<Observation>, ts: DateTime<Utc>, value: i64) -> Option<f64> {
    let Some((prev_ts, prev_value)) = *slot else {
        *slot = Some((ts, value));
        return None;
    };

    if ts <= prev_ts {
        return None;
    }

    *slot = Some((ts, value));

    if value < prev_value {
        return None;
    }

    Some((value - prev_value) as f64 / elapsed_secs(prev_ts, ts))
}
