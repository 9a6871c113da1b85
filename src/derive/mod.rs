//! Stateful per-asset derivation units.
//!
//! Each unit folds a family of raw system counters into a higher-order
//! rate or percentage metric. State is owned by the handling shard, so
//! updates are plain `&mut` calls with no locking. Derivation never
//! fails: missing predecessors, stale timestamps, and counter resets all
//! yield no emission.

pub mod cpu;
pub mod ctx;
pub mod disk;
pub mod mem;

pub use cpu::Cpu;
pub use ctx::Ctx;
pub use disk::Disk;
pub use mem::Mem;

use crate::metric::{MetricValue, Sample};

/// Extract the integer payload of a raw counter sample. A real payload on
/// a counter path is a programmer error upstream; it is logged and the
/// sample dropped.
pub(crate) fn counter_value(sample: &Sample) -> Option<i64> {
    match sample.value {
        MetricValue::Integer(v) => Some(v),
        MetricValue::Real(_) => {
            tracing::error!(
                path = %sample.path,
                asset_id = sample.asset_id,
                "counter sample carries a real payload, dropping",
            );
            None
        }
    }
}

/// Seconds between two sample timestamps, with millisecond resolution.
pub(crate) fn elapsed_secs(
    from: chrono::DateTime<chrono::Utc>,
    to: chrono::DateTime<chrono::Utc>,
) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}
