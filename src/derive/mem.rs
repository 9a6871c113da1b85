//! Memory usage percentage derivation.

use chrono::{DateTime, Utc};

use crate::metric::{MetricValue, Sample};

use super::counter_value;

/// Emitted metric path.
pub const EMITTED: &str = "memory.usage.percent";

/// Source counter paths, one per subcounter slot. The swap fields are
/// part of the wire family and tracked, but no swap metric is emitted.
const SOURCES: [&str; 8] = [
    "/sys/memory/active",
    "/sys/memory/buffers",
    "/sys/memory/cached",
    "/sys/memory/free",
    "/sys/memory/inactive",
    "/sys/memory/swapfree",
    "/sys/memory/swaptotal",
    "/sys/memory/total",
];

const BUFFERS: usize = 1;
const CACHED: usize = 2;
const FREE: usize = 3;
const TOTAL: usize = 7;

/// Returns true for paths belonging to the memory counter family.
pub fn is_source(path: &str) -> bool {
    SOURCES.contains(&path)
}

/// Per-asset memory counter state. Emits the usage percentage on every
/// update once a positive total has been observed.
#[derive(Debug, Default)]
pub struct Mem {
    values: [Option<(DateTime<Utc>, i64)>; 8],
}

impl Mem {
    pub fn update(&mut self, sample: &Sample) -> Option<Sample> {
        let slot = SOURCES.iter().position(|p| *p == sample.path)?;
        let value = counter_value(sample)?;

        match self.values[slot] {
            Some((ts, _)) if sample.timestamp < ts => return None,
            _ => self.values[slot] = Some((sample.timestamp, value)),
        }

        let total = self.value(TOTAL)?;
        if total <= 0 {
            return None;
        }

        let used = total - self.value_or_zero(FREE) - self.value_or_zero(BUFFERS)
            - self.value_or_zero(CACHED);

        Some(Sample {
            path: EMITTED.to_string(),
            asset_id: sample.asset_id,
            timestamp: sample.timestamp,
            value: MetricValue::Real(100.0 * used as f64 / total as f64),
            tags: sample.tags.clone(),
        })
    }

    fn value(&self, slot: usize) -> Option<i64> {
        self.values[slot].map(|(_, v)| v)
    }

    fn value_or_zero(&self, slot: usize) -> i64 {
        self.value(slot).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sample(path: &str, secs: i64, value: i64) -> Sample {
        Sample {
            path: path.to_string(),
            asset_id: 13,
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            value: MetricValue::Integer(value),
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_no_emission_before_total() {
        let mut mem = Mem::default();
        assert!(mem.update(&sample("/sys/memory/free", 0, 4096)).is_none());
        assert!(mem.update(&sample("/sys/memory/cached", 0, 512)).is_none());
    }

    #[test]
    fn test_usage_from_non_swap_fields() {
        let mut mem = Mem::default();
        mem.update(&sample("/sys/memory/free", 0, 2000));
        mem.update(&sample("/sys/memory/buffers", 0, 500));
        mem.update(&sample("/sys/memory/cached", 0, 500));

        let emitted = mem
            .update(&sample("/sys/memory/total", 0, 10_000))
            .expect("usage emitted");
        assert_eq!(emitted.path, EMITTED);
        // used = 10000 - 2000 - 500 - 500 = 7000
        assert_eq!(emitted.value, MetricValue::Real(70.0));
    }

    #[test]
    fn test_emits_on_every_update_once_total_known() {
        let mut mem = Mem::default();
        mem.update(&sample("/sys/memory/total", 0, 10_000));

        let emitted = mem
            .update(&sample("/sys/memory/free", 5, 5000))
            .expect("usage emitted");
        assert_eq!(emitted.value, MetricValue::Real(50.0));
        assert_eq!(emitted.timestamp, sample("", 5, 0).timestamp);

        // Swap updates also trigger an emission, but no swap metric exists.
        let emitted = mem
            .update(&sample("/sys/memory/swapfree", 6, 100))
            .expect("usage emitted");
        assert_eq!(emitted.path, EMITTED);
    }

    #[test]
    fn test_zero_total_suppresses_emission() {
        let mut mem = Mem::default();
        assert!(mem.update(&sample("/sys/memory/total", 0, 0)).is_none());
    }

    #[test]
    fn test_foreign_path_is_ignored() {
        let mut mem = Mem::default();
        assert!(mem.update(&sample("/sys/memory/swapcached", 0, 1)).is_none());
    }
}
