//! CPU usage percentage derivation.

use chrono::{DateTime, Utc};

use crate::metric::{MetricValue, Sample};

use super::counter_value;

/// Emitted metric path.
pub const EMITTED: &str = "cpu.usage.percent";

/// Source counter paths, one per subcounter slot.
const SOURCES: [&str; 7] = [
    "/sys/cpu/count/idle",
    "/sys/cpu/count/iowait",
    "/sys/cpu/count/irq",
    "/sys/cpu/count/nice",
    "/sys/cpu/count/softirq",
    "/sys/cpu/count/system",
    "/sys/cpu/count/user",
];

const IDLE: usize = 0;

/// Returns true for paths belonging to the CPU counter family.
pub fn is_source(path: &str) -> bool {
    SOURCES.contains(&path)
}

/// Per-asset CPU counter state.
///
/// Collects the seven subcounters keyed by path. Once all seven carry the
/// same, latest timestamp the usage percentage is emitted for that
/// timestamp; the set is then marked consumed so the next complete set
/// re-emits.
#[derive(Debug, Default)]
pub struct Cpu {
    counters: [Option<(DateTime<Utc>, i64)>; 7],
    emitted_at: Option<DateTime<Utc>>,
}

impl Cpu {
    pub fn update(&mut self, sample: &Sample) -> Option<Sample> {
        let slot = SOURCES.iter().position(|p| *p == sample.path)?;
        let value = counter_value(sample)?;

        match self.counters[slot] {
            Some((ts, _)) if sample.timestamp < ts => return None,
            _ => self.counters[slot] = Some((sample.timestamp, value)),
        }

        self.calculate(sample)
    }

    fn calculate(&mut self, origin: &Sample) -> Option<Sample> {
        let mut values = [0i64; 7];
        let mut latest: Option<DateTime<Utc>> = None;

        for (slot, counter) in self.counters.iter().enumerate() {
            let (ts, value) = (*counter)?;
            values[slot] = value;
            latest = Some(latest.map_or(ts, |l| l.max(ts)));
        }
        let latest = latest?;

        // The set is complete only when every subcounter is at the latest
        // timestamp, and each set is consumed at most once.
        if self.counters.iter().any(|c| c.map(|(ts, _)| ts) != Some(latest)) {
            return None;
        }
        if self.emitted_at == Some(latest) {
            return None;
        }
        self.emitted_at = Some(latest);

        let busy: i64 = values
            .iter()
            .enumerate()
            .filter(|(slot, _)| *slot != IDLE)
            .map(|(_, v)| *v)
            .sum();
        let total = busy + values[IDLE];
        if total <= 0 {
            return None;
        }

        Some(Sample {
            path: EMITTED.to_string(),
            asset_id: origin.asset_id,
            timestamp: latest,
            value: MetricValue::Real(100.0 * busy as f64 / total as f64),
            tags: origin.tags.clone(),
        })
    }
}
