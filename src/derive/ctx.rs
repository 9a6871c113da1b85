//! Context-switch rate derivation.

use chrono::{DateTime, Utc};

use crate::metric::{MetricValue, Sample};

use super::{counter_value, elapsed_secs};

/// Source counter path.
pub const SOURCE: &str = "/sys/cpu/ctx";

/// Emitted metric path.
pub const EMITTED: &str = "cpu.ctx.per.second";

/// Per-asset context-switch counter state.
///
/// The first observation only seeds the state. Subsequent observations
/// with advancing timestamp and non-decreasing counter emit the switch
/// rate per second; a counter regression reseeds without emission.
#[derive(Debug, Default)]
pub struct Ctx {
    last: Option<(DateTime<Utc>, i64)>,
}

impl Ctx {
    pub fn update(&mut self, sample: &Sample) -> Option<Sample> {
        let value = counter_value(sample)?;

        let Some((prev_ts, prev_value)) = self.last else {
            self.last = Some((sample.timestamp, value));
            return None;
        };

        // Stale or duplicate observation; keep the newer state.
        if sample.timestamp <= prev_ts {
            return None;
        }

        self.last = Some((sample.timestamp, value));

        // Counter reset; this observation becomes the new baseline.
        if value < prev_value {
            return None;
        }

        let rate = (value - prev_value) as f64 / elapsed_secs(prev_ts, sample.timestamp);

        Some(Sample {
            path: EMITTED.to_string(),
            asset_id: sample.asset_id,
            timestamp: sample.timestamp,
            value: MetricValue::Real(rate),
            tags: sample.tags.clone(),
        })
    }
}
