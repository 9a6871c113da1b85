//! Metric sample model and wire decoding.
//!
//! Samples arrive as JSON payloads in the legacy metric schema carried by
//! transport envelopes. Decoding validates the declared `type` against the
//! actual value payload once, so downstream code only ever sees a typed
//! [`MetricValue`].

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Path of the synthetic liveness sample injected by the supervisor.
pub const HEARTBEAT_PATH: &str = "_internal.cyclone.heartbeat";

/// Errors that can occur while decoding a sample payload.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid sample payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown sample type: {0}")]
    UnknownType(String),

    #[error("sample value does not match declared type {declared}")]
    ValueMismatch { declared: String },
}

/// A numeric sample value, typed by the wire `type` field.
/// `integer` and `long` both map to [`MetricValue::Integer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Integer(i64),
    Real(f64),
}

/// One metric observation pulled from ingest or produced by derivation.
#[derive(Debug, Clone)]
pub struct Sample {
    pub path: String,
    pub asset_id: i64,
    pub timestamp: DateTime<Utc>,
    pub value: MetricValue,
    pub tags: Vec<String>,
}

impl Sample {
    /// Deterministic key used to consult the threshold rule store.
    pub fn lookup_id(&self) -> String {
        format!("{}-{}", self.asset_id, self.path)
    }
}

/// Legacy JSON wire format of a sample.
#[derive(Deserialize)]
struct SampleWire {
    path: String,
    #[serde(rename = "assetID")]
    asset_id: i64,
    #[serde(rename = "type")]
    kind: String,
    value: serde_json::Value,
    #[serde(default)]
    tags: Vec<String>,
    timestamp: DateTime<Utc>,
}

/// Decode a sample from an envelope payload.
pub fn parse_sample(data: &[u8]) -> Result<Sample, ParseError> {
    let wire: SampleWire = serde_json::from_slice(data)?;

    let value = match wire.kind.as_str() {
        "integer" | "long" => wire.value.as_i64().map(MetricValue::Integer),
        "real" => wire.value.as_f64().map(MetricValue::Real),
        other => return Err(ParseError::UnknownType(other.to_string())),
    };
    let Some(value) = value else {
        return Err(ParseError::ValueMismatch {
            declared: wire.kind,
        });
    };

    Ok(Sample {
        path: wire.path,
        asset_id: wire.asset_id,
        timestamp: wire.timestamp,
        value,
        tags: wire.tags,
    })
}

/// Returns true for metrics generated by cyclone itself or sent by the
/// main daemon, which are evaluated against every configured rule without
/// requiring a tag match.
pub fn is_internal_metric(path: &str) -> bool {
    match path {
        // internal metrics generated by cyclone
        "cpu.ctx.per.second" | "cpu.usage.percent" | "memory.usage.percent" => true,
        // internal metrics sent by the main daemon
        "/sys/cpu/blocked"
        | "/sys/cpu/uptime"
        | "/sys/load/300s"
        | "/sys/load/60s"
        | "/sys/load/900s"
        | "/sys/load/running_proc"
        | "/sys/load/total_proc" => true,
        _ => {
            path.starts_with("disk.free:")
                || path.starts_with("disk.read.per.second:")
                || path.starts_with("disk.usage.percent:")
                || path.starts_with("disk.write.per.second:")
        }
    }
}

/// Paths the upstream daemon emits but cyclone never evaluates.
const UNIVERSAL_IGNORES: &[&str] = &[
    "/sys/disk/fs",
    "/sys/disk/mounts",
    "/sys/net/mac",
    "/sys/net/rx_bytes",
    "/sys/net/rx_packets",
    "/sys/net/tx_bytes",
    "/sys/net/tx_packets",
    "/sys/memory/swapcached",
    "/sys/load/last_pid",
    "/sys/cpu/idletime",
    "/sys/cpu/MHz",
    "/sys/net/bondslave",
    "/sys/net/connstates/ipv4",
    "/sys/net/connstates/ipv6",
    "/sys/net/duplex",
    "/sys/net/ipv4_addr",
    "/sys/net/ipv6_addr",
    "/sys/net/speed",
    "/sys/net/ipvs/conn/count",
    "/sys/net/ipvs/conn/servercount",
    "/sys/net/ipvs/conn/serverstatecount",
    "/sys/net/ipvs/conn/statecount",
    "/sys/net/ipvs/conn/vipconns",
    "/sys/net/ipvs/conn/vipstatecount",
    "/sys/net/ipvs/count",
    "/sys/net/ipvs/detail",
    "/sys/net/ipvs/state",
    "/sys/net/quagga/bgp/announce",
    "/sys/net/quagga/bgp/connage",
    "/sys/net/quagga/bgp/connstate",
    "/sys/net/quagga/bgp/neighbour",
];

/// Exact-match set of paths dropped before any downstream work.
///
/// The hardcoded upstream ignore set is always included; operator-supplied
/// paths from `discard_metrics` are added on top.
#[derive(Debug, Clone)]
pub struct DiscardFilter {
    paths: HashSet<String>,
}

impl DiscardFilter {
    pub fn new(configured: &[String]) -> Self {
        let mut paths: HashSet<String> =
            UNIVERSAL_IGNORES.iter().map(|p| p.to_string()).collect();
        paths.extend(configured.iter().cloned());
        Self { paths }
    }

    pub fn matches(&self, path: &str) -> bool {
        self.paths.contains(path)
    }
}

/// Returns true for paths in the hardcoded upstream ignore set. The router
/// drops these before shard selection.
pub fn is_universally_ignored(path: &str) -> bool {
    UNIVERSAL_IGNORES.contains(&path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(kind: &str, value: &str) -> Vec<u8> {
        format!(
            r#"{{"path":"/sys/cpu/ctx","assetID":42,"type":"{kind}","value":{value},"tags":["tag-0"],"timestamp":"2024-03-01T12:00:00Z"}}"#,
        )
        .into_bytes()
    }

    #[test]
    fn test_parse_integer_sample() {
        let sample = parse_sample(&payload("integer", "1500")).expect("valid payload");
        assert_eq!(sample.path, "/sys/cpu/ctx");
        assert_eq!(sample.asset_id, 42);
        assert_eq!(sample.value, MetricValue::Integer(1500));
        assert_eq!(sample.tags, vec!["tag-0".to_string()]);
    }

    #[test]
    fn test_parse_long_sample() {
        let sample = parse_sample(&payload("long", "9000000000")).expect("valid payload");
        assert_eq!(sample.value, MetricValue::Integer(9_000_000_000));
    }

    #[test]
    fn test_parse_real_sample_upcasts_integer_value() {
        let sample = parse_sample(&payload("real", "75")).expect("valid payload");
        assert_eq!(sample.value, MetricValue::Real(75.0));
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let err = parse_sample(&payload("string", "\"x\"")).expect_err("should fail");
        assert!(matches!(err, ParseError::UnknownType(_)));
    }

    #[test]
    fn test_parse_rejects_mismatched_value() {
        let err = parse_sample(&payload("integer", "10.5")).expect_err("should fail");
        assert!(matches!(err, ParseError::ValueMismatch { .. }));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_sample(b"not json").is_err());
    }

    #[test]
    fn test_lookup_id_is_deterministic() {
        let sample = parse_sample(&payload("integer", "1")).expect("valid payload");
        assert_eq!(sample.lookup_id(), "42-/sys/cpu/ctx");
        assert_eq!(sample.lookup_id(), sample.lookup_id());
    }

    #[test]
    fn test_internal_metric_set() {
        assert!(is_internal_metric("cpu.usage.percent"));
        assert!(is_internal_metric("/sys/load/60s"));
        assert!(is_internal_metric("disk.free:/var"));
        assert!(is_internal_metric("disk.write.per.second:/"));
        assert!(!is_internal_metric("/sys/cpu/ctx"));
        assert!(!is_internal_metric("some.custom.metric"));
    }

    #[test]
    fn test_discard_filter_includes_universal_set() {
        let filter = DiscardFilter::new(&[]);
        assert!(filter.matches("/sys/net/rx_bytes"));
        assert!(filter.matches("/sys/disk/fs"));
        assert!(!filter.matches("/sys/cpu/ctx"));
    }

    #[test]
    fn test_discard_filter_with_configured_paths() {
        let filter = DiscardFilter::new(&["noisy.metric".to_string()]);
        assert!(filter.matches("noisy.metric"));
        assert!(filter.matches("/sys/net/mac"));
        assert!(!filter.matches("quiet.metric"));
    }
}
