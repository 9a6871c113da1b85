//! Transport envelope and offset acknowledgement types.
//!
//! The ingest driver wraps every raw sample payload into an [`Envelope`]
//! carrying its stream position and a one-shot commit channel. Whoever
//! handles the envelope sends exactly one [`Ack`] on that channel,
//! regardless of processing outcome, so the transport can advance its
//! commit watermark.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::oneshot;

/// Offset acknowledgement returned to the ingest transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// One message pulled from the ingest transport.
#[derive(Debug)]
pub struct Envelope {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub host_id: u32,
    /// Raw sample payload; decoded by the handling shard.
    pub value: Vec<u8>,
    /// One-shot commit channel. Consumed exactly once per envelope.
    pub commit: oneshot::Sender<Ack>,
}

impl Envelope {
    /// The acknowledgement for this envelope's stream position.
    pub fn ack(&self) -> Ack {
        Ack {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Minimal payload peek used by the router: enough to pick a shard and
/// apply the ingest age cutoff without a full decode.
#[derive(Debug, Deserialize)]
pub struct RouteInfo {
    pub path: String,
    #[serde(rename = "assetID")]
    pub asset_id: i64,
    pub timestamp: DateTime<Utc>,
}

/// Peek-decode the routing fields from an envelope payload.
pub fn peek_route(data: &[u8]) -> Result<RouteInfo, serde_json::Error> {
    serde_json::from_slice(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_route_reads_routing_fields() {
        let payload = br#"{"path":"/sys/cpu/ctx","assetID":7,"type":"integer","value":5,"tags":[],"timestamp":"2024-03-01T12:00:00Z"}"#;
        let info = peek_route(payload).expect("valid payload");
        assert_eq!(info.path, "/sys/cpu/ctx");
        assert_eq!(info.asset_id, 7);
    }

    #[test]
    fn test_peek_route_rejects_garbage() {
        assert!(peek_route(b"{").is_err());
    }

    #[tokio::test]
    async fn test_envelope_ack_roundtrip() {
        let (tx, rx) = oneshot::channel();
        let env = Envelope {
            topic: "metrics".to_string(),
            partition: 3,
            offset: 1001,
            host_id: 99,
            value: Vec::new(),
            commit: tx,
        };

        let ack = env.ack();
        env.commit.send(ack).expect("receiver alive");

        let received = rx.await.expect("ack sent");
        assert_eq!(received.topic, "metrics");
        assert_eq!(received.partition, 3);
        assert_eq!(received.offset, 1001);
    }
}
