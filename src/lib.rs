//! Cyclone is a horizontally sharded threshold-evaluation engine for a
//! metrics alerting pipeline. It consumes transport envelopes carrying
//! metric samples, derives composite metrics per asset, evaluates samples
//! against threshold rules fetched from a lookup service, dispatches alarm
//! events over HTTP, and acknowledges every envelope back to the transport
//! exactly once.

pub mod alarm;
pub mod config;
pub mod derive;
pub mod engine;
pub mod eval;
pub mod export;
pub mod ingest;
pub mod lookup;
pub mod metric;
pub mod shard;
pub mod transport;
