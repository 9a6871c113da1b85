//! Alarm event dispatch.
//!
//! Alarms are fire-and-forget HTTP POSTs: delivery is at-most-once and a
//! lost alarm is acceptable because the next broken sample re-alarms.
//! Every outcome is logged; nothing propagates back to the shard.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{AlarmingConfig, RetryConfig};

/// Alarm notification sent to the destination endpoint. The wire body is
/// a single-element JSON array of this object.
#[derive(Debug, Clone, Serialize)]
pub struct AlarmEvent {
    pub source: String,
    pub event_id: String,
    pub version: String,
    pub sourcehost: String,
    #[serde(rename = "on_call")]
    pub oncall: String,
    pub targethost: String,
    pub message: String,
    pub level: i64,
    pub timestamp: String,
    pub check: String,
    pub monitoring: String,
    pub team: String,
}

/// HTTP dispatcher for alarm events.
pub struct Dispatcher {
    client: reqwest::Client,
    destination: String,
    error_status_threshold: u16,
    retry_count: u32,
    retry_min_wait: Duration,
    retry_max_wait: Duration,
}

impl Dispatcher {
    pub fn new(alarming: &AlarmingConfig, retry: &RetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(15))
            .build()
            .context("building alarm HTTP client")?;

        Ok(Self {
            client,
            destination: alarming.destination.clone(),
            error_status_threshold: alarming.error_status_threshold,
            retry_count: retry.count,
            retry_min_wait: retry.min_wait,
            retry_max_wait: retry.max_wait,
        })
    }

    /// POST one alarm event to the destination.
    pub async fn dispatch(&self, event: &AlarmEvent) {
        let body = match serde_json::to_vec(&[event]) {
            Ok(body) => body,
            Err(e) => {
                error!(event_id = %event.event_id, error = %e, "encoding alarm");
                return;
            }
        };

        let response = match self.post_with_retry(&body).await {
            Ok(response) => response,
            Err(e) => {
                error!(event_id = %event.event_id, error = %e, "sending alarm");
                return;
            }
        };

        let status = response.status().as_u16();
        info!(
            event_id = %event.event_id,
            level = event.level,
            status,
            "dispatched alarm",
        );

        if status >= self.error_status_threshold {
            let response_body = response.text().await.unwrap_or_default();
            error!(status, body = %response_body, "alarm rejected by destination");
            error!(request = %String::from_utf8_lossy(&body), "rejected alarm request");
            return;
        }

        // Drain the body so the connection can be reused.
        let _ = response.bytes().await;
    }

    async fn post_with_retry(&self, body: &[u8]) -> Result<reqwest::Response, reqwest::Error> {
        let mut wait = self.retry_min_wait;
        let mut attempt = 0u32;

        loop {
            let result = self
                .client
                .post(&self.destination)
                .header("Content-Type", "application/json; charset=utf-8")
                .body(body.to_vec())
                .send()
                .await;

            match result {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.retry_count => {
                    attempt += 1;
                    warn!(attempt, error = %e, "alarm POST failed, retrying");
                    tokio::time::sleep(wait).await;
                    wait = (wait * 2).min(self.retry_max_wait);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
