//! Client for a REST key-value store speaking the Upstash pipeline protocol.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::WindowCount;

#[derive(Debug, thiserror::Error)]
pub enum RemoteStoreError {
    #[error("remote store transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("remote store returned HTTP {0}")]
    Status(u16),
    #[error("remote store protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    pub url: String,
    pub token: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct PipelineEntry {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteCounterStore {
    client: reqwest::Client,
    pipeline_url: String,
    token: String,
}

impl RemoteCounterStore {
    /// # Errors
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(config: &RemoteStoreConfig) -> Result<Self, RemoteStoreError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            pipeline_url: format!("{}/pipeline", config.url.trim_end_matches('/')),
            token: config.token.clone(),
        })
    }

    /// `INCR` the key, set its expiry only when none exists, then read the TTL.
    ///
    /// # Errors
    /// Any transport failure, timeout, non-2xx status or malformed reply.
    pub async fn increment(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowCount, RemoteStoreError> {
        let body = json!([
            ["INCR", key],
            ["PEXPIRE", key, window_ms.to_string(), "NX"],
            ["PTTL", key],
        ]);
        let response = self
            .client
            .post(&self.pipeline_url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteStoreError::Status(status.as_u16()));
        }
        let entries: Vec<PipelineEntry> = response.json().await?;
        parse_pipeline(&entries, window_ms, now_ms)
    }
}

fn parse_pipeline(
    entries: &[PipelineEntry],
    window_ms: u64,
    now_ms: u64,
) -> Result<WindowCount, RemoteStoreError> {
    if entries.len() != 3 {
        return Err(RemoteStoreError::Protocol(format!(
            "expected 3 pipeline results, got {}",
            entries.len()
        )));
    }
    if let Some(error) = entries.iter().find_map(|entry| entry.error.as_deref()) {
        return Err(RemoteStoreError::Protocol(error.to_string()));
    }

    let count = integer_result(&entries[0])
        .and_then(|count| u64::try_from(count).ok())
        .filter(|count| *count > 0)
        .ok_or_else(|| RemoteStoreError::Protocol("INCR result is not a positive integer".into()))?;
    let ttl_ms = integer_result(&entries[2])
        .ok_or_else(|| RemoteStoreError::Protocol("PTTL result is not an integer".into()))?;

    // -1 (no expiry) and -2 (missing key) both mean a fresh window.
    let remaining_ms = u64::try_from(ttl_ms).unwrap_or(window_ms);
    Ok(WindowCount { count, reset_at_ms: now_ms.saturating_add(remaining_ms) })
}

fn integer_result(entry: &PipelineEntry) -> Option<i64> {
    match entry.result.as_ref()? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(raw: Value) -> Vec<PipelineEntry> {
        match serde_json::from_value(raw) {
            Ok(entries) => entries,
            Err(err) => panic!("fixture should decode: {err}"),
        }
    }

    // Test IDs: TRLR-001
    #[test]
    fn pipeline_reply_yields_count_and_reset() {
        let reply = entries(json!([{"result": 3}, {"result": 0}, {"result": 42_000}]));
        let counted = match parse_pipeline(&reply, 60_000, 1_000) {
            Ok(counted) => counted,
            Err(err) => panic!("reply should parse: {err}"),
        };
        assert_eq!(counted, WindowCount { count: 3, reset_at_ms: 43_000 });
    }

    // Test IDs: TRLR-002
    #[test]
    fn negative_ttl_means_a_full_window() {
        let reply = entries(json!([{"result": "1"}, {"result": 1}, {"result": -1}]));
        let counted = match parse_pipeline(&reply, 60_000, 5) {
            Ok(counted) => counted,
            Err(err) => panic!("reply should parse: {err}"),
        };
        assert_eq!(counted.reset_at_ms, 60_005);
    }

    // Test IDs: TRLR-003
    #[test]
    fn malformed_replies_are_protocol_errors() {
        for raw in [
            json!([{"result": 1}]),
            json!([{"error": "WRONGTYPE"}, {"result": 1}, {"result": 10}]),
            json!([{"result": "many"}, {"result": 1}, {"result": 10}]),
            json!([{"result": 1}, {"result": 1}, {"result": null}]),
        ] {
            let reply = entries(raw);
            assert!(matches!(
                parse_pipeline(&reply, 1_000, 0),
                Err(RemoteStoreError::Protocol(_))
            ));
        }
    }
}
