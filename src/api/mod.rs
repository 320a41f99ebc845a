//! Communication between the agent and the Neptune.io control plane:
//! registration, heartbeats, runbook execution results, and agent log/error
//! uploads. Also home to the [`Event`] wire type delivered through the
//! action queue.

pub mod action_output;
pub mod errors;
pub mod heartbeat;
pub mod registration;
pub mod upload_logs;

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::NeptuneConfig;

/// Agent's current version, reported with every registration.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const AGENT_API_PATH: &str = "/api/v1/agent/";

/// A single execute-runbook instruction delivered as one queue message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Event {
    /// Milliseconds since epoch, assigned by the producer.
    pub timestamp: i64,
    pub source: String,
    pub hostname: String,
    pub action_type: String,
    pub event_id: String,
    pub agent_id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub inflight_action_id: String,
    pub runbook_name: String,
    pub raw_command: String,
    pub signature: String,
    /// Wall-clock budget for the runbook, in seconds.
    pub timeout: i64,
    pub github_file_path: String,
    #[serde(rename = "env")]
    pub environment: HashMap<String, String>,
    /// Queue bookkeeping, filled in locally after receipt.
    #[serde(skip)]
    pub sqs_message_id: String,
    #[serde(skip)]
    pub receipt_handle: String,
}

/// Acknowledgement body returned by the control plane.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Ack {
    #[allow(dead_code)]
    pub message: String,
}

/// Synchronous-looking HTTPS client for the control-plane REST surface.
/// Every operation is a POST of a JSON body; the API key rides as the final
/// URL path segment.
pub struct ApiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl ApiClient {
    pub fn new(config: &NeptuneConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("building control-plane HTTP client")?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Composes the URL for the given path segments under the agent API,
    /// trimming stray slashes from each segment.
    fn url(&self, segments: &[&str]) -> String {
        join_url(&self.endpoint, segments)
    }

    /// POSTs `body` and decodes the JSON response. Any status outside
    /// `200..=299` is an error.
    async fn post_json<B: Serialize, R: DeserializeOwned>(&self, url: &str, body: &B) -> Result<R> {
        debug!(url, "posting to control plane");
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .context("could not post to server")?;

        let code = response.status().as_u16();
        if (200..=299).contains(&code) {
            response.json().await.context("decoding server response")
        } else {
            bail!("Server returned unexpected status: {code}")
        }
    }
}

/// Joins `https://<endpoint>/api/v1/agent/<segments...>`, tolerating an
/// endpoint that already carries a scheme or trailing slash.
fn join_url(endpoint: &str, segments: &[&str]) -> String {
    let base = if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", endpoint.trim_end_matches('/'))
    };
    let path = segments
        .iter()
        .map(|s| s.trim_matches('/'))
        .collect::<Vec<_>>()
        .join("/");
    format!("{base}{AGENT_API_PATH}{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_trims_segment_slashes() {
        assert_eq!(
            join_url("https://x.example/", &["a", "/b/", "c"]),
            "https://x.example/api/v1/agent/a/b/c"
        );
    }

    #[test]
    fn join_url_adds_scheme_to_bare_host() {
        assert_eq!(
            join_url("www.neptune.io", &["register", "key-1"]),
            "https://www.neptune.io/api/v1/agent/register/key-1"
        );
    }

    #[test]
    fn join_url_keeps_existing_scheme() {
        assert_eq!(
            join_url("http://localhost:8080", &["heartbeat", "k", "a"]),
            "http://localhost:8080/api/v1/agent/heartbeat/k/a"
        );
    }

    #[test]
    fn event_decodes_from_wire_json() {
        let body = r#"{"eventId":"E1","agentId":"A1","timestamp":1700000000000,
            "rawCommand":"echo hello","timeout":5,"env":{"FOO":"bar"}}"#;
        let event: Event = serde_json::from_str(body).unwrap();
        assert_eq!(event.event_id, "E1");
        assert_eq!(event.agent_id, "A1");
        assert_eq!(event.timestamp, 1_700_000_000_000);
        assert_eq!(event.raw_command, "echo hello");
        assert_eq!(event.timeout, 5);
        assert_eq!(event.environment["FOO"], "bar");
        assert!(event.receipt_handle.is_empty());
    }

    #[test]
    fn event_decode_failure_falls_back_to_default() {
        let event = serde_json::from_str::<Event>("not json").unwrap_or_default();
        assert!(event.event_id.is_empty());
        assert!(event.agent_id.is_empty());
    }

    #[test]
    fn ack_tolerates_unknown_or_empty_bodies() {
        let ack: Ack = serde_json::from_str("{}").unwrap();
        assert!(ack.message.is_empty());
        let ack: Ack = serde_json::from_str(r#"{"message":"ok","extra":1}"#).unwrap();
        assert_eq!(ack.message, "ok");
    }
}
