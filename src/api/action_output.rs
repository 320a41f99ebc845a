//! Uploading runbook execution results.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{Ack, ApiClient};

/// Post-execution report for one event: status, exit code, and the captured
/// (truncated) output streams.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActionOutputMessage {
    pub rule_name: String,
    pub rule_id: String,
    pub agent_id: String,
    pub event_id: String,
    pub status: String,
    pub action_output: String,
    pub failure_reason: String,
    pub status_code: i32,
    pub inflight_action_id: String,
    pub is_timeout: bool,
    pub host_name: String,
    pub action_type: String,
}

impl ApiClient {
    /// Uploads one execution result. Failures are logged by the caller and
    /// never retried: the queue message was already deleted when the
    /// subprocess started, so a retry would have nothing to reconcile with.
    pub async fn send_action_output(&self, message: &ActionOutputMessage) -> Result<()> {
        debug!(event_id = %message.event_id, status = %message.status, "sending action output");
        let url = self.url(&["action_status", self.api_key()]);
        let _: Ack = self.post_json(&url, message).await?;
        Ok(())
    }
}
