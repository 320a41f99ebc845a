//! Periodic liveness signal to the control plane.

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use crate::api::{Ack, ApiClient};

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Heartbeat {
    status: String,
}

impl ApiClient {
    /// Sends one heartbeat carrying the current status label. Callers treat
    /// this as fire-and-forget and only log failures.
    pub async fn beat(&self, agent_id: &str, status_label: String) -> Result<()> {
        let request = Heartbeat {
            status: status_label,
        };
        debug!(agent_id, "sending heartbeat");
        let url = self.url(&["heartbeat", self.api_key(), agent_id]);
        let _: Ack = self.post_json(&url, &request).await?;
        Ok(())
    }
}
