//! Uploading the tail of the agent log file for remote diagnostics.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::api::{Ack, ApiClient};

const NUM_LINES_TO_UPLOAD: usize = 50;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct UploadLogsRequest {
    pub error_message: String,
    pub agent_id: String,
    pub full_logs: bool,
    pub hostname: String,
}

/// Uploads the last lines of the agent log file, skipping the upload when the
/// file has not changed since the previous successful check. The first check
/// after startup always uploads because the baseline is zero.
pub struct LogUploader {
    client: Arc<ApiClient>,
    log_path: PathBuf,
    hostname: String,
    last_modified: AtomicI64,
}

impl LogUploader {
    pub fn new(client: Arc<ApiClient>, log_path: PathBuf, hostname: String) -> Self {
        Self {
            client,
            log_path,
            hostname,
            last_modified: AtomicI64::new(0),
        }
    }

    fn should_upload(&self) -> bool {
        let modified = match std::fs::metadata(&self.log_path)
            .and_then(|meta| meta.modified())
        {
            Ok(time) => time
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            Err(e) => {
                tracing::error!(error = %e, "error opening log file");
                return false;
            }
        };

        let previous = self.last_modified.swap(modified, Ordering::SeqCst);
        previous == 0 || modified > previous
    }

    pub async fn upload(&self, agent_id: &str) -> Result<()> {
        if !self.should_upload() {
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&self.log_path)
            .await
            .with_context(|| format!("reading log file: {}", self.log_path.display()))?;
        let lines: Vec<&str> = content.lines().collect();
        let offset = lines.len().saturating_sub(NUM_LINES_TO_UPLOAD);
        let tail = lines[offset..].join("\n");

        debug!(agent_id, "uploading logs");
        let request = UploadLogsRequest {
            error_message: tail,
            agent_id: agent_id.to_string(),
            full_logs: true,
            hostname: self.hostname.clone(),
        };
        let url = self.client.url(&["upload_logs", self.client.api_key()]);
        let _: Ack = self.client.post_json(&url, &request).await?;
        Ok(())
    }
}
