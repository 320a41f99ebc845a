//! Agent error funnel.
//!
//! Every component can drop a free-form error message onto a bounded channel;
//! a single drain task uploads each one to the control plane as a non-full
//! log upload. When the control plane is unreachable the channel fills and
//! further reports are dropped rather than blocking the reporting loop.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::registration::RegistrationCell;
use crate::api::{Ack, ApiClient};
use crate::status::StatusRegister;

pub const ERROR_CHANNEL_CAPACITY: usize = 10;

/// An error that happened on this agent, uploaded for quick identification
/// of agent problems.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentError {
    error_message: String,
    agent_id: String,
    full_logs: bool,
    hostname: String,
    status: String,
}

/// Cheap handle for dropping error messages onto the funnel.
#[derive(Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<String>,
}

impl ErrorReporter {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Queues an error for upload. Drops the message when the channel is
    /// full or the drain task is gone.
    pub fn report(&self, message: impl Into<String>) {
        let _ = self.tx.try_send(message.into());
    }
}

/// Spawns the drain task that uploads queued errors until cancellation.
pub fn spawn_uploader(
    client: Arc<ApiClient>,
    registration: RegistrationCell,
    status: StatusRegister,
    hostname: String,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            debug!("uploading agent error to control plane");
            let request = AgentError {
                error_message: message,
                agent_id: registration.agent_id(),
                full_logs: false,
                hostname: hostname.clone(),
                status: status.label(),
            };
            let url = client.url(&["upload_logs", client.api_key()]);
            // Best effort: a failed error upload is not itself reported.
            let _ = client.post_json::<_, Ack>(&url, &request).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_drops_when_channel_is_full() {
        let (tx, mut rx) = mpsc::channel(2);
        let reporter = ErrorReporter::new(tx);
        reporter.report("first");
        reporter.report("second");
        reporter.report("dropped");
        assert_eq!(rx.try_recv().unwrap(), "first");
        assert_eq!(rx.try_recv().unwrap(), "second");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn report_survives_a_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let reporter = ErrorReporter::new(tx);
        reporter.report("nobody is listening");
    }

    #[test]
    fn agent_error_body_shape() {
        let json = serde_json::to_value(AgentError {
            error_message: "boom".into(),
            agent_id: "A1".into(),
            full_logs: false,
            hostname: "h".into(),
            status: "ACTIVE".into(),
        })
        .unwrap();
        assert_eq!(json["ErrorMessage"], "boom");
        assert_eq!(json["FullLogs"], false);
        assert_eq!(json["Status"], "ACTIVE");
    }
}
