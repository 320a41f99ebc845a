//! Action-queue worker: long-polls the per-agent message queue and hands
//! verified events over to the executor.
//!
//! The worker owns a single queue client built from the current registration
//! credentials. A signal on the registration-updated channel makes it rebuild
//! the client before the next poll, which is how short-lived queue
//! credentials are rotated without stopping the loop.

pub mod sqs;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::api::registration::{RegistrationCell, RegistrationInfo};
use crate::api::Event;
use crate::security::{MessageVerifier, Verification};
use crate::status::{Status, StatusRegister};

/// Minimum gap between the starts of successive polls when the previous poll
/// produced no work.
const POLLING_FREQUENCY: Duration = Duration::from_secs(5);
const MAX_MESSAGES_TO_FETCH: i32 = 10;
const LONG_POLL_SECONDS: i32 = 20;
const DEFAULT_VISIBILITY_TIMEOUT_SECONDS: i32 = 120;
const FAILURES_BEFORE_REREGISTRATION: u32 = 10;
/// Extra visibility past the action timeout, avoiding a race between the
/// queue redelivering the message and the executor killing the action.
const VISIBILITY_TIMEOUT_BUFFER_SECONDS: i64 = 2;

/// One message as returned by the queue, attributes separated from the body.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
    pub receipt_handle: String,
    pub agent_id: Option<String>,
    pub signature: Option<String>,
}

/// The slice of the message-queue SDK the agent depends on.
#[async_trait]
pub trait ActionQueue: Send + Sync {
    /// Long-polls for the next batch of messages.
    async fn receive(&self) -> Result<Vec<QueueMessage>>;

    /// Deletes a message so no consumer sees it again.
    async fn delete(&self, receipt_handle: &str) -> Result<()>;

    /// Changes how long the message stays hidden from other consumers.
    /// Timeout zero releases it immediately.
    async fn change_visibility(&self, receipt_handle: &str, timeout_secs: i64) -> Result<()>;
}

pub type SharedQueue = Arc<dyn ActionQueue>;

/// Builds a queue client from registration credentials. Invoked once at
/// startup and again after every registration update.
pub type QueueBuilder = Arc<dyn Fn(&RegistrationInfo) -> Result<SharedQueue> + Send + Sync>;

pub struct Worker {
    registration: RegistrationCell,
    build_queue: QueueBuilder,
    verifier: Arc<MessageVerifier>,
    status: StatusRegister,
}

/// What the worker decided to do with one message.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// Skipped; the message reappears after its visibility timeout.
    Skipped,
    /// Released to sibling agents with zero visibility timeout.
    Released,
    /// Deleted as unverifiable, misdirected, or tampered.
    Deleted,
    /// Accepted and handed to the executor.
    Dispatched,
}

impl Worker {
    pub fn new(
        registration: RegistrationCell,
        build_queue: QueueBuilder,
        verifier: Arc<MessageVerifier>,
        status: StatusRegister,
    ) -> Self {
        Self {
            registration,
            build_queue,
            verifier,
            status,
        }
    }

    /// Polls the queue until cancellation, dispatching accepted events to
    /// `events_tx`. After ten consecutive poll failures a signal goes out on
    /// `rereg_tx` so the supervisor refreshes the credentials.
    pub async fn run(
        self,
        mut reg_updates: mpsc::Receiver<()>,
        events_tx: mpsc::Sender<Event>,
        rereg_tx: mpsc::Sender<()>,
        cancel: CancellationToken,
    ) {
        info!("initializing queue client");
        let mut queue = self.build_client();

        let mut should_log_error = true;
        let mut num_failures: u32 = 0;

        while !cancel.is_cancelled() {
            // Pick up a credentials change before the next poll.
            if reg_updates.try_recv().is_ok() {
                info!("registration changed; reinitializing queue client");
                queue = self.build_client();
            }

            // Credentials may not have yielded a usable client; retry the
            // build on the normal polling cadence.
            if queue.is_none() {
                queue = self.build_client();
            }

            let poll_started = Instant::now();
            let mut should_sleep = true;

            let received = match queue.as_ref() {
                Some(queue) => queue.receive().await.map(|messages| (queue.clone(), messages)),
                None => Err(anyhow::anyhow!("queue client is not available")),
            };

            match received {
                Ok((queue, messages)) => {
                    should_log_error = true;
                    num_failures = 0;
                    self.status.update(Status::QueuePollingSucceeded);
                    debug!(count = messages.len(), "received messages");

                    for message in messages {
                        let disposition =
                            self.handle_message(queue.as_ref(), &events_tx, message).await;
                        if disposition == Disposition::Dispatched {
                            should_sleep = false;
                        }
                    }
                }
                Err(e) => {
                    if should_log_error {
                        error!(error = %e, "could not receive messages from the action queue");
                        should_log_error = false;
                        num_failures += 1;
                    } else {
                        num_failures += 1;
                        if num_failures == FAILURES_BEFORE_REREGISTRATION {
                            num_failures = 0;
                            should_log_error = true;
                            let _ = rereg_tx.try_send(());
                        }
                    }
                }
            }

            if should_sleep {
                if let Some(remaining) = POLLING_FREQUENCY.checked_sub(poll_started.elapsed()) {
                    debug!(?remaining, "sleeping between polls");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(remaining) => {}
                    }
                }
            }
        }
    }

    fn build_client(&self) -> Option<SharedQueue> {
        match (self.build_queue)(&self.registration.snapshot()) {
            Ok(queue) => Some(queue),
            Err(e) => {
                error!(error = %e, "could not build the queue client");
                None
            }
        }
    }

    /// Runs one message through the integrity pipeline: agent-id attribute,
    /// signature, payload decode, payload agent-id, then dispatch.
    async fn handle_message(
        &self,
        queue: &dyn ActionQueue,
        events_tx: &mpsc::Sender<Event>,
        message: QueueMessage,
    ) -> Disposition {
        let local_agent_id = self.registration.agent_id();

        let Some(agent_id) = message.agent_id.as_deref() else {
            error!(message_id = %message.message_id, "received message does not have an agentId attribute");
            return Disposition::Skipped;
        };

        if agent_id != local_agent_id {
            debug!(message_id = %message.message_id, "releasing a message which is not for this agent");
            if let Err(e) = queue.change_visibility(&message.receipt_handle, 0).await {
                error!(error = %e, "could not release the message");
            }
            return Disposition::Released;
        }

        let verified = message
            .signature
            .as_deref()
            .map(|signature| self.verifier.verify(&message.body, signature))
            .unwrap_or(Verification::NotVerified);
        if verified != Verification::Verified {
            error!(message_id = %message.message_id, "could not verify the message signature; deleting the message");
            if let Err(e) = queue.delete(&message.receipt_handle).await {
                error!(error = %e, "could not delete the message");
            }
            return Disposition::Deleted;
        }

        // Decode failures fall back to a default event; the payload agent-id
        // recheck below then rejects it.
        let mut event: Event = match serde_json::from_str(&message.body) {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "could not deserialize the queue message");
                Event::default()
            }
        };
        event.sqs_message_id = message.message_id.clone();
        event.receipt_handle = message.receipt_handle.clone();

        // The signature covers the body, not the attributes, so the payload
        // agent id is rechecked to catch tampered or replayed attributes.
        if event.agent_id != local_agent_id {
            error!(
                message_id = %message.message_id,
                "agent id in the message attributes matches but the payload agent id does not; deleting the message"
            );
            if let Err(e) = queue.delete(&message.receipt_handle).await {
                error!(error = %e, "could not delete the message");
            }
            return Disposition::Deleted;
        }

        let visibility = event.timeout + VISIBILITY_TIMEOUT_BUFFER_SECONDS;
        if let Err(e) = queue.change_visibility(&message.receipt_handle, visibility).await {
            error!(error = %e, "could not extend the message visibility");
        }

        debug!(event_id = %event.event_id, "pushing the message for processing");
        if events_tx.send(event).await.is_err() {
            return Disposition::Skipped;
        }
        Disposition::Dispatched
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// What a mock queue observed, in call order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum QueueOp {
        Delete(String),
        ChangeVisibility(String, i64),
    }

    /// Recording queue: serves pre-loaded batches and records every
    /// delete/visibility call with a timestamp.
    #[derive(Default)]
    pub(crate) struct MockQueue {
        batches: Mutex<Vec<Vec<QueueMessage>>>,
        pub(crate) ops: Mutex<Vec<(QueueOp, std::time::Instant)>>,
        pub(crate) fail_receives: bool,
    }

    impl MockQueue {
        pub(crate) fn with_batches(batches: Vec<Vec<QueueMessage>>) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(batches),
                ..Self::default()
            })
        }

        pub(crate) fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail_receives: true,
                ..Self::default()
            })
        }

        pub(crate) fn ops(&self) -> Vec<QueueOp> {
            self.ops.lock().unwrap().iter().map(|(op, _)| op.clone()).collect()
        }

        pub(crate) fn deletes(&self) -> usize {
            self.ops()
                .iter()
                .filter(|op| matches!(op, QueueOp::Delete(_)))
                .count()
        }
    }

    #[async_trait]
    impl ActionQueue for MockQueue {
        async fn receive(&self) -> Result<Vec<QueueMessage>> {
            if self.fail_receives {
                anyhow::bail!("simulated receive failure");
            }
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(batches.remove(0))
            }
        }

        async fn delete(&self, receipt_handle: &str) -> Result<()> {
            self.ops.lock().unwrap().push((
                QueueOp::Delete(receipt_handle.to_string()),
                std::time::Instant::now(),
            ));
            Ok(())
        }

        async fn change_visibility(&self, receipt_handle: &str, timeout_secs: i64) -> Result<()> {
            self.ops.lock().unwrap().push((
                QueueOp::ChangeVisibility(receipt_handle.to_string(), timeout_secs),
                std::time::Instant::now(),
            ));
            Ok(())
        }
    }
}
