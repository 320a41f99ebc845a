//! SQS-backed implementation of the action queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_sqs::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_sqs::types::Message;
use aws_sdk_sqs::Client;
use regex::Regex;
use tracing::debug;

use crate::api::registration::RegistrationInfo;
use crate::worker::{
    ActionQueue, QueueBuilder, QueueMessage, SharedQueue, DEFAULT_VISIBILITY_TIMEOUT_SECONDS,
    LONG_POLL_SECONDS, MAX_MESSAGES_TO_FETCH,
};

const AGENT_ID_ATTRIBUTE: &str = "agentId";
const SIGNATURE_ATTRIBUTE: &str = "signature";

/// Extracts the region from a queue URL of the form
/// `https://sqs.<region>.amazonaws.com/...`.
pub fn parse_queue_region(queue_url: &str) -> Option<String> {
    static QUEUE_URL_REGEX: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let regex = QUEUE_URL_REGEX
        .get_or_init(|| Regex::new(r"https://sqs\.(.*)\.amazonaws\.com(.*)").expect("queue url regex"));
    regex
        .captures(queue_url)
        .and_then(|captures| captures.get(1))
        .map(|region| region.as_str().to_string())
}

/// Queue builder used in production: a fresh SQS client wired with the
/// short-lived credentials from the given registration.
pub fn sqs_queue_builder() -> QueueBuilder {
    Arc::new(|info| Ok(Arc::new(SqsQueue::new(info)?) as SharedQueue))
}

pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(info: &RegistrationInfo) -> Result<Self> {
        let region = parse_queue_region(&info.action_queue_endpoint)
            .with_context(|| format!("no region in queue url: {}", info.action_queue_endpoint))?;

        let credentials = Credentials::new(
            info.aws_access_key.clone(),
            info.aws_secret_access_key.clone(),
            Some(info.aws_security_token.clone()).filter(|token| !token.is_empty()),
            None,
            "neptune-registration",
        );
        let config = aws_sdk_sqs::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            queue_url: info.action_queue_endpoint.clone(),
        })
    }
}

fn to_queue_message(message: &Message) -> QueueMessage {
    let attribute = |name: &str| {
        message
            .message_attributes()
            .and_then(|attributes| attributes.get(name))
            .and_then(|value| value.string_value())
            .map(|value| value.to_string())
    };
    QueueMessage {
        message_id: message.message_id().unwrap_or_default().to_string(),
        body: message.body().unwrap_or_default().to_string(),
        receipt_handle: message.receipt_handle().unwrap_or_default().to_string(),
        agent_id: attribute(AGENT_ID_ATTRIBUTE),
        signature: attribute(SIGNATURE_ATTRIBUTE),
    }
}

#[async_trait]
impl ActionQueue for SqsQueue {
    async fn receive(&self) -> Result<Vec<QueueMessage>> {
        debug!("polling the action queue for messages");
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(MAX_MESSAGES_TO_FETCH)
            .visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT_SECONDS)
            .wait_time_seconds(LONG_POLL_SECONDS)
            .message_attribute_names(AGENT_ID_ATTRIBUTE)
            .message_attribute_names(SIGNATURE_ATTRIBUTE)
            .send()
            .await
            .context("receiving messages from the action queue")?;

        Ok(response.messages().iter().map(to_queue_message).collect())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        debug!("deleting the event from the action queue");
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .context("deleting the message")?;
        Ok(())
    }

    async fn change_visibility(&self, receipt_handle: &str, timeout_secs: i64) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(timeout_secs as i32)
            .send()
            .await
            .context("changing the message visibility")?;
        Ok(())
    }
}
