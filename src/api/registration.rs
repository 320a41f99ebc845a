//! Agent registration: the handshake that returns the per-instance queue URL
//! and short-lived queue credentials.

use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::{ApiClient, AGENT_VERSION};
use crate::metadata::HostMetaData;

/// Message sent to the control plane to register this agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegistrationRequest {
    pub agent_version: String,
    pub hostname: String,
    pub assigned_hostname: String,
    pub provider_server_id: String,
    pub provider_server_type: String,
    pub platform: String,
    pub private_ip_address: String,
    pub private_dns_name: String,
    pub public_ip_address: String,
    pub public_dns_name: String,
    pub region: String,
    pub start_time: i64,
}

/// Credentials and queue coordinates returned by a successful registration.
/// Replaced wholesale on every re-registration; never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RegistrationInfo {
    pub agent_id: String,
    pub create_time: i64,
    pub update_time: i64,
    pub action_queue_endpoint: String,
    #[serde(rename = "AWSAccessKey")]
    pub aws_access_key: String,
    #[serde(rename = "AWSSecretAccessKey")]
    pub aws_secret_access_key: String,
    #[serde(rename = "AWSSecurityToken")]
    pub aws_security_token: String,
}

/// Single shared cell holding the current registration. One writer (the
/// supervisor), many readers; readers take whole-struct snapshots and are
/// told to refresh through the registration-updated signal channel, so a
/// stale snapshot is tolerated.
#[derive(Clone, Default)]
pub struct RegistrationCell {
    inner: Arc<RwLock<RegistrationInfo>>,
}

impl RegistrationCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RegistrationInfo {
        self.inner.read().expect("registration cell poisoned").clone()
    }

    pub fn agent_id(&self) -> String {
        self.inner
            .read()
            .expect("registration cell poisoned")
            .agent_id
            .clone()
    }

    /// Replaces the registration in place so every loop sees the new
    /// credentials on its next snapshot.
    pub fn replace(&self, info: RegistrationInfo) {
        *self.inner.write().expect("registration cell poisoned") = info;
    }
}

impl ApiClient {
    /// Registers this agent with the control plane. The caller owns retry
    /// policy; a non-2xx response or transport failure is an error.
    pub async fn register(
        &self,
        metadata: &HostMetaData,
        start_time_ms: i64,
    ) -> Result<RegistrationInfo> {
        let request = RegistrationRequest {
            agent_version: AGENT_VERSION.to_string(),
            hostname: metadata.host_name.clone(),
            assigned_hostname: metadata.assigned_hostname.clone(),
            provider_server_id: metadata.provider_id.clone(),
            provider_server_type: metadata.provider_type.clone(),
            platform: metadata.platform.clone(),
            private_ip_address: metadata.private_ip_address.clone(),
            private_dns_name: metadata.private_dns_name.clone(),
            public_ip_address: metadata.public_ip_address.clone(),
            public_dns_name: metadata.public_dns_name.clone(),
            region: metadata.region.clone(),
            start_time: start_time_ms,
        };

        info!(hostname = %request.hostname, "registering the agent");
        let url = self.url(&["register", self.api_key()]);
        let info: RegistrationInfo = self.post_json(&url, &request).await?;
        info!(agent_id = %info.agent_id, "successfully registered the agent");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_info_decodes_control_plane_response() {
        let body = r#"{"AgentId":"A1",
            "ActionQueueEndpoint":"https://sqs.us-east-1.amazonaws.com/q",
            "AWSAccessKey":"k","AWSSecretAccessKey":"s","AWSSecurityToken":"t",
            "CreateTime":1,"UpdateTime":2}"#;
        let info: RegistrationInfo = serde_json::from_str(body).unwrap();
        assert_eq!(info.agent_id, "A1");
        assert_eq!(
            info.action_queue_endpoint,
            "https://sqs.us-east-1.amazonaws.com/q"
        );
        assert_eq!(info.aws_access_key, "k");
        assert_eq!(info.aws_secret_access_key, "s");
        assert_eq!(info.aws_security_token, "t");
    }

    #[test]
    fn registration_request_serializes_pascal_case() {
        let request = RegistrationRequest {
            agent_version: "1.1.1".into(),
            hostname: "h".into(),
            assigned_hostname: String::new(),
            provider_server_id: String::new(),
            provider_server_type: "NON_AWS".into(),
            platform: "linux x86_64".into(),
            private_ip_address: String::new(),
            private_dns_name: String::new(),
            public_ip_address: String::new(),
            public_dns_name: String::new(),
            region: String::new(),
            start_time: 7,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["AgentVersion"], "1.1.1");
        assert_eq!(json["Hostname"], "h");
        assert_eq!(json["ProviderServerType"], "NON_AWS");
        assert_eq!(json["StartTime"], 7);
    }

    #[test]
    fn cell_replace_is_visible_to_other_handles() {
        let cell = RegistrationCell::new();
        let reader = cell.clone();
        assert!(reader.agent_id().is_empty());

        cell.replace(RegistrationInfo {
            agent_id: "A1".into(),
            ..RegistrationInfo::default()
        });
        assert_eq!(reader.agent_id(), "A1");
        assert_eq!(reader.snapshot().agent_id, "A1");
    }
}
