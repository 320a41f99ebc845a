//! Host and cloud metadata used in the registration protocol.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::AgentConfig;

const METADATA_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const PUBLIC_IP_URL: &str = "http://ip.42.pl/raw";
const EC2_INSTANCE_ID_URL: &str = "http://169.254.169.254/latest/meta-data/instance-id";
const EC2_AVAILABILITY_ZONE_URL: &str =
    "http://169.254.169.254/latest/meta-data/placement/availability-zone";

/// Immutable description of the host this agent runs on. Collected once at
/// startup; cloud fields stay empty on hosts outside AWS.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostMetaData {
    pub host_name: String,
    pub assigned_hostname: String,
    pub provider_id: String,
    pub provider_type: String,
    pub platform: String,
    pub private_ip_address: String,
    pub private_dns_name: String,
    pub public_ip_address: String,
    pub public_dns_name: String,
    pub region: String,
}

/// Queries the given URL and returns the body on a 2xx response.
async fn query_data(client: &reqwest::Client, url: &str) -> Result<String> {
    debug!(url, "querying for host metadata");
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("querying {url}"))?;

    let code = response.status().as_u16();
    if (200..=299).contains(&code) {
        response.text().await.context("reading metadata response")
    } else {
        bail!("Server returned unexpected status: {code}")
    }
}

/// Returns the non-loopback local IPv4 of the host by asking the kernel which
/// source address it would use for an outbound datagram. No packet is sent.
fn local_ip() -> String {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_loopback() => ip.to_string(),
        _ => String::new(),
    }
}

/// Reverse-resolves an IP to its DNS name, empty when unresolvable.
async fn reverse_dns(ip: &str) -> String {
    let Ok(addr) = ip.parse::<IpAddr>() else {
        return String::new();
    };
    let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr)).await;
    match lookup {
        Ok(Ok(name)) => name,
        _ => {
            warn!(ip, "could not reverse-resolve address");
            String::new()
        }
    }
}

/// Collects the complete metadata for this host, including cloud-specific
/// fields when the machine runs on AWS. Only a missing hostname is fatal;
/// every other probe degrades to an empty field.
pub async fn collect(agent_config: &AgentConfig) -> Result<HostMetaData> {
    debug!("getting host metadata");

    let host_name = hostname::get()
        .context("could not get host name")?
        .to_string_lossy()
        .to_string();

    let client = reqwest::Client::builder()
        .timeout(METADATA_QUERY_TIMEOUT)
        .build()
        .context("building metadata HTTP client")?;

    let private_ip = local_ip();
    let public_ip = query_data(&client, PUBLIC_IP_URL).await.unwrap_or_default();
    let platform = format!("{} {}", std::env::consts::OS, std::env::consts::ARCH);

    let private_dns = reverse_dns(&private_ip).await;
    let public_dns = reverse_dns(&public_ip).await;

    let (provider_id, provider_type, region) = match query_data(&client, EC2_INSTANCE_ID_URL).await
    {
        Ok(instance_id) if !instance_id.is_empty() => {
            let region = query_data(&client, EC2_AVAILABILITY_ZONE_URL)
                .await
                .unwrap_or_default();
            (instance_id, "AWS".to_string(), region)
        }
        _ => (String::new(), "NON_AWS".to_string(), String::new()),
    };

    Ok(HostMetaData {
        host_name,
        assigned_hostname: agent_config.assigned_hostname.clone(),
        provider_id,
        provider_type,
        platform,
        private_ip_address: private_ip,
        private_dns_name: private_dns,
        public_ip_address: public_ip,
        public_dns_name: public_dns,
        region,
    })
}
