//! Agent configuration: JSON config file merged with command-line flags.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "www.neptune.io";
pub const DEFAULT_CONFIG_FILE_NAME: &str = "neptune-agent.json";
const DEFAULT_LOG_FILE_NAME: &str = "neptune-agent.log";

/// Combined config for the agent, with one section per concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Config {
    pub neptune: NeptuneConfig,
    pub agent: AgentConfig,
}

/// Control-plane section of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct NeptuneConfig {
    pub api_key: String,
    pub endpoint: String,
}

/// Host machine section of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct AgentConfig {
    pub assigned_hostname: String,
    pub log_file: String,
    pub debug_mode: bool,
    pub github_api_key: String,
}

impl Config {
    fn parse(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        Ok(config)
    }
}

fn default_config() -> Config {
    Config {
        neptune: NeptuneConfig {
            api_key: String::new(),
            endpoint: DEFAULT_BASE_URL.to_string(),
        },
        agent: AgentConfig {
            log_file: DEFAULT_LOG_FILE_NAME.to_string(),
            ..AgentConfig::default()
        },
    }
}

/// Merges the command-line flags over the file config. A flag wins only when
/// it is non-empty.
fn merge(cmdline: NeptuneConfig, file: Config) -> (NeptuneConfig, AgentConfig) {
    let api_key = if cmdline.api_key.is_empty() {
        file.neptune.api_key
    } else {
        cmdline.api_key
    };
    let endpoint = if cmdline.endpoint.is_empty() {
        file.neptune.endpoint
    } else {
        cmdline.endpoint
    };

    let mut agent = file.agent;
    if agent.log_file.is_empty() {
        agent.log_file = DEFAULT_LOG_FILE_NAME.to_string();
    }

    (NeptuneConfig { api_key, endpoint }, agent)
}

/// Builds the final config from the config file (when present) and the
/// command-line flags.
pub fn load(config_path: Option<&Path>, cmdline: NeptuneConfig) -> Result<(NeptuneConfig, AgentConfig)> {
    let file_config = match config_path {
        Some(path) => Config::parse(path)?,
        None => default_config(),
    };
    Ok(merge(cmdline, file_config))
}

/// Rejects configs that cannot possibly reach the control plane.
pub fn validate(config: &NeptuneConfig) -> Result<()> {
    if config.api_key.is_empty() {
        bail!("Neptune.io API key is missing");
    }
    if config.endpoint.is_empty() {
        bail!("Neptune.io endpoint is missing");
    }
    Ok(())
}

/// Resolves the log file path relative to the config-file directory unless it
/// is already absolute.
pub fn resolve_log_path(config_dir: &Path, log_file: &str) -> PathBuf {
    let path = Path::new(log_file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        config_dir.join(path)
    }
}
