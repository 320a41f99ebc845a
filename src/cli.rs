//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "neptune-agent", about = "Neptune.io host agent", version)]
pub struct Cli {
    /// Neptune.io's API endpoint at which the agent should register.
    #[arg(long, default_value = "")]
    pub endpoint: String,

    /// Neptune.io api key for your account. Get this from the Neptune.io app.
    #[arg(long = "api_key", default_value = "")]
    pub api_key: String,

    /// Path to the agent config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Service control verb: install, uninstall, start, stop, or restart.
    #[cfg(windows)]
    #[arg(value_name = "VERB")]
    pub verb: Option<String>,
}
