//! Neptune.io host agent.
//!
//! A long-running process that registers with the Neptune.io control plane,
//! long-polls its per-agent action queue for signed runbook requests,
//! executes them in sandboxed subprocesses, and reports the results back.
//! The agent never accepts inbound connections.

mod api;
mod cli;
mod config;
mod executor;
mod logging;
mod metadata;
mod security;
mod service;
mod state;
mod status;
mod supervisor;
mod util;
mod worker;

use clap::Parser;

fn main() {
    let cli = cli::Cli::parse();
    std::process::exit(service::run(cli));
}
