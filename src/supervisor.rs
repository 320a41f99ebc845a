//! Bootstraps the agent and owns the task topology.
//!
//! Startup order: flags → config → logging → pinned key → host metadata →
//! registration (with backoff) → event store → loops. The loops share the
//! registration cell and the status register; everything else flows through
//! channels.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::action_output::ActionOutputMessage;
use crate::api::errors::{self, ErrorReporter, ERROR_CHANNEL_CAPACITY};
use crate::api::registration::RegistrationCell;
use crate::api::upload_logs::LogUploader;
use crate::api::{ApiClient, Event, AGENT_VERSION};
use crate::cli::Cli;
use crate::config::{self, NeptuneConfig, DEFAULT_CONFIG_FILE_NAME};
use crate::executor::Executor;
use crate::logging;
use crate::metadata::{self, HostMetaData};
use crate::security::MessageVerifier;
use crate::state::EventStore;
use crate::status::{Status, StatusRegister};
use crate::worker::sqs::sqs_queue_builder;
use crate::worker::Worker;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);
const LOGS_UPLOAD_INTERVAL: Duration = Duration::from_secs(2 * 60);
const REREGISTRATION_INTERVAL: Duration = Duration::from_secs(60 * 60);

const EVENTS_CHANNEL_CAPACITY: usize = 10;
const RESULTS_CHANNEL_CAPACITY: usize = 10;
const SIGNAL_CHANNEL_CAPACITY: usize = 5;

/// Registration retry backoff: 30 s more per attempt, capped at 5 minutes.
fn registration_backoff(attempt: u32) -> Duration {
    Duration::from_secs(u64::from(attempt).saturating_mul(30).min(300))
}

fn binary_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("could not get the path of the agent binary")?;
    Ok(exe
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf())
}

/// Runs the agent until `cancel` fires. Unrecoverable startup problems are
/// returned (and echoed onto `top_errors` for the host adapter).
pub async fn run(
    cli: Cli,
    top_errors: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> Result<()> {
    let start_time_ms = chrono::Utc::now().timestamp_millis();
    let status = StatusRegister::new();

    let binary_dir = binary_dir()?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| binary_dir.join(DEFAULT_CONFIG_FILE_NAME));

    // A default-located config file that simply is not there means
    // flags-only operation; an explicitly named one must exist.
    let config_file = if cli.config.is_none() && !config_path.exists() {
        None
    } else {
        Some(config_path.as_path())
    };

    let cmdline = NeptuneConfig {
        api_key: cli.api_key.clone(),
        endpoint: cli.endpoint.clone(),
    };
    let (neptune_config, agent_config) = match config::load(config_file, cmdline) {
        Ok(configs) => configs,
        Err(e) => {
            status.update(Status::ConfigReadFailed);
            let _ = top_errors.try_send(format!("Invalid config file: {e:#}"));
            return Err(e);
        }
    };

    if let Err(e) = config::validate(&neptune_config) {
        status.update(Status::ConfigReadFailed);
        let _ = top_errors.try_send(format!("Invalid config values: {e}"));
        return Err(e);
    }
    status.update(Status::ConfigReadSucceeded);

    let config_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let log_path = config::resolve_log_path(&config_dir, &agent_config.log_file);

    let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
    let reporter = ErrorReporter::new(error_tx.clone());

    let _log_guard = match logging::setup(&log_path, agent_config.debug_mode, error_tx) {
        Ok(guard) => Some(guard),
        Err(e) => {
            let _ = top_errors.try_send(format!("Could not setup logger: {e:#}"));
            reporter.report(format!("Could not setup logger. Error: {e}"));
            None
        }
    };

    info!(version = AGENT_VERSION, "starting neptune agent");

    // The pinned public key must be usable before any network I/O happens.
    let verifier = Arc::new(MessageVerifier::load(&binary_dir).map_err(|e| {
        let _ = top_errors.try_send(format!("Could not load public key: {e:#}"));
        e
    })?);

    let metadata = metadata::collect(&agent_config)
        .await
        .context("could not get metadata from host")?;

    let api = Arc::new(ApiClient::new(&neptune_config)?);
    let registration = RegistrationCell::new();

    let mut attempt = 0u32;
    let info = loop {
        attempt += 1;
        match api.register(&metadata, start_time_ms).await {
            Ok(info) => break info,
            Err(e) => {
                let delay = registration_backoff(attempt);
                error!(error = %e, delay_secs = delay.as_secs(), "could not register the agent; retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    };
    if !info.agent_id.is_empty() {
        status.update(Status::RegistrationSucceeded);
    }
    registration.replace(info);

    let store = EventStore::initialize(&config_dir, cancel.clone());

    errors::spawn_uploader(
        api.clone(),
        registration.clone(),
        status.clone(),
        metadata.host_name.clone(),
        error_rx,
        cancel.clone(),
    );

    let uploader = Arc::new(LogUploader::new(
        api.clone(),
        log_path.clone(),
        metadata.host_name.clone(),
    ));

    // Upload the logs once in the beginning.
    if let Err(e) = uploader.upload(&registration.agent_id()).await {
        warn!(error = %e, "could not upload logs");
    }

    let (reg_updates_tx, reg_updates_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
    let (rereg_tx, rereg_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel::<Event>(EVENTS_CHANNEL_CAPACITY);
    let (outputs_tx, outputs_rx) = mpsc::channel::<ActionOutputMessage>(RESULTS_CHANNEL_CAPACITY);

    spawn_periodic_loop(
        api.clone(),
        registration.clone(),
        status.clone(),
        metadata.clone(),
        uploader,
        reg_updates_tx,
        rereg_rx,
        start_time_ms,
        cancel.clone(),
    );

    let worker = Worker::new(
        registration.clone(),
        sqs_queue_builder(),
        verifier,
        status.clone(),
    );
    tokio::spawn(worker.run(reg_updates_rx, events_tx, rereg_tx, cancel.clone()));

    let executor = Arc::new(Executor::new(
        registration.clone(),
        sqs_queue_builder(),
        status.clone(),
        store,
        agent_config.github_api_key.clone(),
        binary_dir.clone(),
    )?);
    spawn_executor_loop(executor, events_rx, outputs_tx, cancel.clone());
    spawn_results_loop(api, outputs_rx, cancel.clone());

    cancel.cancelled().await;
    info!("shutting down the agent");
    Ok(())
}

/// One task drives all periodic work: heartbeats, log uploads, and both the
/// scheduled and the triggered re-registration.
#[allow(clippy::too_many_arguments)]
fn spawn_periodic_loop(
    api: Arc<ApiClient>,
    registration: RegistrationCell,
    status: StatusRegister,
    metadata: HostMetaData,
    uploader: Arc<LogUploader>,
    reg_updates_tx: mpsc::Sender<()>,
    mut rereg_rx: mpsc::Receiver<()>,
    start_time_ms: i64,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut heartbeat = fixed_interval(HEARTBEAT_INTERVAL);
        let mut logs_upload = fixed_interval(LOGS_UPLOAD_INTERVAL);
        let mut reregistration = fixed_interval(REREGISTRATION_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = heartbeat.tick() => {
                    if let Err(e) = api.beat(&registration.agent_id(), status.label()).await {
                        error!(error = %e, "could not send heartbeats");
                    }
                }
                _ = logs_upload.tick() => {
                    if let Err(e) = uploader.upload(&registration.agent_id()).await {
                        warn!(error = %e, "could not upload logs");
                    }
                }
                _ = reregistration.tick() => {
                    reregister(&api, &metadata, &registration, &status, &reg_updates_tx, start_time_ms).await;
                }
                triggered = rereg_rx.recv() => {
                    if triggered.is_none() {
                        break;
                    }
                    info!("retriggering the registration");
                    reregister(&api, &metadata, &registration, &status, &reg_updates_tx, start_time_ms).await;
                }
            }
        }
    });
}

/// Re-registers and, on success, swaps the shared credentials and signals
/// the queue worker to rebuild its client.
async fn reregister(
    api: &ApiClient,
    metadata: &HostMetaData,
    registration: &RegistrationCell,
    status: &StatusRegister,
    reg_updates_tx: &mpsc::Sender<()>,
    start_time_ms: i64,
) {
    match api.register(metadata, start_time_ms).await {
        Ok(info) if !info.agent_id.is_empty() => {
            registration.replace(info);
            let _ = reg_updates_tx.try_send(());
        }
        Ok(_) => {
            status.update(Status::RegistrationFailed);
            error!("received incomplete registration response");
        }
        Err(e) => {
            status.update(Status::RegistrationFailed);
            error!(error = %e, "could not register the agent");
        }
    }
}

/// Fans each incoming event out into its own task, so messages from one
/// batch can execute concurrently.
fn spawn_executor_loop(
    executor: Arc<Executor>,
    mut events_rx: mpsc::Receiver<Event>,
    outputs_tx: mpsc::Sender<ActionOutputMessage>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let executor = executor.clone();
            let outputs_tx = outputs_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = executor.execute_action(event, &outputs_tx).await {
                    error!(error = %e, "could not execute the action");
                }
            });
        }
    });
}

/// Drains finished action outputs to the control plane.
fn spawn_results_loop(
    api: Arc<ApiClient>,
    mut outputs_rx: mpsc::Receiver<ActionOutputMessage>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let output = tokio::select! {
                _ = cancel.cancelled() => break,
                output = outputs_rx.recv() => match output {
                    Some(output) => output,
                    None => break,
                },
            };
            if let Err(e) = api.send_action_output(&output).await {
                error!(error = %e, "could not send action output to the control plane");
            }
        }
    });
}

/// Fixed-cadence ticker that fires first after one full period and skips
/// missed ticks instead of bursting to catch up.
fn fixed_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
