//! Runbook execution.
//!
//! The executor takes a verified event, runs it through the duplication,
//! staleness, and policy gates, materializes the runbook into an executable
//! temp file, and runs it in a subprocess under a hard wall-clock timeout.
//! Once the subprocess start has been attempted the queue message is deleted
//! and the execution is committed: a crash will not replay it, because the
//! event id is already in the dedup store by then.

pub mod kill;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::api::action_output::ActionOutputMessage;
use crate::api::registration::RegistrationCell;
use crate::api::Event;
use crate::state::EventStore;
use crate::status::{Status, StatusRegister};
use crate::worker::QueueBuilder;

/// Runbook output is truncated to this many bytes per stream.
const MAX_ACTION_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

/// Events older than this are discarded as stale. Strictly smaller than the
/// dedup store retention, so the index always covers acceptable events.
const STALENESS_TIMEOUT_MS: i64 = 10 * 60 * 1000;

const STATUS_SUCCESS: &str = "SUCCESS";
const STATUS_FAILED: &str = "FAILED";
const STATUS_TIMEOUT: &str = "TIMEOUT";

/// Result of one subprocess run, before it is shaped into an
/// [`ActionOutputMessage`].
struct ExecOutcome {
    status: &'static str,
    status_code: i32,
    is_timeout: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

pub struct Executor {
    registration: RegistrationCell,
    build_queue: QueueBuilder,
    status: StatusRegister,
    store: EventStore,
    github_api_key: String,
    work_dir: PathBuf,
    http: reqwest::Client,
}

impl Executor {
    pub fn new(
        registration: RegistrationCell,
        build_queue: QueueBuilder,
        status: StatusRegister,
        store: EventStore,
        github_api_key: String,
        work_dir: PathBuf,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("building runbook fetch HTTP client")?;
        Ok(Self {
            registration,
            build_queue,
            status,
            store,
            github_api_key,
            work_dir,
            http,
        })
    }

    /// Executes the runbook carried by one event, provided it passes the
    /// pre-execution gates: not a duplicate, not stale, and not a raw command
    /// on an agent restricted to fetched runbooks.
    pub async fn execute_action(
        &self,
        event: Event,
        outputs: &mpsc::Sender<ActionOutputMessage>,
    ) -> Result<()> {
        if self.store.has_processed(&event.event_id) {
            info!(event_id = %event.event_id, "discarding the event since it was already processed");
            self.delete_message(&event.receipt_handle).await;
            return Ok(());
        }

        let current_millis = chrono::Utc::now().timestamp_millis();
        if current_millis - event.timestamp > STALENESS_TIMEOUT_MS {
            error!(
                event_id = %event.event_id,
                timestamp = event.timestamp,
                "received a stale event; dropping and deleting it from the queue"
            );
            self.delete_message(&event.receipt_handle).await;
            return Ok(());
        }

        if !self.github_api_key.is_empty() && !event.raw_command.is_empty() {
            error!(
                event_id = %event.event_id,
                "agent is restricted to fetched runbooks but received a raw command; deleting the event"
            );
            self.delete_message(&event.receipt_handle).await;
            return Ok(());
        }

        info!(event_id = %event.event_id, "processing event");

        let runbook = if !event.github_file_path.is_empty() {
            if self.github_api_key.is_empty() {
                error!("github api key is empty but the event carries a github runbook path");
                bail!("empty github api key");
            }
            self.fetch_runbook_from_github(&event.github_file_path).await?
        } else {
            event.raw_command.clone()
        };

        let tmp_file =
            write_runbook_file(&self.work_dir, &event.event_id, &event.runbook_name, &runbook)
                .await?;

        // Record the event before execution so a redelivery can never run it
        // a second time.
        self.store.persist(&event.event_id).await;

        let outcome = self.execute(&event, &tmp_file).await;
        let _ = tokio::fs::remove_file(&tmp_file).await;

        self.send_action_output(&event, outcome, outputs).await;
        Ok(())
    }

    /// Runs the materialized runbook file with the event's timeout and
    /// environment. The queue message is deleted right after the start
    /// attempt, before the exit is awaited.
    async fn execute(&self, event: &Event, tmp_file: &Path) -> ExecOutcome {
        let mut command = build_command(tmp_file);
        kill::set_process_group(&mut command);
        command
            .envs(&event.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let spawned = command.spawn();

        // The command has been started (or the start has failed for good);
        // either way the message is not worth redelivering.
        self.delete_message(&event.receipt_handle).await;

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "could not start the command");
                return ExecOutcome {
                    status: STATUS_FAILED,
                    status_code: 1,
                    is_timeout: false,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                };
            }
        };

        // Drain both pipes while waiting, so a chatty runbook cannot fill
        // the pipe buffer and deadlock against its own timeout.
        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        let timeout = Duration::from_secs(event.timeout.max(0) as u64);
        let (wait_result, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(result) => (result, false),
            Err(_) => {
                debug!(event_id = %event.event_id, "killing the command");
                kill::kill_command(&mut child);
                let drained = child.wait().await;
                info!(event_id = %event.event_id, "killed the command after timeout");
                (drained, true)
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let (status, status_code) = if timed_out {
            (STATUS_TIMEOUT, exit_code(&wait_result))
        } else {
            match &wait_result {
                Ok(exit) if exit.success() => (STATUS_SUCCESS, 0),
                Ok(_) => (STATUS_FAILED, exit_code(&wait_result)),
                Err(e) => {
                    error!(error = %e, file = %tmp_file.display(), "failed to run the command");
                    (STATUS_FAILED, 1)
                }
            }
        };

        ExecOutcome {
            status,
            status_code,
            is_timeout: timed_out,
            stdout,
            stderr,
        }
    }

    async fn send_action_output(
        &self,
        event: &Event,
        outcome: ExecOutcome,
        outputs: &mpsc::Sender<ActionOutputMessage>,
    ) {
        let message = ActionOutputMessage {
            rule_name: event.rule_name.clone(),
            rule_id: event.rule_id.clone(),
            host_name: event.hostname.clone(),
            event_id: event.event_id.clone(),
            inflight_action_id: event.inflight_action_id.clone(),
            action_type: event.action_type.clone(),
            agent_id: self.registration.agent_id(),
            status_code: outcome.status_code,
            status: outcome.status.to_string(),
            is_timeout: outcome.is_timeout,
            action_output: truncate_output(outcome.stdout),
            failure_reason: truncate_output(outcome.stderr),
        };

        info!(
            event_id = %event.event_id,
            status = %message.status,
            exit_code = message.status_code,
            timeout = message.is_timeout,
            "finished processing the event"
        );

        if outputs.send(message).await.is_ok() {
            self.status.update(Status::Active);
        } else {
            error!("could not queue the action output for upload");
        }
    }

    /// Deletes a queue message using a client built from the current
    /// registration, so rotated credentials are always honored. Best-effort.
    async fn delete_message(&self, receipt_handle: &str) {
        match (self.build_queue)(&self.registration.snapshot()) {
            Ok(queue) => {
                if let Err(e) = queue.delete(receipt_handle).await {
                    error!(error = %e, "could not delete the event");
                }
            }
            Err(e) => error!(error = %e, "could not build a queue client to delete the event"),
        }
    }

    /// Fetches a runbook body from the code host. The path is
    /// `<owner>/<repo>/<path...>` and is fetched raw with the configured
    /// read-only access token.
    async fn fetch_runbook_from_github(&self, full_path: &str) -> Result<String> {
        let parts: Vec<&str> = full_path.split('/').collect();
        if parts.len() < 3 {
            error!(path = full_path, "github runbook path does not have the required fields");
            bail!("incomplete github runbook path");
        }
        let owner = parts[0];
        let repo = parts[1];
        let file_path = parts[2..].join("/");

        debug!(path = full_path, "getting runbook from github");
        let url = format!("https://api.github.com/repos/{owner}/{repo}/contents/{file_path}");
        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("token {}", self.github_api_key))
            .header("Accept", "application/vnd.github.v3.raw")
            .header("User-Agent", "neptune-agent")
            .send()
            .await
            .context("could not download runbook from github")?;

        let code = response.status().as_u16();
        if !(200..=299).contains(&code) {
            bail!("Server returned unexpected status: {code}");
        }
        response.text().await.context("reading runbook body")
    }
}

async fn read_stream<R: tokio::io::AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    buf
}

/// Streams over the cap are cut to one byte under it.
fn truncate_output(mut output: Vec<u8>) -> String {
    if output.len() > MAX_ACTION_OUTPUT_SIZE {
        output.truncate(MAX_ACTION_OUTPUT_SIZE - 1);
    }
    String::from_utf8_lossy(&output).into_owned()
}

/// Picks the script extension the host shell will accept.
fn script_extension(runbook_name: &str) -> &'static str {
    if cfg!(windows) {
        if runbook_name.ends_with(".ps1") {
            ".ps1"
        } else {
            ".cmd"
        }
    } else {
        ".sh"
    }
}

/// Writes the runbook to `<dir>/<eventId><ext>` and makes it executable.
async fn write_runbook_file(
    dir: &Path,
    event_id: &str,
    runbook_name: &str,
    content: &str,
) -> Result<PathBuf> {
    let path = dir.join(format!("{event_id}{}", script_extension(runbook_name)));
    tokio::fs::write(&path, content)
        .await
        .with_context(|| format!("writing runbook file: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777)).await
        {
            tracing::warn!(error = %e, file = %path.display(), "could not make the runbook executable");
        }
    }

    Ok(path)
}

fn build_command(tmp_file: &Path) -> tokio::process::Command {
    #[cfg(windows)]
    {
        if tmp_file.extension().map(|ext| ext == "ps1").unwrap_or(false) {
            let mut command = tokio::process::Command::new("powershell");
            command.arg(tmp_file);
            command
        } else {
            tokio::process::Command::new(tmp_file)
        }
    }
    #[cfg(not(windows))]
    {
        let mut command = tokio::process::Command::new("/bin/sh");
        command.arg("-c").arg(tmp_file);
        command
    }
}

fn exit_code(wait_result: &std::io::Result<std::process::ExitStatus>) -> i32 {
    match wait_result {
        Ok(exit) => exit.code().unwrap_or(-1),
        Err(_) => 1,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::api::registration::{RegistrationCell, RegistrationInfo};
    use crate::worker::testing::{MockQueue, QueueOp};
    use crate::worker::SharedQueue;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct TempDir {
        path: PathBuf,
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    fn tempdir() -> TempDir {
        let path = std::env::temp_dir().join(format!("neptune-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).unwrap();
        TempDir { path }
    }

    struct Harness {
        executor: Executor,
        queue: Arc<MockQueue>,
        status: StatusRegister,
        outputs_tx: mpsc::Sender<ActionOutputMessage>,
        outputs_rx: mpsc::Receiver<ActionOutputMessage>,
        cancel: CancellationToken,
        _dir: TempDir,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    fn harness(github_api_key: &str) -> Harness {
        let dir = tempdir();
        let cancel = CancellationToken::new();
        let store = EventStore::initialize(&dir.path, cancel.clone());

        let cell = RegistrationCell::new();
        cell.replace(RegistrationInfo {
            agent_id: "A1".into(),
            ..RegistrationInfo::default()
        });

        let queue = Arc::new(MockQueue::default());
        let q = queue.clone();
        let build: QueueBuilder = Arc::new(move |_| Ok(q.clone() as SharedQueue));

        let status = StatusRegister::new();
        let executor = Executor::new(
            cell,
            build,
            status.clone(),
            store,
            github_api_key.to_string(),
            dir.path.clone(),
        )
        .unwrap();

        let (outputs_tx, outputs_rx) = mpsc::channel(10);
        Harness {
            executor,
            queue,
            status,
            outputs_tx,
            outputs_rx,
            cancel,
            _dir: dir,
        }
    }

    fn event(raw_command: &str, timeout: i64) -> Event {
        Event {
            event_id: format!("E-{}", uuid::Uuid::new_v4()),
            agent_id: "A1".into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            raw_command: raw_command.into(),
            timeout,
            receipt_handle: "rh-1".into(),
            ..Event::default()
        }
    }

    #[tokio::test]
    async fn happy_path_runs_and_reports_success() {
        let mut h = harness("");
        let event = event("echo hello", 5);
        h.executor.execute_action(event.clone(), &h.outputs_tx).await.unwrap();

        let output = h.outputs_rx.try_recv().unwrap();
        assert_eq!(output.status, STATUS_SUCCESS);
        assert_eq!(output.status_code, 0);
        assert_eq!(output.action_output, "hello\n");
        assert_eq!(output.failure_reason, "");
        assert!(!output.is_timeout);
        assert_eq!(output.agent_id, "A1");
        assert_eq!(output.event_id, event.event_id);
        assert_eq!(h.queue.deletes(), 1);
        assert!(h.executor.store.has_processed(&event.event_id));
        assert_eq!(h.status.current(), Some(Status::Active));
    }

    #[tokio::test]
    async fn duplicate_event_is_deleted_without_a_second_run() {
        let mut h = harness("");
        let event = event("echo once", 5);
        h.executor.execute_action(event.clone(), &h.outputs_tx).await.unwrap();
        assert!(h.outputs_rx.try_recv().is_ok());

        h.executor.execute_action(event, &h.outputs_tx).await.unwrap();
        assert!(h.outputs_rx.try_recv().is_err());
        // One delete from the committed run, one from the duplicate discard.
        assert_eq!(h.queue.deletes(), 2);
    }

    #[tokio::test]
    async fn stale_event_is_deleted_without_running() {
        let mut h = harness("");
        let mut stale = event("echo never", 5);
        stale.timestamp = chrono::Utc::now().timestamp_millis() - 11 * 60 * 1000;

        h.executor.execute_action(stale.clone(), &h.outputs_tx).await.unwrap();

        assert!(h.outputs_rx.try_recv().is_err());
        assert_eq!(h.queue.deletes(), 1);
        assert!(!h.executor.store.has_processed(&stale.event_id));
    }

    #[tokio::test]
    async fn raw_command_is_rejected_in_github_only_mode() {
        let mut h = harness("some-github-token");
        let event = event("echo policy", 5);

        h.executor.execute_action(event.clone(), &h.outputs_tx).await.unwrap();

        assert!(h.outputs_rx.try_recv().is_err());
        assert_eq!(h.queue.deletes(), 1);
        assert!(!h.executor.store.has_processed(&event.event_id));
    }

    #[tokio::test]
    async fn timeout_kills_the_whole_process_tree() {
        let mut h = harness("");
        let pidfile = h._dir.path.join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > {}\nwait\n", pidfile.display());
        let mut event = event(&script, 1);
        event.runbook_name = "slow.sh".into();

        let started = std::time::Instant::now();
        h.executor.execute_action(event, &h.outputs_tx).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let output = h.outputs_rx.try_recv().unwrap();
        assert_eq!(output.status, STATUS_TIMEOUT);
        assert!(output.is_timeout);

        let grandchild: i32 = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let alive = match std::fs::read_to_string(format!("/proc/{grandchild}/stat")) {
            Err(_) => false,
            Ok(stat) => !stat.split(") ").nth(1).unwrap_or("Z").starts_with('Z'),
        };
        assert!(!alive, "grandchild survived the timeout kill");
    }

    #[tokio::test]
    async fn nonzero_exit_reports_failed_with_code() {
        let mut h = harness("");
        h.executor
            .execute_action(event("echo oops >&2; exit 3", 5), &h.outputs_tx)
            .await
            .unwrap();

        let output = h.outputs_rx.try_recv().unwrap();
        assert_eq!(output.status, STATUS_FAILED);
        assert_eq!(output.status_code, 3);
        assert_eq!(output.failure_reason, "oops\n");
        assert!(!output.is_timeout);
    }

    #[tokio::test]
    async fn message_is_deleted_before_the_exit_is_awaited() {
        let h = harness("");
        let started = std::time::Instant::now();
        h.executor
            .execute_action(event("sleep 1", 5), &h.outputs_tx)
            .await
            .unwrap();
        let finished = started.elapsed();

        let ops = h.queue.ops.lock().unwrap();
        let (op, deleted_at) = ops.first().expect("no delete recorded");
        assert!(matches!(op, QueueOp::Delete(_)));
        let delete_latency = deleted_at.duration_since(started);
        drop(ops);

        assert!(finished >= Duration::from_millis(900));
        assert!(
            delete_latency < Duration::from_millis(700),
            "message deleted only after the process exited"
        );
    }

    #[tokio::test]
    async fn event_environment_is_merged_onto_the_inherited_one() {
        let mut h = harness("");
        let mut event = event("echo ${NEPTUNE_TEST_VAR}-${PATH:+haspath}", 5);
        event.environment =
            HashMap::from([("NEPTUNE_TEST_VAR".to_string(), "injected".to_string())]);

        h.executor.execute_action(event, &h.outputs_tx).await.unwrap();
        let output = h.outputs_rx.try_recv().unwrap();
        assert_eq!(output.action_output, "injected-haspath\n");
    }

    #[tokio::test]
    async fn oversized_output_is_truncated_to_one_byte_under_the_cap() {
        let mut h = harness("");
        let bytes = MAX_ACTION_OUTPUT_SIZE + 1024;
        let script = format!("head -c {bytes} /dev/zero | tr '\\0' x");
        h.executor
            .execute_action(event(&script, 30), &h.outputs_tx)
            .await
            .unwrap();

        let output = h.outputs_rx.try_recv().unwrap();
        assert_eq!(output.action_output.len(), MAX_ACTION_OUTPUT_SIZE - 1);
        assert!(output.action_output.bytes().all(|b| b == b'x'));
    }

    #[tokio::test]
    async fn temp_file_is_removed_after_the_run() {
        let mut h = harness("");
        let event = event("echo tidy", 5);
        let expected = h._dir.path.join(format!("{}.sh", event.event_id));

        h.executor.execute_action(event, &h.outputs_tx).await.unwrap();
        assert!(h.outputs_rx.try_recv().is_ok());
        assert!(!expected.exists());
    }

    #[tokio::test]
    async fn incomplete_github_path_is_an_error() {
        let h = harness("token");
        let mut event = event("", 5);
        event.github_file_path = "owner/repo-only".into();
        let result = h.executor.execute_action(event, &h.outputs_tx).await;
        assert!(result.is_err());
    }

    #[test]
    fn extension_selection_on_this_platform() {
        assert_eq!(script_extension("runbook.ps1"), ".sh");
        assert_eq!(script_extension("runbook"), ".sh");
    }

    #[test]
    fn truncation_boundary_conditions() {
        let exactly_cap = vec![b'a'; MAX_ACTION_OUTPUT_SIZE];
        assert_eq!(truncate_output(exactly_cap).len(), MAX_ACTION_OUTPUT_SIZE);

        let over_cap = vec![b'a'; MAX_ACTION_OUTPUT_SIZE + 1];
        assert_eq!(truncate_output(over_cap).len(), MAX_ACTION_OUTPUT_SIZE - 1);

        assert_eq!(truncate_output(b"short".to_vec()), "short");
    }
}
