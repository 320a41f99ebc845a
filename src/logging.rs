//! Logging setup for the agent.
//!
//! Log lines go to the configured agent log file through a non-blocking
//! appender. ERROR-level events are additionally mirrored onto the agent
//! error channel so they reach the control plane, which is how agent faults
//! on remote hosts get noticed without shell access.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Context as LayerContext, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber: file appender plus error funnel.
/// The returned guard must be kept alive for the process lifetime or tail
/// log lines are lost.
pub fn setup(log_path: &Path, debug_mode: bool, error_tx: mpsc::Sender<String>) -> Result<WorkerGuard> {
    let dir = log_path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = log_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "neptune-agent.log".to_string());

    let appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::NEVER)
        .filename_prefix(file_name)
        .build(dir)
        .context("opening the agent log file")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let default_level = if debug_mode { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer),
        )
        .with(ErrorFunnelLayer { tx: error_tx })
        .try_init()
        .context("initializing the logging subscriber")?;

    Ok(guard)
}

/// Forwards every ERROR event, message and fields flattened into one line,
/// onto the bounded agent error channel. Sends never block; when the channel
/// is full the event is simply not forwarded.
struct ErrorFunnelLayer {
    tx: mpsc::Sender<String>,
}

impl<S: Subscriber> Layer<S> for ErrorFunnelLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
        if *event.metadata().level() != Level::ERROR {
            return;
        }
        let mut visitor = FlattenVisitor::default();
        event.record(&mut visitor);
        let _ = self.tx.try_send(visitor.render());
    }
}

#[derive(Default)]
struct FlattenVisitor {
    message: String,
    fields: Vec<String>,
}

impl FlattenVisitor {
    fn render(self) -> String {
        let mut line = self.message;
        for field in self.fields {
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(&field);
        }
        line
    }
}

impl Visit for FlattenVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message.clear();
            let _ = write!(self.message, "{value:?}");
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}
