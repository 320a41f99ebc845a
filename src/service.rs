//! Host adapter: how the supervisor gets run on each platform.
//!
//! On Windows the agent registers as the `NeptuneAgent` system service and
//! accepts control verbs as the first CLI argument. Everywhere else it runs
//! as a foreground process and prints top-level errors to stderr. The
//! variant is selected at compile time.

use crate::cli::Cli;

#[cfg(not(windows))]
pub fn run(cli: Cli) -> i32 {
    foreground::run(cli)
}

#[cfg(windows)]
pub fn run(cli: Cli) -> i32 {
    windows_host::run(cli)
}

#[cfg(not(windows))]
mod foreground {
    use super::Cli;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::info;

    pub fn run(cli: Cli) -> i32 {
        let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                eprintln!("could not start the runtime: {e}");
                return 1;
            }
        };

        let cancel = CancellationToken::new();
        let (top_errors_tx, mut top_errors_rx) = mpsc::channel::<String>(5);

        runtime.block_on(async {
            // Echo startup problems so they are visible without the log file.
            tokio::spawn(async move {
                while let Some(message) = top_errors_rx.recv().await {
                    eprintln!("{message}");
                }
            });

            let shutdown = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("shutdown signal received; stopping the agent");
                shutdown.cancel();
            });

            match crate::supervisor::run(cli, top_errors_tx, cancel).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("{e:#}");
                    1
                }
            }
        })
    }

    async fn shutdown_signal() {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }
}

#[cfg(windows)]
mod windows_host {
    use super::Cli;
    use std::ffi::OsString;
    use std::sync::OnceLock;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use windows_service::service::{
        ServiceAccess, ServiceControl, ServiceControlAccept, ServiceErrorControl, ServiceExitCode,
        ServiceInfo, ServiceStartType, ServiceState, ServiceStatus, ServiceType,
    };
    use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
    use windows_service::service_dispatcher;
    use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

    const SERVICE_NAME: &str = "NeptuneAgent";

    static SERVICE_CANCEL: OnceLock<CancellationToken> = OnceLock::new();

    windows_service::define_windows_service!(ffi_service_main, service_main);

    pub fn run(cli: Cli) -> i32 {
        match cli.verb.as_deref() {
            Some(verb) => match control(verb) {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("{e:#}");
                    1
                }
            },
            None => match service_dispatcher::start(SERVICE_NAME, ffi_service_main) {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("could not start the service dispatcher: {e}");
                    1
                }
            },
        }
    }

    fn service_main(_arguments: Vec<OsString>) {
        if let Err(e) = run_service() {
            eprintln!("{e:#}");
        }
    }

    fn run_service() -> anyhow::Result<()> {
        let cancel = SERVICE_CANCEL.get_or_init(CancellationToken::new).clone();

        let handler_cancel = cancel.clone();
        let status_handle =
            service_control_handler::register(SERVICE_NAME, move |control| match control {
                ServiceControl::Stop => {
                    handler_cancel.cancel();
                    ServiceControlHandlerResult::NoError
                }
                ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
                _ => ServiceControlHandlerResult::NotImplemented,
            })?;

        let running = ServiceStatus {
            service_type: ServiceType::OWN_PROCESS,
            current_state: ServiceState::Running,
            controls_accepted: ServiceControlAccept::STOP,
            exit_code: ServiceExitCode::Win32(0),
            checkpoint: 0,
            wait_hint: Duration::default(),
            process_id: None,
        };
        status_handle.set_service_status(running.clone())?;

        // Service parameters come from the config file next to the binary.
        let cli = Cli {
            endpoint: String::new(),
            api_key: String::new(),
            config: None,
            verb: None,
        };

        let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
        let (top_errors_tx, mut top_errors_rx) = mpsc::channel::<String>(5);
        let result = runtime.block_on(async {
            // The service has no console; surface top-level errors in the log.
            tokio::spawn(async move {
                while let Some(message) = top_errors_rx.recv().await {
                    tracing::error!(message, "agent startup error");
                }
            });
            crate::supervisor::run(cli, top_errors_tx, cancel.clone()).await
        });

        status_handle.set_service_status(ServiceStatus {
            current_state: ServiceState::Stopped,
            controls_accepted: ServiceControlAccept::empty(),
            ..running
        })?;
        result
    }

    fn control(verb: &str) -> anyhow::Result<()> {
        match verb {
            "install" => install(),
            "uninstall" => uninstall(),
            "start" => start(),
            "stop" => stop(),
            "restart" => {
                stop()?;
                start()
            }
            other => anyhow::bail!(
                "unknown service verb {other:?}; expected install, uninstall, start, stop, or restart"
            ),
        }
    }

    fn manager(access: ServiceManagerAccess) -> anyhow::Result<ServiceManager> {
        Ok(ServiceManager::local_computer(None::<&str>, access)?)
    }

    fn install() -> anyhow::Result<()> {
        let manager = manager(ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE)?;
        let info = ServiceInfo {
            name: OsString::from(SERVICE_NAME),
            display_name: OsString::from(SERVICE_NAME),
            service_type: ServiceType::OWN_PROCESS,
            start_type: ServiceStartType::AutoStart,
            error_control: ServiceErrorControl::Normal,
            executable_path: std::env::current_exe()?,
            launch_arguments: vec![],
            dependencies: vec![],
            account_name: None,
            account_password: None,
        };
        manager.create_service(&info, ServiceAccess::QUERY_STATUS)?;
        Ok(())
    }

    fn uninstall() -> anyhow::Result<()> {
        let manager = manager(ServiceManagerAccess::CONNECT)?;
        let service = manager.open_service(SERVICE_NAME, ServiceAccess::DELETE)?;
        service.delete()?;
        Ok(())
    }

    fn start() -> anyhow::Result<()> {
        let manager = manager(ServiceManagerAccess::CONNECT)?;
        let service = manager.open_service(SERVICE_NAME, ServiceAccess::START)?;
        service.start::<&str>(&[])?;
        Ok(())
    }

    fn stop() -> anyhow::Result<()> {
        let manager = manager(ServiceManagerAccess::CONNECT)?;
        let service = manager.open_service(SERVICE_NAME, ServiceAccess::STOP)?;
        service.stop()?;
        Ok(())
    }
}
