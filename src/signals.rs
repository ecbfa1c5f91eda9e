use crate::services::ServiceResult;
use crate::services::manager::ServiceManager;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Handle application shutdown signals and graceful shutdown
pub async fn handle_shutdown_signals(
    mut service_manager: ServiceManager,
    shutdown_timeout: Duration,
) -> ExitCode {
    // Set up signal handling for both SIGINT (Ctrl+C) and SIGTERM
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("received ctrl+c, gracefully shutting down...");
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm_stream =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM signal handler");
        sigterm_stream.recv().await;
        info!("received SIGTERM, gracefully shutting down...");
    };

    #[cfg(not(unix))]
    let sigterm = async {
        // On non-Unix systems, create a future that never completes
        // This ensures the select! macro works correctly
        std::future::pending::<()>().await;
    };

    let mut exit_code = ExitCode::SUCCESS;

    tokio::select! {
        (service_name, result) = service_manager.run() => {
            // A service completed on its own; that is always unexpected.
            match result {
                ServiceResult::GracefulShutdown => {
                    info!(service = service_name, "service completed gracefully");
                }
                ServiceResult::NormalCompletion => {
                    warn!(service = service_name, "service completed unexpectedly");
                    exit_code = ExitCode::FAILURE;
                }
                ServiceResult::Error(e) => {
                    error!(service = service_name, error = ?e, "service failed");
                    exit_code = ExitCode::FAILURE;
                }
            }

            if let Err(pending) = service_manager.shutdown(shutdown_timeout).await {
                warn!(pending = ?pending, "graceful shutdown elapsed with pending services");
                exit_code = ExitCode::from(2);
            }
        }
        _ = ctrl_c => {
            if let Err(pending) = service_manager.shutdown(shutdown_timeout).await {
                warn!(pending = ?pending, "graceful shutdown elapsed with pending services");
                exit_code = ExitCode::from(2);
            }
        }
        _ = sigterm => {
            if let Err(pending) = service_manager.shutdown(shutdown_timeout).await {
                warn!(pending = ?pending, "graceful shutdown elapsed with pending services");
                exit_code = ExitCode::from(2);
            }
        }
    }

    info!("application shutdown complete");
    exit_code
}
