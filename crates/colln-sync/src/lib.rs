//! Collection pipeline: page sessions, runs, outputs and the periodic scheduler.

pub mod config;
pub mod metrics;
pub mod output;
pub mod run;
pub mod scheduler;
pub mod session;

pub use config::{parse_utc_offset, CollectConfig, PortalConfig, PortalRegistry};
pub use metrics::{CollectorMetrics, MetricsSnapshot};
pub use output::{write_outputs, OutputLayout, WrittenOutput, LIST_HEADER};
pub use run::{
    fetch_bodies, fetch_list, BodyErrorPolicy, BodyTally, Collection, DriverFactory, RunError,
    RunReport,
};
pub use scheduler::{RunFactory, Scheduler, SchedulerSummary};
pub use session::{
    guard, BodyError, BodyStatus, Collector, ErrorClass, PageSession, SessionError,
    SessionOptions, SessionState,
};

pub const CRATE_NAME: &str = "colln-sync";

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
