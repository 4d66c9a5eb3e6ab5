//! Sweeper worker for stuck deployments and pending teardowns

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::deploy::orchestrator::Orchestrator;

/// Sweeper worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Sweep interval
    pub interval: Duration,

    /// Initial delay before first sweep
    pub initial_delay: Duration,

    /// Time a record may sit in a non-terminal state
    pub deployment_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(5),
            deployment_timeout: Duration::from_secs(600),
        }
    }
}

/// Run the sweeper worker
pub async fn run<S, F>(
    options: &Options,
    orchestrator: &Orchestrator,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Sweeper worker starting...");

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Sweeper worker shutting down...");
            return;
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    loop {
        debug!("Sweeping deployments...");
        if let Err(e) = orchestrator
            .sweep(Utc::now(), options.deployment_timeout)
            .await
        {
            error!("Sweep failed: {}", e);
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Sweeper worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
