//! Application configuration options

use std::time::Duration;

use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::{notifier, sweeper};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Collaborator and policy settings
    pub settings: Settings,

    /// Enable the HTTP API
    pub enable_socket_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Enable the sweeper worker
    pub enable_sweeper: bool,

    /// Sweeper worker options
    pub sweeper: sweeper::Options,

    /// Webhook delivery worker options
    pub notifier: notifier::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(StorageLayout::default(), Settings::default())
    }
}

impl AppOptions {
    pub fn from_settings(layout: StorageLayout, settings: Settings) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            enable_socket_server: true,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            enable_sweeper: settings.sweeper.enabled,
            sweeper: sweeper::Options {
                interval: Duration::from_secs(settings.sweeper.interval_secs),
                deployment_timeout: Duration::from_secs(settings.sweeper.deployment_timeout_secs),
                ..Default::default()
            },
            notifier: notifier::Options {
                max_in_flight: settings.notifier.max_in_flight,
                drain_timeout: Duration::from_secs(settings.notifier.drain_timeout_secs),
            },
            settings,
        }
    }
}

/// Lifecycle options for the orchestrator
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}
