//! Application state management

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::deploy::dispatcher::{
    BuildBackend, BuildDispatcher, DispatcherOptions, MemoryBuildBackend, WorkflowBuildBackend,
};
use crate::deploy::docker::DockerBuildBackend;
use crate::deploy::notifier::{DeliveryOptions, Notification, Notifier, WebhookDelivery};
use crate::deploy::orchestrator::{Command, Orchestrator, OrchestratorOptions};
use crate::deploy::provisioner::{
    ComputePlatform, ComputeProvisioner, HttpComputePlatform, MemoryComputePlatform,
    ProvisionerOptions,
};
use crate::deploy::validator::{Validator, ValidatorOptions};
use crate::errors::OrchestratorError;
use crate::filesys::dir::Dir;
use crate::http::client::HttpClient;
use crate::models::deployment::DeploymentStatus;
use crate::storage::artifacts::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
use crate::storage::layout::StorageLayout;
use crate::storage::records::{DeploymentFilter, DeploymentStore, FileStore, MemoryStore};
use crate::storage::settings::{
    BuildBackendKind, ComputePlatformKind, Settings, StoreBackend,
};
use crate::utils::CooldownOptions;
use crate::workers::executor::Executor;

/// Timeout of collaborator API calls
const COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(60);

/// Receiving ends of the internal queues, handed to the workers
pub struct Queues {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

/// Main application state
pub struct AppState {
    pub store: Arc<dyn DeploymentStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub executor: Arc<Executor>,
    pub delivery: Arc<WebhookDelivery>,
}

impl AppState {
    /// Open the stores and wire collaborators as configured
    pub async fn init(
        layout: &StorageLayout,
        settings: &Settings,
    ) -> Result<(Self, Queues), OrchestratorError> {
        info!("Initializing application state...");

        let store = open_records(layout, settings).await?;
        let artifacts = open_artifacts(layout, settings);

        let backend = build_backend(layout, settings, artifacts.clone())?;
        info!(backend = backend.name(), "Build backend ready");
        let dispatcher = Arc::new(BuildDispatcher::new(
            backend,
            DispatcherOptions {
                registry: settings.build.registry.clone(),
                repository: settings.build.repository.clone(),
                callback_url: format!(
                    "{}/callbacks/builds",
                    settings.server.public_url.trim_end_matches('/')
                ),
            },
        ));

        let platform = compute_platform(settings)?;
        info!(platform = platform.name(), "Compute platform ready");
        let provisioner = Arc::new(ComputeProvisioner::new(
            platform,
            ProvisionerOptions {
                memory_mb: settings.compute.memory_mb,
                function_timeout: Duration::from_secs(settings.compute.function_timeout_secs),
                readiness_timeout: Duration::from_secs(settings.compute.readiness_timeout_secs),
            },
        ));

        let validator = Arc::new(Validator::new(
            artifacts.clone(),
            ValidatorOptions {
                max_artifact_bytes: settings.validator.max_artifact_bytes,
            },
        ));

        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new(notification_tx, settings.notifier.default_url.clone());
        let delivery = Arc::new(WebhookDelivery::new(
            HttpClient::new(
                "",
                None,
                Duration::from_secs(settings.notifier.request_timeout_secs),
            )?,
            DeliveryOptions {
                max_attempts: settings.notifier.max_attempts,
                backoff: CooldownOptions {
                    base_delay: Duration::from_secs(settings.notifier.base_delay_secs),
                    ..Default::default()
                },
            },
        ));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            artifacts.clone(),
            dispatcher,
            command_tx,
            notifier,
            OrchestratorOptions {
                retry: settings.retry.to_policy(),
                max_deployments_per_owner: settings.quota.max_deployments_per_owner,
            },
        ));
        let executor = Arc::new(Executor::new(
            orchestrator.clone(),
            validator,
            provisioner,
        ));

        let state = Self {
            store,
            artifacts,
            orchestrator,
            executor,
            delivery,
        };
        let queues = Queues {
            commands: command_rx,
            notifications: notification_rx,
        };
        Ok((state, queues))
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        info!("Shutting down application state...");
        let in_flight = self
            .store
            .list(
                &DeploymentFilter::new()
                    .status(DeploymentStatus::Pending)
                    .status(DeploymentStatus::Validating)
                    .status(DeploymentStatus::Building)
                    .status(DeploymentStatus::Deploying),
            )
            .await?
            .len();
        if in_flight > 0 {
            info!(in_flight, "Deployments still in flight; they resume on next start");
        }
        Ok(())
    }
}

async fn open_records(
    layout: &StorageLayout,
    settings: &Settings,
) -> Result<Arc<dyn DeploymentStore>, OrchestratorError> {
    Ok(match settings.storage.records {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => Arc::new(FileStore::open(layout.records_dir()).await?),
    })
}

fn open_artifacts(layout: &StorageLayout, settings: &Settings) -> Arc<dyn ArtifactStore> {
    match settings.storage.artifacts {
        StoreBackend::Memory => Arc::new(MemoryArtifactStore::new()),
        StoreBackend::File => Arc::new(FsArtifactStore::new(layout.artifacts_dir())),
    }
}

fn build_backend(
    layout: &StorageLayout,
    settings: &Settings,
    artifacts: Arc<dyn ArtifactStore>,
) -> Result<Arc<dyn BuildBackend>, OrchestratorError> {
    let build = &settings.build;
    Ok(match build.backend {
        BuildBackendKind::Workflow => {
            if build.workflow.dispatch_url.is_empty() {
                return Err(OrchestratorError::ConfigError(
                    "build.workflow.dispatch_url is required for the workflow backend".to_string(),
                ));
            }
            let client = HttpClient::new(
                &build.workflow.dispatch_url,
                build.workflow.token.clone(),
                COLLABORATOR_TIMEOUT,
            )?;
            Arc::new(WorkflowBuildBackend::new(client, build.workflow.git_ref.clone()))
        }
        BuildBackendKind::Docker => Arc::new(DockerBuildBackend::new(
            build.docker.docker_bin.clone(),
            Dir::new(&build.docker.template_dir),
            layout.builds_dir(),
            artifacts,
            build.docker.push,
        )),
        BuildBackendKind::Memory => Arc::new(MemoryBuildBackend::new()),
    })
}

fn compute_platform(settings: &Settings) -> Result<Arc<dyn ComputePlatform>, OrchestratorError> {
    let compute = &settings.compute;
    Ok(match compute.platform {
        ComputePlatformKind::Http => {
            if compute.api_url.is_empty() {
                return Err(OrchestratorError::ConfigError(
                    "compute.api_url is required for the http platform".to_string(),
                ));
            }
            let client = HttpClient::new(&compute.api_url, compute.token.clone(), COLLABORATOR_TIMEOUT)?;
            Arc::new(HttpComputePlatform::new(client))
        }
        ComputePlatformKind::Memory => {
            Arc::new(MemoryComputePlatform::new(compute.public_base_url.clone()))
        }
    })
}
