//! Shared test harness: the whole pipeline wired with in-memory collaborators

use std::sync::Arc;
use std::time::{Duration, Instant};

use serveml::deploy::dispatcher::{
    BuildBackend, BuildDispatcher, DispatcherOptions, MemoryBuildBackend,
};
use serveml::deploy::fsm::RetryPolicy;
use serveml::deploy::notifier::{Notification, Notifier};
use serveml::deploy::orchestrator::{Command, CreateDeployment, Orchestrator, OrchestratorOptions};
use serveml::deploy::provisioner::{ComputeProvisioner, MemoryComputePlatform, ProvisionerOptions};
use serveml::deploy::validator::{Validator, ValidatorOptions};
use serveml::models::deployment::{Deployment, DeploymentStatus};
use serveml::storage::artifacts::{ArtifactStore, MemoryArtifactStore};
use serveml::storage::records::{DeploymentStore, MemoryStore};
use serveml::utils::CooldownOptions;
use serveml::workers::executor::{self, Executor};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const PUBLIC_BASE_URL: &str = "https://api.serveml.dev";

/// Pickle protocol 4 header followed by some payload
pub const PICKLE_MODEL: &[u8] = &[0x80, 0x04, 0x95, 0x10, 0x00, 0x00, 0x00];

/// HDF5 signature
pub const H5_MODEL: &[u8] = &[0x89, b'H', b'D', b'F', 0x0d, 0x0a, 0x1a, 0x0a, 0x00];

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub backend: Arc<MemoryBuildBackend>,
    pub platform: Arc<MemoryComputePlatform>,
    pub executor: Arc<Executor>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,

    /// Present when the executor worker is not running
    pub commands: Option<mpsc::UnboundedReceiver<Command>>,

    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

pub struct HarnessOptions {
    pub run_executor: bool,
    pub max_deployments_per_owner: usize,
    pub auto_retry: bool,
    pub default_webhook: Option<String>,

    /// Replaces the in-memory record store
    pub store: Option<Arc<dyn DeploymentStore>>,

    /// Replaces the scripted build backend
    pub build_backend: Option<Arc<dyn BuildBackend>>,

    /// Shared with an earlier harness to survive a restart
    pub artifacts: Option<Arc<MemoryArtifactStore>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            run_executor: true,
            max_deployments_per_owner: 10,
            auto_retry: true,
            default_webhook: Some("http://hooks.test/all".to_string()),
            store: None,
            build_backend: None,
            artifacts: None,
        }
    }
}

/// Retry policy with millisecond backoff
pub fn fast_retry(auto_retry: bool) -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        auto_retry,
        backoff: CooldownOptions {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        },
    }
}

pub async fn harness() -> Harness {
    harness_with(HarnessOptions::default()).await
}

pub async fn harness_with(options: HarnessOptions) -> Harness {
    let store = options
        .store
        .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn DeploymentStore>);
    let artifacts = options
        .artifacts
        .unwrap_or_else(|| Arc::new(MemoryArtifactStore::new()));
    let backend = Arc::new(MemoryBuildBackend::new());
    let platform = Arc::new(MemoryComputePlatform::new(PUBLIC_BASE_URL));

    let dispatcher = Arc::new(BuildDispatcher::new(
        options
            .build_backend
            .unwrap_or_else(|| backend.clone() as Arc<dyn BuildBackend>),
        DispatcherOptions {
            registry: "registry.test".to_string(),
            repository: "models".to_string(),
            callback_url: "http://localhost:8080/callbacks/builds".to_string(),
        },
    ));
    let provisioner = Arc::new(ComputeProvisioner::new(
        platform.clone(),
        ProvisionerOptions {
            readiness_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    ));
    let validator = Arc::new(Validator::new(artifacts.clone(), ValidatorOptions::default()));

    let (notification_tx, notifications) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        artifacts.clone(),
        dispatcher,
        command_tx,
        Notifier::new(notification_tx, options.default_webhook),
        OrchestratorOptions {
            retry: fast_retry(options.auto_retry),
            max_deployments_per_owner: options.max_deployments_per_owner,
        },
    ));
    let executor = Arc::new(Executor::new(orchestrator.clone(), validator, provisioner));

    let (commands, shutdown, worker) = if options.run_executor {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let worker = tokio::spawn(executor::run(
            executor.clone(),
            command_rx,
            Box::pin(async move {
                let _ = shutdown_rx.await;
            }),
        ));
        (None, Some(shutdown_tx), Some(worker))
    } else {
        (Some(command_rx), None, None)
    };

    Harness {
        orchestrator,
        artifacts,
        backend,
        platform,
        executor,
        notifications,
        commands,
        shutdown,
        worker,
    }
}

impl Harness {
    /// Upload a scikit-learn pickle
    pub async fn sklearn_artifact(&self, filename: &str) -> String {
        self.artifacts
            .put(
                filename,
                PICKLE_MODEL.to_vec(),
                Some("scikit-learn==1.4.0\nnumpy==1.26.4\n".to_string()),
            )
            .await
            .unwrap()
    }

    pub async fn create(&self, owner_id: &str, artifact_ref: &str) -> Deployment {
        self.orchestrator
            .create_deployment(request(owner_id, artifact_ref))
            .await
            .unwrap()
    }

    /// Poll the record until `predicate` holds
    pub async fn wait_for<F>(&self, id: &str, predicate: F) -> Deployment
    where
        F: Fn(&Deployment) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let record = self.orchestrator.get_deployment(id).await.unwrap();
            if predicate(&record) {
                return record;
            }
            assert!(Instant::now() < deadline, "timed out waiting, last record: {:?}", record);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_status(&self, id: &str, status: DeploymentStatus) -> Deployment {
        self.wait_for(id, |r| r.status == status).await
    }

    /// Run every queued command in order, including the ones they emit
    pub async fn drain_commands(&mut self) -> Vec<Command> {
        let mut seen = Vec::new();
        let commands = self
            .commands
            .as_mut()
            .expect("executor worker is running");
        while let Ok(command) = commands.try_recv() {
            seen.push(command.clone());
            self.executor.execute(command).await;
        }
        seen
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(worker) = self.worker.take() {
            worker.await.unwrap();
        }
    }
}

pub fn request(owner_id: &str, artifact_ref: &str) -> CreateDeployment {
    CreateDeployment {
        owner_id: owner_id.to_string(),
        artifact_ref: artifact_ref.to_string(),
        ..Default::default()
    }
}
