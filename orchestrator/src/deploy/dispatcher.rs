//! Build dispatch
//!
//! The dispatcher owns build jobs: it starts them on a backend, keeps at
//! most one unfinished job per deployment and turns completion reports
//! (inline or via callback) into finished jobs exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use openapi_client::{WorkflowDispatchRequest, WorkflowInputs};
use tracing::{debug, info, warn};

use crate::errors::OrchestratorError;
use crate::http::client::HttpClient;
use crate::models::deployment::{BuildJob, BuildOutcome, Deployment, Framework};

/// Everything a backend needs to build one image
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub deployment_id: String,
    pub cycle: u64,
    pub attempt: u32,
    pub artifact_ref: String,
    pub framework: Framework,
    pub image_tag: String,
    pub callback_url: String,
}

/// Final result of a build
#[derive(Debug, Clone, PartialEq)]
pub enum BuildReport {
    Success {
        image_ref: String,
        log_ref: Option<String>,
    },
    Failure {
        error: String,
        transient: bool,
        log_ref: Option<String>,
    },
}

/// What a backend returns when asked to start a build
#[derive(Debug, Clone, PartialEq)]
pub enum BuildStart {
    /// Running remotely; completion arrives on the callback endpoint
    Pending { log_ref: Option<String> },

    /// Already finished
    Finished(BuildReport),
}

/// What the executor gets back from a dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// Running remotely; the callback reports the result
    Running(BuildJob),

    /// Finished inline; the caller records the result
    Finished(BuildJob),
}

impl Dispatched {
    pub fn job(&self) -> &BuildJob {
        match self {
            Dispatched::Running(job) | Dispatched::Finished(job) => job,
        }
    }
}

/// A system that builds and publishes serving images
#[async_trait]
pub trait BuildBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self, request: &BuildRequest) -> Result<BuildStart, OrchestratorError>;
}

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub registry: String,
    pub repository: String,

    /// Where remote builds report completion
    pub callback_url: String,
}

pub struct BuildDispatcher {
    backend: Arc<dyn BuildBackend>,
    options: DispatcherOptions,
    jobs: Mutex<HashMap<String, BuildJob>>,
}

impl BuildDispatcher {
    pub fn new(backend: Arc<dyn BuildBackend>, options: DispatcherOptions) -> Self {
        Self {
            backend,
            options,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// `{registry}/{repository}:{id}-v{version}-a{attempt}`
    pub fn image_tag(&self, deployment: &Deployment, attempt: u32) -> String {
        format!(
            "{}/{}:{}-v{}-a{}",
            self.options.registry.trim_end_matches('/'),
            self.options.repository,
            deployment.id,
            deployment.target_version(),
            attempt
        )
    }

    fn lock_jobs(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, BuildJob>>, OrchestratorError> {
        self.jobs
            .lock()
            .map_err(|_| OrchestratorError::Internal("build job table poisoned".to_string()))
    }

    /// Start a build for the deployment's current cycle.
    ///
    /// Fails with `BuildInProgress` while an unfinished job of the same cycle
    /// exists. Only a `Finished` result is for the caller to record; a
    /// `Running` job reports through the callback, which may land before
    /// the backend returns.
    pub async fn dispatch(
        &self,
        deployment: &Deployment,
        attempt: u32,
    ) -> Result<Dispatched, OrchestratorError> {
        let framework = deployment.framework.ok_or_else(|| {
            OrchestratorError::Internal(format!(
                "deployment {} has no framework yet",
                deployment.id
            ))
        })?;

        let request = BuildRequest {
            deployment_id: deployment.id.clone(),
            cycle: deployment.cycle,
            attempt,
            artifact_ref: deployment.target_artifact_ref().to_string(),
            framework,
            image_tag: self.image_tag(deployment, attempt),
            callback_url: self.options.callback_url.clone(),
        };

        let mut job = BuildJob {
            deployment_id: deployment.id.clone(),
            attempt_number: attempt,
            cycle: deployment.cycle,
            image_tag: request.image_tag.clone(),
            image_ref: None,
            outcome: BuildOutcome::Pending,
            error: None,
            transient: false,
            log_ref: None,
            started_at: Utc::now(),
        };

        {
            let mut jobs = self.lock_jobs()?;
            if let Some(existing) = jobs.get(&deployment.id) {
                if !existing.is_finished() && existing.cycle == deployment.cycle {
                    return Err(OrchestratorError::BuildInProgress(deployment.id.clone()));
                }
                if !existing.is_finished() {
                    debug!(
                        deployment_id = %deployment.id,
                        cycle = existing.cycle,
                        "Superseding build job of an abandoned cycle"
                    );
                }
            }
            jobs.insert(deployment.id.clone(), job.clone());
        }

        info!(
            deployment_id = %deployment.id,
            attempt,
            backend = self.backend.name(),
            image_tag = %request.image_tag,
            "Dispatching build"
        );

        match self.backend.start(&request).await {
            Ok(BuildStart::Pending { log_ref }) => {
                let mut jobs = self.lock_jobs()?;
                if let Some(stored) = jobs.get_mut(&deployment.id) {
                    if stored.attempt_number == attempt
                        && stored.cycle == deployment.cycle
                        && stored.log_ref.is_none()
                    {
                        stored.log_ref = log_ref.clone();
                    }
                }
                job.log_ref = log_ref;
                Ok(Dispatched::Running(job))
            }
            Ok(BuildStart::Finished(report)) => self
                .complete(&deployment.id, Some(deployment.cycle), attempt, report)?
                .map(Dispatched::Finished)
                .ok_or_else(|| {
                    OrchestratorError::Internal(format!(
                        "build job {} completed twice",
                        deployment.id
                    ))
                }),
            Err(e) => {
                // the attempt never started; free the slot
                let mut jobs = self.lock_jobs()?;
                if jobs
                    .get(&deployment.id)
                    .map(|j| j.attempt_number == attempt && j.cycle == deployment.cycle)
                    .unwrap_or(false)
                {
                    jobs.remove(&deployment.id);
                }
                Err(e)
            }
        }
    }

    /// Record the completion of an attempt.
    ///
    /// Returns `None` for duplicates, for attempts that are not the current
    /// job of the deployment and for jobs this process never started. A
    /// `cycle` of `None` matches any cycle.
    pub fn complete(
        &self,
        deployment_id: &str,
        cycle: Option<u64>,
        attempt: u32,
        report: BuildReport,
    ) -> Result<Option<BuildJob>, OrchestratorError> {
        let mut jobs = self.lock_jobs()?;
        let job = match jobs.get_mut(deployment_id) {
            Some(job)
                if job.attempt_number == attempt
                    && !job.is_finished()
                    && cycle.is_none_or(|c| c == job.cycle) =>
            {
                job
            }
            _ => {
                debug!(deployment_id, attempt, "Ignoring duplicate or unknown build report");
                return Ok(None);
            }
        };

        match report {
            BuildReport::Success { image_ref, log_ref } => {
                job.outcome = BuildOutcome::Success;
                job.image_ref = Some(image_ref);
                job.log_ref = log_ref.or(job.log_ref.take());
            }
            BuildReport::Failure {
                error,
                transient,
                log_ref,
            } => {
                job.outcome = BuildOutcome::Failure;
                job.error = Some(error);
                job.transient = transient;
                job.log_ref = log_ref.or(job.log_ref.take());
            }
        }
        Ok(Some(job.clone()))
    }

    /// Latest job of a deployment
    pub fn job(&self, deployment_id: &str) -> Result<Option<BuildJob>, OrchestratorError> {
        Ok(self.lock_jobs()?.get(deployment_id).cloned())
    }

    /// Forget a deployment's job; later reports for it are ignored
    pub fn release(&self, deployment_id: &str) -> Result<(), OrchestratorError> {
        if self.lock_jobs()?.remove(deployment_id).is_some() {
            debug!(deployment_id, "Released build job");
        }
        Ok(())
    }
}

/// Classify a build failure message
pub fn is_transient_failure(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "toomanyrequests",
        "too many requests",
        "rate limit",
        "throttl",
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "temporary failure",
        "service unavailable",
        "503",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

// ================================= WORKFLOW ====================================== //

/// Builds on a CI system through a workflow dispatch
pub struct WorkflowBuildBackend {
    client: HttpClient,
    git_ref: String,
}

impl WorkflowBuildBackend {
    pub fn new(client: HttpClient, git_ref: impl Into<String>) -> Self {
        Self {
            client,
            git_ref: git_ref.into(),
        }
    }
}

#[async_trait]
impl BuildBackend for WorkflowBuildBackend {
    fn name(&self) -> &'static str {
        "workflow"
    }

    async fn start(&self, request: &BuildRequest) -> Result<BuildStart, OrchestratorError> {
        let body = WorkflowDispatchRequest {
            git_ref: self.git_ref.clone(),
            inputs: WorkflowInputs {
                deployment_id: request.deployment_id.clone(),
                attempt_number: request.attempt.to_string(),
                cycle: request.cycle.to_string(),
                artifact_ref: request.artifact_ref.clone(),
                framework: request.framework.to_string(),
                image_tag: request.image_tag.clone(),
                callback_url: request.callback_url.clone(),
            },
        };
        self.client.dispatch_workflow(&body).await?;
        Ok(BuildStart::Pending { log_ref: None })
    }
}

// ================================== MEMORY ======================================= //

/// Scripted outcome of the next memory build
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedBuild {
    /// Publish the requested tag
    Succeed,

    /// Publish under a specific image reference
    SucceedWith(String),

    Fail { error: String, transient: bool },

    /// The backend itself errors before the build starts
    Unavailable { error: String },

    /// Stay pending until a callback arrives
    Defer,
}

/// Build backend with scripted outcomes, used for tests and local runs.
/// Builds succeed once the script is exhausted.
#[derive(Debug, Default)]
pub struct MemoryBuildBackend {
    script: Mutex<VecDeque<ScriptedBuild>>,
    requests: Mutex<Vec<BuildRequest>>,
}

impl MemoryBuildBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of a future build
    pub fn push(&self, outcome: ScriptedBuild) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    /// Requests seen so far
    pub fn requests(&self) -> Vec<BuildRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BuildBackend for MemoryBuildBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn start(&self, request: &BuildRequest) -> Result<BuildStart, OrchestratorError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .script
            .lock()
            .map_err(|_| OrchestratorError::Internal("build script poisoned".to_string()))?
            .pop_front()
            .unwrap_or(ScriptedBuild::Succeed);

        match next {
            ScriptedBuild::Succeed => Ok(BuildStart::Finished(BuildReport::Success {
                image_ref: request.image_tag.clone(),
                log_ref: None,
            })),
            ScriptedBuild::SucceedWith(image_ref) => {
                Ok(BuildStart::Finished(BuildReport::Success {
                    image_ref,
                    log_ref: None,
                }))
            }
            ScriptedBuild::Fail { error, transient } => {
                Ok(BuildStart::Finished(BuildReport::Failure {
                    error,
                    transient,
                    log_ref: None,
                }))
            }
            ScriptedBuild::Unavailable { error } => {
                warn!(deployment_id = %request.deployment_id, "Scripted build backend outage");
                Err(OrchestratorError::Transient(error))
            }
            ScriptedBuild::Defer => Ok(BuildStart::Pending { log_ref: None }),
        }
    }
}
