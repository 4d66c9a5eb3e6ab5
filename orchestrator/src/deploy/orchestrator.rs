//! Deployment orchestrator
//!
//! The only writer of deployment records. Every status change goes through
//! the transition table and a compare-and-swap on `transition_version`.
//! Work for collaborators is handed to the executor as [`Command`]s, so the
//! public operations return as soon as the first transition is persisted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use openapi_client::{BuildCallback, BuildCallbackOutcome};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::deploy::dispatcher::{is_transient_failure, BuildDispatcher, BuildReport};
use crate::deploy::fsm::{self, DeploymentEvent, FollowUp, RetryPolicy};
use crate::deploy::notifier::Notifier;
use crate::errors::OrchestratorError;
use crate::models::deployment::{BuildJob, BuildOutcome, Deployment, DeploymentStatus};
use crate::storage::artifacts::{ArtifactMeta, ArtifactStore};
use crate::storage::records::{DeploymentFilter, DeploymentStore};
use crate::utils::generate_deployment_id;

/// Re-derivations attempted after losing a compare-and-swap race
const MAX_REDERIVE: usize = 8;

/// Collaborator work emitted by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate the artifact of a fresh record
    Validate { deployment_id: String, cycle: u64 },

    Build {
        deployment_id: String,
        cycle: u64,
        attempt: u32,
        delay: Duration,
        validate_first: bool,
    },

    Provision {
        deployment_id: String,
        cycle: u64,
        delay: Duration,
    },

    /// Remove compute resources of a deleted deployment
    Teardown { deployment_id: String },
}

impl Command {
    pub fn deployment_id(&self) -> &str {
        match self {
            Command::Validate { deployment_id, .. }
            | Command::Build { deployment_id, .. }
            | Command::Provision { deployment_id, .. }
            | Command::Teardown { deployment_id } => deployment_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Validate { .. } => "validate",
            Command::Build { .. } => "build",
            Command::Provision { .. } => "provision",
            Command::Teardown { .. } => "teardown",
        }
    }
}

/// Parameters of a new deployment
#[derive(Debug, Clone, Default)]
pub struct CreateDeployment {
    pub owner_id: String,
    pub artifact_ref: String,

    /// Defaults to the model file name
    pub name: Option<String>,

    pub idempotency_key: Option<String>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub retry: RetryPolicy,

    /// Non-deleted deployments an owner may hold; 0 disables the check
    pub max_deployments_per_owner: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_deployments_per_owner: 10,
        }
    }
}

/// What happened to a collaborator report
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Applied(Deployment),

    /// The record moved on to another cycle or was deleted
    Discarded(Deployment),
}

/// Work done by one sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepSummary {
    pub timed_out: usize,
    pub teardowns: usize,
}

pub struct Orchestrator {
    store: Arc<dyn DeploymentStore>,
    artifacts: Arc<dyn ArtifactStore>,
    dispatcher: Arc<BuildDispatcher>,
    commands: mpsc::UnboundedSender<Command>,
    notifier: Notifier,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        artifacts: Arc<dyn ArtifactStore>,
        dispatcher: Arc<BuildDispatcher>,
        commands: mpsc::UnboundedSender<Command>,
        notifier: Notifier,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            store,
            artifacts,
            dispatcher,
            commands,
            notifier,
            options,
        }
    }

    pub fn dispatcher(&self) -> &Arc<BuildDispatcher> {
        &self.dispatcher
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.options.retry
    }

    // ================================ CALLERS ==================================== //

    /// Persist a `pending` record and start validation.
    ///
    /// Replaying an idempotency key with the same artifact returns the
    /// existing record and starts nothing.
    pub async fn create_deployment(
        &self,
        request: CreateDeployment,
    ) -> Result<Deployment, OrchestratorError> {
        if request.owner_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "owner_id is required".to_string(),
            ));
        }
        if let Some(webhook_url) = &request.webhook_url {
            check_webhook_url(webhook_url)?;
        }

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self
                .store
                .find_by_idempotency_key(&request.owner_id, key)
                .await?
            {
                return replay(existing, &request.artifact_ref);
            }
        }

        let meta = self.resolve_artifact(&request.artifact_ref).await?;
        self.check_quota(&request.owner_id).await?;

        let name = request
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(meta.filename);
        let mut record = Deployment::new(
            generate_deployment_id(),
            request.owner_id,
            name,
            request.artifact_ref,
            Utc::now(),
        );
        record.idempotency_key = request.idempotency_key;
        record.webhook_url = request.webhook_url;

        let stored = match self.store.insert(&record).await {
            Ok(stored) => stored,
            Err(OrchestratorError::IdempotencyConflict(key)) => {
                // a concurrent create with the same key won the insert
                return match self
                    .store
                    .find_by_idempotency_key(&record.owner_id, &key)
                    .await?
                {
                    Some(existing) => replay(existing, &record.artifact_ref),
                    None => Err(OrchestratorError::IdempotencyConflict(key)),
                };
            }
            Err(e) => return Err(e),
        };

        info!(
            deployment_id = %stored.id,
            owner_id = %stored.owner_id,
            artifact_ref = %stored.artifact_ref,
            "Created deployment"
        );
        self.notifier.notify(&stored);
        self.emit(Command::Validate {
            deployment_id: stored.id.clone(),
            cycle: stored.cycle,
        });
        Ok(stored)
    }

    pub async fn get_deployment(&self, id: &str) -> Result<Deployment, OrchestratorError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("deployment {}", id)))
    }

    pub async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> Result<Vec<Deployment>, OrchestratorError> {
        self.store.list(filter).await
    }

    /// Records matching `filter`, ignoring its page
    pub async fn count_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> Result<usize, OrchestratorError> {
        let unpaged = DeploymentFilter {
            limit: None,
            offset: None,
            ..filter.clone()
        };
        Ok(self.store.list(&unpaged).await?.len())
    }

    /// Move the record to `deleted` and schedule teardown.
    ///
    /// Deleting a deleted record returns it unchanged.
    pub async fn delete_deployment(&self, id: &str) -> Result<Deployment, OrchestratorError> {
        for _ in 0..MAX_REDERIVE {
            let current = self.get_deployment(id).await?;
            if current.status == DeploymentStatus::Deleted {
                return Ok(current);
            }
            match self.apply(current, &DeploymentEvent::DeleteRequested).await {
                Err(OrchestratorError::StaleTransition(_)) => continue,
                other => return other,
            }
        }
        Err(contended(id))
    }

    /// Start a new cycle with another artifact. The current route keeps
    /// serving until the new version is confirmed.
    pub async fn redeploy(
        &self,
        id: &str,
        artifact_ref: &str,
    ) -> Result<Deployment, OrchestratorError> {
        self.resolve_artifact(artifact_ref).await?;
        let event = DeploymentEvent::RedeployRequested {
            artifact_ref: artifact_ref.to_string(),
        };
        for _ in 0..MAX_REDERIVE {
            let current = self.get_deployment(id).await?;
            match self.apply(current, &event).await {
                Err(OrchestratorError::StaleTransition(_)) => continue,
                other => return other,
            }
        }
        Err(contended(id))
    }

    // ============================= COLLABORATORS ================================= //

    /// Apply one event to the stored record.
    ///
    /// Fails with `StaleTransition` when another writer got there first; the
    /// caller re-reads and re-derives. Events against a deleted record are
    /// no-ops.
    pub async fn advance_state(
        &self,
        id: &str,
        event: DeploymentEvent,
    ) -> Result<Deployment, OrchestratorError> {
        let current = self.get_deployment(id).await?;
        if current.status == DeploymentStatus::Deleted {
            debug!(deployment_id = id, event = event.name(), "Ignoring event for deleted deployment");
            return Ok(current);
        }
        self.apply(current, &event).await
    }

    /// Apply a collaborator's result for `cycle`, re-deriving on lost races.
    ///
    /// Results for an older cycle, or for a record that already ended its
    /// cycle in `failed` or `deleted`, are discarded. So are build results
    /// for any attempt but the one the record waits on, which makes a
    /// repeated build report count once.
    pub async fn apply_report(
        &self,
        id: &str,
        cycle: u64,
        event: DeploymentEvent,
    ) -> Result<Report, OrchestratorError> {
        for _ in 0..MAX_REDERIVE {
            let current = self.get_deployment(id).await?;
            if current.status.is_terminal() || current.cycle != cycle {
                info!(
                    deployment_id = id,
                    event = event.name(),
                    report_cycle = cycle,
                    current_cycle = current.cycle,
                    status = %current.status,
                    "Discarding stale report"
                );
                return Ok(Report::Discarded(current));
            }
            if let Some(attempt) = event.reported_attempt() {
                if current.build_attempt() != Some(attempt) {
                    info!(
                        deployment_id = id,
                        event = event.name(),
                        attempt,
                        waiting_on = ?current.build_attempt(),
                        status = %current.status,
                        "Discarding report for a settled build attempt"
                    );
                    return Ok(Report::Discarded(current));
                }
            }
            match self.apply(current, &event).await {
                Ok(record) => return Ok(Report::Applied(record)),
                Err(OrchestratorError::StaleTransition(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(contended(id))
    }

    /// Turn a build job finished inline into a record event
    pub async fn record_build(&self, job: &BuildJob) -> Result<Report, OrchestratorError> {
        let event = match job.outcome {
            BuildOutcome::Success => DeploymentEvent::BuildSuccess {
                attempt: job.attempt_number,
                image_ref: job
                    .image_ref
                    .clone()
                    .unwrap_or_else(|| job.image_tag.clone()),
            },
            BuildOutcome::Failure => DeploymentEvent::BuildFailure {
                attempt: job.attempt_number,
                error: job
                    .error
                    .clone()
                    .unwrap_or_else(|| "build failed".to_string()),
                transient: job.transient,
            },
            BuildOutcome::Pending => {
                return Err(OrchestratorError::Internal(format!(
                    "build job {} attempt {} has not finished",
                    job.deployment_id, job.attempt_number
                )))
            }
        };
        self.apply_report(&job.deployment_id, job.cycle, event).await
    }

    /// Handle a build system callback. Returns whether it changed the record;
    /// duplicates and results for abandoned cycles do not.
    ///
    /// The record decides: a callback for a job this process never started
    /// (it was restarted meanwhile) applies as long as the record still
    /// waits on that attempt.
    pub async fn handle_build_callback(
        &self,
        callback: BuildCallback,
    ) -> Result<bool, OrchestratorError> {
        let report = match callback.outcome {
            BuildCallbackOutcome::Success => BuildReport::Success {
                image_ref: callback.image_ref.ok_or_else(|| {
                    OrchestratorError::InvalidRequest(
                        "success callback without image_ref".to_string(),
                    )
                })?,
                log_ref: callback.log_ref,
            },
            BuildCallbackOutcome::Failure => {
                let error = callback
                    .error
                    .unwrap_or_else(|| "build failed".to_string());
                BuildReport::Failure {
                    transient: callback
                        .transient
                        .unwrap_or_else(|| is_transient_failure(&error)),
                    error,
                    log_ref: callback.log_ref,
                }
            }
        };

        let attempt = callback.attempt_number;
        let completed = self.dispatcher.complete(
            &callback.deployment_id,
            callback.cycle,
            attempt,
            report.clone(),
        )?;
        let cycle = match (completed, callback.cycle) {
            (Some(job), _) => job.cycle,
            (None, Some(cycle)) => cycle,
            (None, None) => self.get_deployment(&callback.deployment_id).await?.cycle,
        };

        let event = match report {
            BuildReport::Success { image_ref, .. } => DeploymentEvent::BuildSuccess {
                attempt,
                image_ref,
            },
            BuildReport::Failure {
                error, transient, ..
            } => DeploymentEvent::BuildFailure {
                attempt,
                error,
                transient,
            },
        };
        match self.apply_report(&callback.deployment_id, cycle, event).await {
            Ok(Report::Applied(_)) => Ok(true),
            Ok(Report::Discarded(_)) => Ok(false),
            // already logged; the record keeps its state
            Err(OrchestratorError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Clear `teardown_pending` once compute resources are gone
    pub async fn complete_teardown(&self, id: &str) -> Result<Deployment, OrchestratorError> {
        for _ in 0..MAX_REDERIVE {
            let current = self.get_deployment(id).await?;
            if !current.teardown_pending {
                return Ok(current);
            }
            let mut next = current.clone();
            next.teardown_pending = false;
            next.previous_endpoint_ref = None;
            next.updated_at = Utc::now();
            match self
                .store
                .compare_and_swap(&next, current.transition_version)
                .await
            {
                Ok(stored) => {
                    info!(deployment_id = id, "Teardown complete");
                    return Ok(stored);
                }
                Err(OrchestratorError::StaleTransition(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(contended(id))
    }

    /// Schedule another teardown of a deployment's compute resources
    pub fn request_teardown(&self, id: &str) {
        self.emit(Command::Teardown {
            deployment_id: id.to_string(),
        });
    }

    /// Re-issue the collaborator work of every in-flight record and every
    /// pending teardown. Commands queued before a restart are gone; the
    /// records are not. Returns the number of commands issued.
    pub async fn resume_in_flight(&self) -> Result<usize, OrchestratorError> {
        let mut resumed = 0;
        for record in self.store.list(&in_flight()).await? {
            let deployment_id = record.id.clone();
            let command = match record.status {
                DeploymentStatus::Pending => Command::Validate {
                    deployment_id,
                    cycle: record.cycle,
                },
                DeploymentStatus::Validating => Command::Build {
                    deployment_id,
                    cycle: record.cycle,
                    attempt: 1,
                    delay: Duration::ZERO,
                    validate_first: record.pending_artifact_ref.is_some(),
                },
                DeploymentStatus::Building => Command::Build {
                    deployment_id,
                    cycle: record.cycle,
                    attempt: record.retry_count + 1,
                    delay: Duration::ZERO,
                    validate_first: false,
                },
                DeploymentStatus::Deploying => Command::Provision {
                    deployment_id,
                    cycle: record.cycle,
                    delay: Duration::ZERO,
                },
                _ => continue,
            };
            info!(
                deployment_id = %record.id,
                status = %record.status,
                command = command.name(),
                "Resuming deployment"
            );
            self.emit(command);
            resumed += 1;
        }

        let deleted = DeploymentFilter::new().status(DeploymentStatus::Deleted);
        for record in self.store.list(&deleted).await? {
            if record.teardown_pending {
                self.request_teardown(&record.id);
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Fail records stuck in a non-terminal state for longer than `timeout`
    /// and retry pending teardowns.
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<SweepSummary, OrchestratorError> {
        let mut summary = SweepSummary::default();

        for record in self.store.list(&in_flight()).await? {
            if !expired(&record, now, timeout) {
                continue;
            }
            match self.expire(&record.id, now, timeout).await {
                Ok(true) => summary.timed_out += 1,
                Ok(false) => {}
                Err(e) => warn!(deployment_id = %record.id, error = %e, "Failed to time out deployment"),
            }
        }

        let deleted = DeploymentFilter::new().status(DeploymentStatus::Deleted);
        for record in self.store.list(&deleted).await? {
            if record.teardown_pending {
                self.request_teardown(&record.id);
                summary.teardowns += 1;
            }
        }

        if summary != SweepSummary::default() {
            info!(
                timed_out = summary.timed_out,
                teardowns = summary.teardowns,
                "Sweep finished"
            );
        }
        Ok(summary)
    }

    // ================================ INTERNAL =================================== //

    /// Transition, check, persist, then notify and schedule follow-up work
    async fn apply(
        &self,
        current: Deployment,
        event: &DeploymentEvent,
    ) -> Result<Deployment, OrchestratorError> {
        let transition = match fsm::transition(&current, event, &self.options.retry, Utc::now()) {
            Ok(transition) => transition,
            Err(e) if event.is_caller_request() => {
                warn!(
                    deployment_id = %current.id,
                    status = %current.status,
                    event = event.name(),
                    "Refused request: {}",
                    e
                );
                return Err(e);
            }
            Err(e) => {
                error!(
                    deployment_id = %current.id,
                    status = %current.status,
                    event = event.name(),
                    "Rejected transition: {}",
                    e
                );
                return Err(e);
            }
        };
        transition.record.check_invariants()?;

        let stored = self
            .store
            .compare_and_swap(&transition.record, current.transition_version)
            .await?;

        info!(
            deployment_id = %stored.id,
            from = %current.status,
            to = %stored.status,
            event = event.name(),
            version = stored.version,
            retry_count = stored.retry_count,
            "Deployment transitioned"
        );
        if stored.status != current.status {
            self.notifier.notify(&stored);
        }
        self.schedule(&stored, transition.follow_up);
        Ok(stored)
    }

    fn schedule(&self, record: &Deployment, follow_up: FollowUp) {
        let command = match follow_up {
            FollowUp::Nothing => return,
            FollowUp::Build {
                attempt,
                delay,
                validate_first,
            } => Command::Build {
                deployment_id: record.id.clone(),
                cycle: record.cycle,
                attempt,
                delay,
                validate_first,
            },
            FollowUp::Provision { delay } => Command::Provision {
                deployment_id: record.id.clone(),
                cycle: record.cycle,
                delay,
            },
            FollowUp::Teardown => Command::Teardown {
                deployment_id: record.id.clone(),
            },
        };
        self.emit(command);
    }

    fn emit(&self, command: Command) {
        debug!(deployment_id = command.deployment_id(), command = command.name(), "Scheduling");
        if self.commands.send(command).is_err() {
            warn!("Executor is gone, dropping command");
        }
    }

    async fn resolve_artifact(&self, artifact_ref: &str) -> Result<ArtifactMeta, OrchestratorError> {
        match self.artifacts.head(artifact_ref).await {
            Err(OrchestratorError::NotFound(_)) => Err(OrchestratorError::InvalidArtifact(
                format!("artifact {} cannot be resolved", artifact_ref),
            )),
            other => other,
        }
    }

    async fn check_quota(&self, owner_id: &str) -> Result<(), OrchestratorError> {
        let limit = self.options.max_deployments_per_owner;
        if limit == 0 {
            return Ok(());
        }
        let owned = self
            .store
            .list(&DeploymentFilter::new().owner(owner_id))
            .await?;
        let live = owned
            .iter()
            .filter(|d| d.status != DeploymentStatus::Deleted)
            .count();
        if live >= limit {
            return Err(OrchestratorError::QuotaExceeded {
                owner_id: owner_id.to_string(),
                limit,
            });
        }
        Ok(())
    }

    /// Time out one record, re-checking its age after every re-read
    async fn expire(
        &self,
        id: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<bool, OrchestratorError> {
        for _ in 0..MAX_REDERIVE {
            let current = self.get_deployment(id).await?;
            if !current.status.is_in_flight() || !expired(&current, now, timeout) {
                return Ok(false);
            }
            warn!(deployment_id = id, status = %current.status, "Deployment timed out");
            match self
                .apply(current, &DeploymentEvent::TimedOut { after: timeout })
                .await
            {
                Ok(_) => return Ok(true),
                Err(OrchestratorError::StaleTransition(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(contended(id))
    }
}

fn replay(existing: Deployment, artifact_ref: &str) -> Result<Deployment, OrchestratorError> {
    if existing.artifact_ref == artifact_ref {
        debug!(deployment_id = %existing.id, "Replayed idempotent create");
        Ok(existing)
    } else {
        Err(OrchestratorError::IdempotencyConflict(format!(
            "key already used by deployment {} with another artifact",
            existing.id
        )))
    }
}

fn check_webhook_url(value: &str) -> Result<(), OrchestratorError> {
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(OrchestratorError::InvalidRequest(format!(
            "webhook_url {} is not an http(s) URL",
            value
        ))),
    }
}

/// Records with a cycle under way
fn in_flight() -> DeploymentFilter {
    DeploymentFilter::new()
        .status(DeploymentStatus::Pending)
        .status(DeploymentStatus::Validating)
        .status(DeploymentStatus::Building)
        .status(DeploymentStatus::Deploying)
}

fn expired(record: &Deployment, now: DateTime<Utc>, timeout: Duration) -> bool {
    let age = now.signed_duration_since(record.updated_at);
    age.to_std().map(|age| age > timeout).unwrap_or(false)
}

fn contended(id: &str) -> OrchestratorError {
    OrchestratorError::StaleTransition(format!(
        "deployment {} kept changing, gave up after {} attempts",
        id, MAX_REDERIVE
    ))
}
