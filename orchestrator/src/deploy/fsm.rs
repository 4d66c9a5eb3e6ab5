//! Finite State Machine for the deployment lifecycle
//!
//! The table is pure: it takes the current record and an event and returns
//! the next record together with the follow-up work the orchestrator has to
//! schedule. Persisting the result is the orchestrator's job.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::errors::OrchestratorError;
use crate::models::deployment::{Deployment, DeploymentStatus, EndpointRef, Framework};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Retry policy for transient build and provision failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Failures allowed per transition before the cycle fails
    pub max_attempts: u32,

    /// Retry transient failures automatically. When off every failure is
    /// terminal and recovery is a manual redeploy.
    pub auto_retry: bool,

    pub backoff: CooldownOptions,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            auto_retry: true,
            backoff: CooldownOptions {
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
            },
        }
    }
}

impl RetryPolicy {
    /// Whether the `failures`-th failure of a transition is retried
    pub fn should_retry(&self, transient: bool, failures: u32) -> bool {
        self.auto_retry && transient && failures < self.max_attempts
    }

    /// Delay before the retry that follows the `failures`-th failure
    pub fn delay(&self, failures: u32) -> Duration {
        calc_exp_backoff(&self.backoff, failures.saturating_sub(1))
    }
}

/// Event applied to a deployment record
#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentEvent {
    /// Artifact and manifest accepted
    ValidateOk { framework: Framework },

    /// Artifact rejected; also the outcome of validation during redeploy
    ValidateFail { error: String },

    /// Build job started for the cycle
    BuildTriggered { attempt: u32 },

    /// Image published
    BuildSuccess { attempt: u32, image_ref: String },

    BuildFailure {
        attempt: u32,
        error: String,
        transient: bool,
    },

    /// Function ready and route pointing at it
    ProvisionSuccess { endpoint: EndpointRef },

    ProvisionFailure { error: String, transient: bool },

    /// Start a new cycle with another artifact
    RedeployRequested { artifact_ref: String },

    DeleteRequested,

    /// Record sat in a non-terminal state for too long
    TimedOut { after: Duration },
}

impl DeploymentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DeploymentEvent::ValidateOk { .. } => "validate_ok",
            DeploymentEvent::ValidateFail { .. } => "validate_fail",
            DeploymentEvent::BuildTriggered { .. } => "build_triggered",
            DeploymentEvent::BuildSuccess { .. } => "build_success",
            DeploymentEvent::BuildFailure { .. } => "build_failure",
            DeploymentEvent::ProvisionSuccess { .. } => "provision_success",
            DeploymentEvent::ProvisionFailure { .. } => "provision_failure",
            DeploymentEvent::RedeployRequested { .. } => "redeploy_requested",
            DeploymentEvent::DeleteRequested => "delete_requested",
            DeploymentEvent::TimedOut { .. } => "timed_out",
        }
    }

    /// Attempt a build report is about
    pub fn reported_attempt(&self) -> Option<u32> {
        match self {
            DeploymentEvent::BuildSuccess { attempt, .. }
            | DeploymentEvent::BuildFailure { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }

    /// Sent on behalf of a caller rather than a collaborator
    pub fn is_caller_request(&self) -> bool {
        matches!(
            self,
            DeploymentEvent::RedeployRequested { .. } | DeploymentEvent::DeleteRequested
        )
    }
}

/// Work scheduled as a consequence of a transition
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUp {
    Nothing,

    /// Dispatch a build. `validate_first` re-runs validation against the
    /// new artifact of a redeploy before dispatching.
    Build {
        attempt: u32,
        delay: Duration,
        validate_first: bool,
    },

    /// Provision the published image
    Provision { delay: Duration },

    /// Remove compute resources of the deployment
    Teardown,
}

/// Result of applying an event
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub record: Deployment,
    pub follow_up: FollowUp,
}

impl Transition {
    fn to(record: Deployment, follow_up: FollowUp) -> Self {
        Self { record, follow_up }
    }
}

/// Apply `event` to `current`.
///
/// Returns `InvalidTransition` when the table has no entry for the pair; the
/// caller must leave the stored record untouched in that case.
pub fn transition(
    current: &Deployment,
    event: &DeploymentEvent,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Transition, OrchestratorError> {
    use DeploymentEvent as E;
    use DeploymentStatus as S;

    let mut next = current.clone();
    next.updated_at = now;

    let follow_up = match (current.status, event) {
        // From Pending
        (S::Pending, E::ValidateOk { framework }) => {
            if next.framework.is_none() {
                next.framework = Some(*framework);
            }
            enter(&mut next, S::Validating);
            FollowUp::Build {
                attempt: 1,
                delay: Duration::ZERO,
                validate_first: false,
            }
        }

        // From Validating
        (S::Validating, E::BuildTriggered { attempt: 1 }) => {
            enter(&mut next, S::Building);
            FollowUp::Nothing
        }

        // From Building
        (S::Building, E::BuildSuccess { image_ref, .. }) => {
            next.image_ref = Some(image_ref.clone());
            enter(&mut next, S::Deploying);
            FollowUp::Provision {
                delay: Duration::ZERO,
            }
        }
        (
            S::Building,
            E::BuildFailure {
                error, transient, ..
            },
        ) => {
            let failures = current.retry_count + 1;
            next.retry_count = failures;
            if policy.should_retry(*transient, failures) {
                FollowUp::Build {
                    attempt: failures + 1,
                    delay: policy.delay(failures),
                    validate_first: false,
                }
            } else {
                fail(&mut next, format!("build failed: {}", error));
                FollowUp::Nothing
            }
        }

        // From Deploying
        (S::Deploying, E::ProvisionSuccess { endpoint }) => {
            if let Some(artifact_ref) = next.pending_artifact_ref.take() {
                next.artifact_ref = artifact_ref;
            }
            next.previous_endpoint_ref = None;
            next.endpoint_ref = Some(endpoint.clone());
            next.version += 1;
            enter(&mut next, S::Active);
            FollowUp::Nothing
        }
        (S::Deploying, E::ProvisionFailure { error, transient }) => {
            let failures = current.retry_count + 1;
            next.retry_count = failures;
            if policy.should_retry(*transient, failures) {
                FollowUp::Provision {
                    delay: policy.delay(failures),
                }
            } else {
                fail(&mut next, format!("provisioning failed: {}", error));
                FollowUp::Nothing
            }
        }

        // Redeploy from Active or Failed
        (S::Active | S::Failed, E::RedeployRequested { artifact_ref }) => {
            if let Some(serving) = next.endpoint_ref.take() {
                next.previous_endpoint_ref = Some(serving);
            }
            next.pending_artifact_ref = Some(artifact_ref.clone());
            next.image_ref = None;
            next.cycle += 1;
            enter(&mut next, S::Validating);
            FollowUp::Build {
                attempt: 1,
                delay: Duration::ZERO,
                validate_first: true,
            }
        }

        // Any non-terminal state
        (status, E::ValidateFail { error }) if !status.is_terminal() => {
            fail(&mut next, error.clone());
            FollowUp::Nothing
        }
        (status, E::TimedOut { after }) if !status.is_terminal() => {
            fail(
                &mut next,
                format!("timed out after {}s in {}", after.as_secs(), status),
            );
            FollowUp::Nothing
        }
        (status, E::DeleteRequested) if status != S::Deleted => {
            if let Some(serving) = next.endpoint_ref.take() {
                next.previous_endpoint_ref = Some(serving);
            }
            next.pending_artifact_ref = None;
            next.teardown_pending = true;
            next.status = S::Deleted;
            next.error = None;
            next.retry_count = 0;
            FollowUp::Teardown
        }

        // Invalid transitions
        (status, event) => {
            return Err(OrchestratorError::InvalidTransition {
                status: status.as_str(),
                event: event.name(),
            });
        }
    };

    Ok(Transition::to(next, follow_up))
}

/// Move into a new non-terminal state
fn enter(record: &mut Deployment, status: DeploymentStatus) {
    record.status = status;
    record.retry_count = 0;
    record.error = None;
}

/// End the cycle. `retry_count` keeps the number of failures seen.
fn fail(record: &mut Deployment, error: String) {
    if let Some(serving) = record.endpoint_ref.take() {
        record.previous_endpoint_ref = Some(serving);
    }
    record.pending_artifact_ref = None;
    record.status = DeploymentStatus::Failed;
    record.error = Some(error);
}
