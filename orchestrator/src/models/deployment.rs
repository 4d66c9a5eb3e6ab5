//! Deployment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;

/// Lifecycle status of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Record persisted, validation not finished
    Pending,

    /// Artifact accepted, build about to be triggered
    Validating,

    /// Build job in flight
    Building,

    /// Image published, compute being provisioned
    Deploying,

    /// Serving traffic
    Active,

    /// Terminal for the current cycle; re-enterable via redeploy
    Failed,

    /// Soft-deleted, absorbing
    Deleted,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 7] = [
        DeploymentStatus::Pending,
        DeploymentStatus::Validating,
        DeploymentStatus::Building,
        DeploymentStatus::Deploying,
        DeploymentStatus::Active,
        DeploymentStatus::Failed,
        DeploymentStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Validating => "validating",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Active => "active",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Deleted => "deleted",
        }
    }

    /// `failed` and `deleted`
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Failed | DeploymentStatus::Deleted)
    }

    /// A pending→active cycle is running
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Pending
                | DeploymentStatus::Validating
                | DeploymentStatus::Building
                | DeploymentStatus::Deploying
        )
    }

    /// Position along the forward path, used to check monotonicity
    pub fn rank(&self) -> u8 {
        match self {
            DeploymentStatus::Pending => 0,
            DeploymentStatus::Validating => 1,
            DeploymentStatus::Building => 2,
            DeploymentStatus::Deploying => 3,
            DeploymentStatus::Active => 4,
            DeploymentStatus::Failed => 5,
            DeploymentStatus::Deleted => 6,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeploymentStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Invalid deployment status: {}", s))
    }
}

/// Framework inferred from the artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Sklearn,
    Pytorch,
    Tensorflow,
    Custom,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Sklearn => "sklearn",
            Framework::Pytorch => "pytorch",
            Framework::Tensorflow => "tensorflow",
            Framework::Custom => "custom",
        }
    }
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live serving route of a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRef {
    /// Public URL callers send predictions to
    pub url: String,

    /// Versioned function the route points at
    pub function: String,
}

/// The central deployment record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub status: DeploymentStatus,

    /// Set by validation, immutable once set
    #[serde(default)]
    pub framework: Option<Framework>,

    /// Artifact currently served (or being deployed for the first time)
    pub artifact_ref: String,

    /// Non-null iff `status == active`
    #[serde(default)]
    pub endpoint_ref: Option<EndpointRef>,

    /// Incremented once per successful pending→active cycle
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Last failure reason, only set while `failed`
    #[serde(default)]
    pub error: Option<String>,

    /// Failures seen for the current transition
    #[serde(default)]
    pub retry_count: u32,

    /// Compare-and-swap token, bumped on every persisted change
    #[serde(default)]
    pub transition_version: u64,

    /// Bumped whenever a cycle starts (create or redeploy)
    #[serde(default)]
    pub cycle: u64,

    /// Artifact of an in-flight redeploy
    #[serde(default)]
    pub pending_artifact_ref: Option<String>,

    /// Route that keeps serving while a redeploy is in flight
    #[serde(default)]
    pub previous_endpoint_ref: Option<EndpointRef>,

    /// Image published by the last successful build of the cycle
    #[serde(default)]
    pub image_ref: Option<String>,

    #[serde(default)]
    pub idempotency_key: Option<String>,

    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Compute teardown has not succeeded yet
    #[serde(default)]
    pub teardown_pending: bool,
}

impl Deployment {
    /// A fresh `pending` record starting its first cycle
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        name: impl Into<String>,
        artifact_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            name: name.into(),
            status: DeploymentStatus::Pending,
            framework: None,
            artifact_ref: artifact_ref.into(),
            endpoint_ref: None,
            version: 0,
            created_at: now,
            updated_at: now,
            error: None,
            retry_count: 0,
            transition_version: 0,
            cycle: 1,
            pending_artifact_ref: None,
            previous_endpoint_ref: None,
            image_ref: None,
            idempotency_key: None,
            webhook_url: None,
            teardown_pending: false,
        }
    }

    /// Artifact the in-flight cycle is working on
    pub fn target_artifact_ref(&self) -> &str {
        self.pending_artifact_ref
            .as_deref()
            .unwrap_or(&self.artifact_ref)
    }

    /// Version the in-flight cycle will publish
    pub fn target_version(&self) -> u64 {
        self.version + 1
    }

    /// Build attempt the record waits on; only set while `building`
    pub fn build_attempt(&self) -> Option<u32> {
        (self.status == DeploymentStatus::Building).then_some(self.retry_count + 1)
    }

    /// Check the record invariants that hold after every transition
    pub fn check_invariants(&self) -> Result<(), OrchestratorError> {
        let active = self.status == DeploymentStatus::Active;
        if active != self.endpoint_ref.is_some() {
            return Err(OrchestratorError::Internal(format!(
                "deployment {} is {} with endpoint_ref {:?}",
                self.id, self.status, self.endpoint_ref
            )));
        }
        if self.error.is_some() && self.status != DeploymentStatus::Failed {
            return Err(OrchestratorError::Internal(format!(
                "deployment {} carries an error while {}",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

/// Outcome of a build job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildOutcome {
    Pending,
    Success,
    Failure,
}

/// A build attempt, owned by the build dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJob {
    pub deployment_id: String,
    pub attempt_number: u32,

    /// Cycle of the deployment the job belongs to
    pub cycle: u64,

    /// Tag the image is published under
    pub image_tag: String,

    /// Published image, known on success
    #[serde(default)]
    pub image_ref: Option<String>,

    pub outcome: BuildOutcome,

    #[serde(default)]
    pub error: Option<String>,

    /// Whether a failure is worth retrying
    #[serde(default)]
    pub transient: bool,

    #[serde(default)]
    pub log_ref: Option<String>,

    pub started_at: DateTime<Utc>,
}

impl BuildJob {
    pub fn is_finished(&self) -> bool {
        self.outcome != BuildOutcome::Pending
    }
}
