//! Status API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Create deployment request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeploymentRequest {
    pub owner_id: String,
    pub artifact_ref: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Alternative to the `Idempotency-Key` header
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Redeploy request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeployRequest {
    pub artifact_ref: String,
}

/// Deployment snapshot returned to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResponse {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    /// One of pending, validating, building, deploying, active, failed, deleted
    pub status: String,
    pub framework: Option<String>,
    pub artifact_ref: String,
    pub endpoint_ref: Option<String>,
    pub version: u64,
    pub retry_count: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deployment list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentListResponse {
    pub deployments: Vec<DeploymentResponse>,
    pub total: usize,
}

/// Build callback acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackAck {
    /// False when the callback was a duplicate or arrived for a finished cycle
    pub applied: bool,
}

/// Error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error kind, e.g. `NotFound`
    pub kind: String,
    pub message: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}
