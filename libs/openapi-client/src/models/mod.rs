//! External API models

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ================================ BUILD SYSTEM =================================== //

/// Outcome reported by the build system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildCallbackOutcome {
    Success,
    Failure,
}

/// Asynchronous completion notification sent by the build system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCallback {
    pub deployment_id: String,
    pub attempt_number: u32,
    pub outcome: BuildCallbackOutcome,

    /// Deployment cycle echoed from the dispatch inputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u64>,

    /// Published image, present on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,

    /// Failure reason, present on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Build system's own retryability hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient: Option<bool>,

    /// Link to the build log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_ref: Option<String>,
}

/// Inputs of a CI workflow dispatch. CI systems only accept string inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInputs {
    pub deployment_id: String,
    pub attempt_number: String,
    pub cycle: String,
    pub artifact_ref: String,
    pub framework: String,
    pub image_tag: String,
    pub callback_url: String,
}

/// Workflow dispatch request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDispatchRequest {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub inputs: WorkflowInputs,
}

// =============================== COMPUTE PLATFORM ================================ //

/// Create-or-update request for a serving function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub image_ref: String,
    pub memory_mb: u32,
    pub timeout_secs: u64,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Function as reported by the compute platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    #[serde(default)]
    pub state: Option<String>,
}

/// Create-or-update request for a public route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSpec {
    pub function: String,
}

/// Route as reported by the compute platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponse {
    pub url: String,
    pub function: String,
}

/// Result of a synchronous function invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub status_code: u16,
    #[serde(default)]
    pub body: serde_json::Value,
    /// Set by the platform when the function raised
    #[serde(default)]
    pub function_error: Option<String>,
}

// =================================== WEBHOOKS ===================================== //

/// Notification pushed to a registered webhook on every transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// `deployment.<status>`
    pub event: String,
    pub deployment_id: String,
    pub version: u64,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}
