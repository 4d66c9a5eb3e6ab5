//! Error types for the ServeML orchestrator

use serde::Serialize;
use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    // ------------------------------ input errors ------------------------------ //
    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("Unsupported framework: {0}")]
    UnsupportedFramework(String),

    #[error("Manifest unresolvable: {0}")]
    ManifestUnresolvable(String),

    #[error("Artifact too large: {size} bytes exceeds the {limit} byte ceiling")]
    ArtifactTooLarge { size: u64, limit: u64 },

    // --------------------------- concurrency errors --------------------------- //
    #[error("Stale transition for deployment {0}")]
    StaleTransition(String),

    #[error("Build already in progress for deployment {0}")]
    BuildInProgress(String),

    // ------------------------ integration/caller errors ----------------------- //
    #[error("Invalid transition: cannot apply {event} to a {status} deployment")]
    InvalidTransition {
        status: &'static str,
        event: &'static str,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Idempotency key {0} was already used with a different artifact")]
    IdempotencyConflict(String),

    #[error("Owner {owner_id} already holds {limit} deployments")]
    QuotaExceeded { owner_id: String, limit: usize },

    // ------------------------------ infrastructure ----------------------------- //
    /// Failure likely to succeed on retry (throttling, timeout, network)
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Collaborator failure that will not succeed on retry
    #[error("Collaborator failure: {0}")]
    Collaborator(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Machine-readable error kind exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    InvalidArtifact,
    UnsupportedFramework,
    ManifestUnresolvable,
    ArtifactTooLarge,
    StaleTransition,
    BuildInProgress,
    InvalidTransition,
    NotFound,
    InvalidRequest,
    IdempotencyConflict,
    QuotaExceeded,
    Transient,
    Upstream,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArtifact => "InvalidArtifact",
            ErrorKind::UnsupportedFramework => "UnsupportedFramework",
            ErrorKind::ManifestUnresolvable => "ManifestUnresolvable",
            ErrorKind::ArtifactTooLarge => "ArtifactTooLarge",
            ErrorKind::StaleTransition => "StaleTransition",
            ErrorKind::BuildInProgress => "BuildInProgress",
            ErrorKind::InvalidTransition => "InvalidTransition",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::IdempotencyConflict => "IdempotencyConflict",
            ErrorKind::QuotaExceeded => "QuotaExceeded",
            ErrorKind::Transient => "Transient",
            ErrorKind::Upstream => "Upstream",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OrchestratorError {
    /// Classify the error for callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::InvalidArtifact(_) => ErrorKind::InvalidArtifact,
            OrchestratorError::UnsupportedFramework(_) => ErrorKind::UnsupportedFramework,
            OrchestratorError::ManifestUnresolvable(_) => ErrorKind::ManifestUnresolvable,
            OrchestratorError::ArtifactTooLarge { .. } => ErrorKind::ArtifactTooLarge,
            OrchestratorError::StaleTransition(_) => ErrorKind::StaleTransition,
            OrchestratorError::BuildInProgress(_) => ErrorKind::BuildInProgress,
            OrchestratorError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            OrchestratorError::IdempotencyConflict(_) => ErrorKind::IdempotencyConflict,
            OrchestratorError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            OrchestratorError::Transient(_) => ErrorKind::Transient,
            OrchestratorError::HttpError(e) if is_transient_http(e) => ErrorKind::Transient,
            OrchestratorError::HttpError(_) | OrchestratorError::Collaborator(_) => {
                ErrorKind::Upstream
            }
            OrchestratorError::IoError(_)
            | OrchestratorError::JsonError(_)
            | OrchestratorError::StorageError(_)
            | OrchestratorError::ConfigError(_)
            | OrchestratorError::ServerError(_)
            | OrchestratorError::ShutdownError(_)
            | OrchestratorError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a collaborator failure should be retried
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Input errors are never retried and end the cycle in `failed`
    pub fn is_input_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidArtifact
                | ErrorKind::UnsupportedFramework
                | ErrorKind::ManifestUnresolvable
                | ErrorKind::ArtifactTooLarge
        )
    }
}

fn is_transient_http(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }
    err.status()
        .map(|s| s.as_u16() == 429 || s.is_server_error())
        .unwrap_or(false)
}
