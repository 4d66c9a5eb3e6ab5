//! Settings file management

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::RetryPolicy;
use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::utils::CooldownOptions;

/// Orchestrator settings. Not serializable: it carries secrets.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Also write daily-rolling log files under the storage layout
    #[serde(default)]
    pub log_to_file: bool,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub validator: ValidatorSettings,

    #[serde(default)]
    pub quota: QuotaSettings,

    #[serde(default)]
    pub build: BuildSettings,

    #[serde(default)]
    pub compute: ComputeSettings,

    #[serde(default)]
    pub notifier: NotifierSettings,

    #[serde(default)]
    pub sweeper: SweeperSettings,
}

impl Settings {
    /// Load settings from a JSON file, falling back to defaults when the file
    /// does not exist
    pub async fn load(file: &File) -> Result<Self, OrchestratorError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        file.read_json().await.map_err(|e| {
            OrchestratorError::ConfigError(format!(
                "invalid settings file {}: {}",
                file.path().display(),
                e
            ))
        })
    }
}

fn default_true() -> bool {
    true
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally reachable base URL, used to build callback URLs
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: default_public_url(),
        }
    }
}

/// Where records and artifacts live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    File,
}

/// Storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub records: StoreBackend,

    #[serde(default)]
    pub artifacts: StoreBackend,
}

/// Retry policy for transient build and provision failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_retry_max_delay")]
    pub max_delay_secs: u64,

    #[serde(default = "default_true")]
    pub auto_retry: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    2
}

fn default_retry_max_delay() -> u64 {
    60
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_retry_base_delay(),
            max_delay_secs: default_retry_max_delay(),
            auto_retry: true,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            auto_retry: self.auto_retry,
            backoff: CooldownOptions {
                base_delay: Duration::from_secs(self.base_delay_secs),
                max_delay: Duration::from_secs(self.max_delay_secs),
                multiplier: 2.0,
            },
        }
    }
}

/// Validator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSettings {
    /// Largest accepted model file
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,
}

fn default_max_artifact_bytes() -> u64 {
    500 * 1024 * 1024
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            max_artifact_bytes: default_max_artifact_bytes(),
        }
    }
}

/// Per-owner limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSettings {
    /// Non-deleted deployments an owner may hold
    #[serde(default = "default_max_deployments")]
    pub max_deployments_per_owner: usize,
}

fn default_max_deployments() -> usize {
    10
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            max_deployments_per_owner: default_max_deployments(),
        }
    }
}

/// Build backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildBackendKind {
    Workflow,
    Docker,
    #[default]
    Memory,
}

/// Build settings
#[derive(Debug, Clone, Deserialize)]
pub struct BuildSettings {
    #[serde(default)]
    pub backend: BuildBackendKind,

    /// Image registry, e.g. `123456789.dkr.ecr.us-east-1.amazonaws.com`
    #[serde(default = "default_registry")]
    pub registry: String,

    #[serde(default = "default_repository")]
    pub repository: String,

    #[serde(default)]
    pub workflow: WorkflowSettings,

    #[serde(default)]
    pub docker: DockerSettings,
}

fn default_registry() -> String {
    "localhost:5000".to_string()
}

fn default_repository() -> String {
    "serveml-models".to_string()
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            backend: BuildBackendKind::default(),
            registry: default_registry(),
            repository: default_repository(),
            workflow: WorkflowSettings::default(),
            docker: DockerSettings::default(),
        }
    }
}

/// CI workflow backend settings
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSettings {
    /// Workflow dispatch endpoint
    #[serde(default)]
    pub dispatch_url: String,

    /// Git ref the workflow runs on
    #[serde(default = "default_git_ref")]
    pub git_ref: String,

    /// Bearer token for the CI API
    #[serde(default)]
    pub token: Option<SecretString>,
}

fn default_git_ref() -> String {
    "main".to_string()
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            dispatch_url: String::new(),
            git_ref: default_git_ref(),
            token: None,
        }
    }
}

/// Local docker backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSettings {
    /// Docker executable
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Directory holding the serving Dockerfile template
    #[serde(default = "default_template_dir")]
    pub template_dir: String,

    /// Push the image after building
    #[serde(default = "default_true")]
    pub push: bool,
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_template_dir() -> String {
    "templates".to_string()
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            docker_bin: default_docker_bin(),
            template_dir: default_template_dir(),
            push: true,
        }
    }
}

/// Compute platform selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputePlatformKind {
    Http,
    #[default]
    Memory,
}

/// Compute platform settings
#[derive(Debug, Clone, Deserialize)]
pub struct ComputeSettings {
    #[serde(default)]
    pub platform: ComputePlatformKind,

    /// Management API of the compute platform
    #[serde(default)]
    pub api_url: String,

    /// Base of public prediction URLs
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    #[serde(default)]
    pub token: Option<SecretString>,

    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,

    #[serde(default = "default_function_timeout")]
    pub function_timeout_secs: u64,

    /// Bound on the readiness invocation
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
}

fn default_public_base_url() -> String {
    "https://api.serveml.dev".to_string()
}

fn default_memory_mb() -> u32 {
    2048
}

fn default_function_timeout() -> u64 {
    300
}

fn default_readiness_timeout() -> u64 {
    30
}

impl Default for ComputeSettings {
    fn default() -> Self {
        Self {
            platform: ComputePlatformKind::default(),
            api_url: String::new(),
            public_base_url: default_public_base_url(),
            token: None,
            memory_mb: default_memory_mb(),
            function_timeout_secs: default_function_timeout(),
            readiness_timeout_secs: default_readiness_timeout(),
        }
    }
}

/// Webhook notifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierSettings {
    /// Receives every transition unless a deployment registers its own URL
    #[serde(default)]
    pub default_url: Option<String>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_notifier_base_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Deliveries running at once, across deployments
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Time the worker keeps delivering queued notifications after shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

fn default_notifier_base_delay() -> u64 {
    1
}

fn default_request_timeout() -> u64 {
    10
}

fn default_max_in_flight() -> usize {
    16
}

fn default_drain_timeout() -> u64 {
    10
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            default_url: None,
            max_attempts: default_max_attempts(),
            base_delay_secs: default_notifier_base_delay(),
            request_timeout_secs: default_request_timeout(),
            max_in_flight: default_max_in_flight(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

/// Sweeper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    /// Non-terminal records untouched for longer than this are failed
    #[serde(default = "default_deployment_timeout")]
    pub deployment_timeout_secs: u64,
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_deployment_timeout() -> u64 {
    600
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval(),
            deployment_timeout_secs: default_deployment_timeout(),
        }
    }
}
