//! Compute provisioning
//!
//! Every version of a deployment runs in its own function (`{id}-v{n}`).
//! The public route is only moved to a new function after it answered a
//! readiness invocation, so the previous version keeps serving until then.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use openapi_client::{FunctionSpec, InvokeResponse, RouteSpec};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::errors::OrchestratorError;
use crate::http::client::HttpClient;
use crate::models::deployment::{Deployment, EndpointRef};

/// Serverless compute platform
#[async_trait]
pub trait ComputePlatform: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upsert_function(&self, name: &str, spec: &FunctionSpec) -> Result<(), OrchestratorError>;

    async fn invoke(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<InvokeResponse, OrchestratorError>;

    /// Point the deployment's public route at `function`; returns the URL
    async fn upsert_route(&self, deployment_id: &str, function: &str) -> Result<String, OrchestratorError>;

    async fn list_functions(&self, prefix: &str) -> Result<Vec<String>, OrchestratorError>;

    async fn delete_function(&self, name: &str) -> Result<(), OrchestratorError>;

    async fn delete_route(&self, deployment_id: &str) -> Result<(), OrchestratorError>;
}

/// Provisioner settings
#[derive(Debug, Clone)]
pub struct ProvisionerOptions {
    pub memory_mb: u32,
    pub function_timeout: Duration,
    pub readiness_timeout: Duration,
}

impl Default for ProvisionerOptions {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            function_timeout: Duration::from_secs(300),
            readiness_timeout: Duration::from_secs(30),
        }
    }
}

/// Canned request used to check a new function
pub fn readiness_payload() -> serde_json::Value {
    let data = vec![1.0_f64; 10];
    json!({ "data": data })
}

/// Name of the function serving `version` of a deployment
pub fn function_name(deployment_id: &str, version: u64) -> String {
    format!("{}-v{}", deployment_id, version)
}

fn function_prefix(deployment_id: &str) -> String {
    format!("{}-v", deployment_id)
}

pub struct ComputeProvisioner {
    platform: Arc<dyn ComputePlatform>,
    options: ProvisionerOptions,
}

impl ComputeProvisioner {
    pub fn new(platform: Arc<dyn ComputePlatform>, options: ProvisionerOptions) -> Self {
        Self { platform, options }
    }

    /// Deploy `image_ref` as the deployment's next version and move the
    /// route to it once it is ready
    pub async fn provision(
        &self,
        deployment: &Deployment,
        image_ref: &str,
    ) -> Result<EndpointRef, OrchestratorError> {
        let function = function_name(&deployment.id, deployment.target_version());
        let mut environment = HashMap::new();
        environment.insert("DEPLOYMENT_ID".to_string(), deployment.id.clone());
        if let Some(framework) = deployment.framework {
            environment.insert("FRAMEWORK".to_string(), framework.to_string());
        }

        let spec = FunctionSpec {
            image_ref: image_ref.to_string(),
            memory_mb: self.options.memory_mb,
            timeout_secs: self.options.function_timeout.as_secs(),
            environment,
        };

        info!(deployment_id = %deployment.id, function = %function, "Provisioning function");
        self.platform.upsert_function(&function, &spec).await?;
        self.check_ready(&function).await?;

        let url = self.platform.upsert_route(&deployment.id, &function).await?;
        info!(deployment_id = %deployment.id, url = %url, "Route switched");

        self.prune(&deployment.id, &function).await;
        Ok(EndpointRef { url, function })
    }

    async fn check_ready(&self, function: &str) -> Result<(), OrchestratorError> {
        let payload = readiness_payload();
        let invoke = self.platform.invoke(function, &payload);
        let response = match tokio::time::timeout(self.options.readiness_timeout, invoke).await {
            Ok(response) => response?,
            Err(_) => {
                return Err(OrchestratorError::Transient(format!(
                    "readiness check of {} timed out after {}s",
                    function,
                    self.options.readiness_timeout.as_secs()
                )))
            }
        };

        if let Some(error) = response.function_error {
            return Err(OrchestratorError::Collaborator(format!(
                "readiness check of {} raised: {}",
                function, error
            )));
        }
        if response.status_code == 429 || response.status_code >= 500 {
            return Err(OrchestratorError::Transient(format!(
                "readiness check of {} returned {}",
                function, response.status_code
            )));
        }
        if response.status_code >= 400 {
            return Err(OrchestratorError::Collaborator(format!(
                "readiness check of {} returned {}",
                function, response.status_code
            )));
        }
        debug!(function, "Readiness check passed");
        Ok(())
    }

    /// Delete every function version except `keep`. Best effort.
    async fn prune(&self, deployment_id: &str, keep: &str) {
        let functions = match self.platform.list_functions(&function_prefix(deployment_id)).await {
            Ok(functions) => functions,
            Err(e) => {
                warn!(deployment_id, error = %e, "Failed to list superseded functions");
                return;
            }
        };
        let superseded: Vec<&String> = functions.iter().filter(|f| f.as_str() != keep).collect();
        let results = join_all(
            superseded
                .iter()
                .map(|function| self.platform.delete_function(function)),
        )
        .await;
        for (function, result) in superseded.iter().zip(results) {
            if let Err(e) = result {
                warn!(deployment_id, function = %function, error = %e, "Failed to delete superseded function");
            }
        }
    }

    /// Remove the route and every function of a deployment. Missing
    /// resources count as removed.
    pub async fn teardown(&self, deployment_id: &str) -> Result<(), OrchestratorError> {
        ignore_missing(self.platform.delete_route(deployment_id).await)?;
        for function in self
            .platform
            .list_functions(&function_prefix(deployment_id))
            .await?
        {
            ignore_missing(self.platform.delete_function(&function).await)?;
        }
        info!(deployment_id, "Compute resources removed");
        Ok(())
    }
}

fn ignore_missing(result: Result<(), OrchestratorError>) -> Result<(), OrchestratorError> {
    match result {
        Err(OrchestratorError::NotFound(_)) => Ok(()),
        other => other,
    }
}

// =================================== HTTP ======================================== //

/// Compute platform behind a REST management API
pub struct HttpComputePlatform {
    client: HttpClient,
}

impl HttpComputePlatform {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ComputePlatform for HttpComputePlatform {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn upsert_function(&self, name: &str, spec: &FunctionSpec) -> Result<(), OrchestratorError> {
        self.client.upsert_function(name, spec).await?;
        Ok(())
    }

    async fn invoke(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<InvokeResponse, OrchestratorError> {
        self.client.invoke_function(name, payload).await
    }

    async fn upsert_route(&self, deployment_id: &str, function: &str) -> Result<String, OrchestratorError> {
        let route = self
            .client
            .upsert_route(
                deployment_id,
                &RouteSpec {
                    function: function.to_string(),
                },
            )
            .await?;
        Ok(route.url)
    }

    async fn list_functions(&self, prefix: &str) -> Result<Vec<String>, OrchestratorError> {
        let functions = self.client.list_functions(prefix).await?;
        Ok(functions.into_iter().map(|f| f.name).collect())
    }

    async fn delete_function(&self, name: &str) -> Result<(), OrchestratorError> {
        self.client.delete_function(name).await
    }

    async fn delete_route(&self, deployment_id: &str) -> Result<(), OrchestratorError> {
        self.client.delete_route(deployment_id).await
    }
}

// ================================== MEMORY ======================================= //

/// Scripted outcome of the next readiness invocation
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedInvoke {
    Ok,
    Fail { error: String, transient: bool },

    /// Never answer
    Hang,
}

/// In-process compute platform for tests and local runs.
///
/// Routes resolve to `{public_base_url}/predict/{deployment_id}`.
#[derive(Debug)]
pub struct MemoryComputePlatform {
    public_base_url: String,
    functions: Mutex<HashMap<String, FunctionSpec>>,
    routes: Mutex<HashMap<String, String>>,
    script: Mutex<VecDeque<ScriptedInvoke>>,
}

impl MemoryComputePlatform {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            functions: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, outcome: ScriptedInvoke) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    /// Function the deployment's route points at
    pub fn route(&self, deployment_id: &str) -> Option<String> {
        self.routes.lock().ok()?.get(deployment_id).cloned()
    }

    /// Deployed function names, sorted
    pub fn functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .lock()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn poisoned() -> OrchestratorError {
        OrchestratorError::Internal("compute state poisoned".to_string())
    }
}

#[async_trait]
impl ComputePlatform for MemoryComputePlatform {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert_function(&self, name: &str, spec: &FunctionSpec) -> Result<(), OrchestratorError> {
        self.functions
            .lock()
            .map_err(|_| Self::poisoned())?
            .insert(name.to_string(), spec.clone());
        Ok(())
    }

    async fn invoke(
        &self,
        name: &str,
        _payload: &serde_json::Value,
    ) -> Result<InvokeResponse, OrchestratorError> {
        if !self.functions.lock().map_err(|_| Self::poisoned())?.contains_key(name) {
            return Err(OrchestratorError::NotFound(format!("function {}", name)));
        }
        let next = self
            .script
            .lock()
            .map_err(|_| Self::poisoned())?
            .pop_front()
            .unwrap_or(ScriptedInvoke::Ok);

        match next {
            ScriptedInvoke::Ok => Ok(InvokeResponse {
                status_code: 200,
                body: json!({ "prediction": [0] }),
                function_error: None,
            }),
            ScriptedInvoke::Fail { error, transient: true } => Err(OrchestratorError::Transient(error)),
            ScriptedInvoke::Fail { error, transient: false } => Ok(InvokeResponse {
                status_code: 200,
                body: serde_json::Value::Null,
                function_error: Some(error),
            }),
            ScriptedInvoke::Hang => {
                std::future::pending::<()>().await;
                Err(OrchestratorError::Internal("unreachable".to_string()))
            }
        }
    }

    async fn upsert_route(&self, deployment_id: &str, function: &str) -> Result<String, OrchestratorError> {
        self.routes
            .lock()
            .map_err(|_| Self::poisoned())?
            .insert(deployment_id.to_string(), function.to_string());
        Ok(format!("{}/predict/{}", self.public_base_url, deployment_id))
    }

    async fn list_functions(&self, prefix: &str) -> Result<Vec<String>, OrchestratorError> {
        Ok(self
            .functions()
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    async fn delete_function(&self, name: &str) -> Result<(), OrchestratorError> {
        match self.functions.lock().map_err(|_| Self::poisoned())?.remove(name) {
            Some(_) => Ok(()),
            None => Err(OrchestratorError::NotFound(format!("function {}", name))),
        }
    }

    async fn delete_route(&self, deployment_id: &str) -> Result<(), OrchestratorError> {
        match self.routes.lock().map_err(|_| Self::poisoned())?.remove(deployment_id) {
            Some(_) => Ok(()),
            None => Err(OrchestratorError::NotFound(format!("route {}", deployment_id))),
        }
    }
}
