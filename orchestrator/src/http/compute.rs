//! Compute platform API client

use openapi_client::{FunctionResponse, FunctionSpec, InvokeResponse, RouteResponse, RouteSpec};

use crate::errors::OrchestratorError;
use crate::http::client::HttpClient;

impl HttpClient {
    /// Create or update a serving function
    pub async fn upsert_function(
        &self,
        name: &str,
        spec: &FunctionSpec,
    ) -> Result<FunctionResponse, OrchestratorError> {
        let path = format!("/functions/{}", name);
        self.put(&path, spec).await
    }

    /// Invoke a function synchronously
    pub async fn invoke_function(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<InvokeResponse, OrchestratorError> {
        let path = format!("/functions/{}/invoke", name);
        self.post(&path, payload).await
    }

    /// Functions whose name starts with `prefix`
    pub async fn list_functions(
        &self,
        prefix: &str,
    ) -> Result<Vec<FunctionResponse>, OrchestratorError> {
        let path = format!("/functions?prefix={}", prefix);
        self.get(&path).await
    }

    pub async fn delete_function(&self, name: &str) -> Result<(), OrchestratorError> {
        let path = format!("/functions/{}", name);
        self.delete(&path).await
    }

    /// Create or update the public route of a deployment
    pub async fn upsert_route(
        &self,
        deployment_id: &str,
        spec: &RouteSpec,
    ) -> Result<RouteResponse, OrchestratorError> {
        let path = format!("/routes/{}", deployment_id);
        self.put(&path, spec).await
    }

    pub async fn delete_route(&self, deployment_id: &str) -> Result<(), OrchestratorError> {
        let path = format!("/routes/{}", deployment_id);
        self.delete(&path).await
    }
}
