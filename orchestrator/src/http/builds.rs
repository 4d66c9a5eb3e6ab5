//! CI workflow API client

use openapi_client::WorkflowDispatchRequest;

use crate::errors::OrchestratorError;
use crate::http::client::HttpClient;

impl HttpClient {
    /// Trigger a workflow run. The dispatch endpoint is the client's base URL
    /// and answers without a body.
    pub async fn dispatch_workflow(
        &self,
        request: &WorkflowDispatchRequest,
    ) -> Result<(), OrchestratorError> {
        self.post_ignore_body("", request).await
    }
}
