//! Webhook delivery

use openapi_client::WebhookPayload;

use crate::errors::OrchestratorError;
use crate::http::client::HttpClient;

impl HttpClient {
    /// POST a status change to an absolute webhook URL
    pub async fn post_webhook(
        &self,
        url: &str,
        payload: &WebhookPayload,
    ) -> Result<(), OrchestratorError> {
        self.post_ignore_body(url, payload).await
    }
}
