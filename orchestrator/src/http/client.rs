//! HTTP client implementation

use std::time::Duration;

use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::errors::OrchestratorError;

/// HTTP client for a collaborator's REST API
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(
        base_url: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, OrchestratorError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            ),
            None => request,
        }
    }

    async fn send(&self, method: &str, request: RequestBuilder) -> Result<Response, OrchestratorError> {
        let response = self.authorize(request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("HTTP {} failed: {} - {}", method, status, body);
            return Err(status_error(status, &body));
        }
        Ok(response)
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, OrchestratorError> {
        let url = self.url(path);
        debug!("GET {}", url);

        let response = self.send("GET", self.client.get(&url)).await?;
        Ok(response.json().await?)
    }

    /// Make a POST request
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, OrchestratorError> {
        let url = self.url(path);
        debug!("POST {}", url);

        let response = self.send("POST", self.client.post(&url).json(body)).await?;
        Ok(response.json().await?)
    }

    /// Make a POST request whose response body is not needed
    pub async fn post_ignore_body<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), OrchestratorError> {
        let url = self.url(path);
        debug!("POST {}", url);

        self.send("POST", self.client.post(&url).json(body)).await?;
        Ok(())
    }

    /// Make a PUT request
    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, OrchestratorError> {
        let url = self.url(path);
        debug!("PUT {}", url);

        let response = self.send("PUT", self.client.put(&url).json(body)).await?;
        Ok(response.json().await?)
    }

    /// Make a DELETE request
    pub async fn delete(&self, path: &str) -> Result<(), OrchestratorError> {
        let url = self.url(path);
        debug!("DELETE {}", url);

        self.send("DELETE", self.client.delete(&url)).await?;
        Ok(())
    }
}

/// Map a non-success status to an error, keeping retryability
fn status_error(status: StatusCode, body: &str) -> OrchestratorError {
    let message = format!("{}: {}", status, body);
    if status == StatusCode::NOT_FOUND {
        OrchestratorError::NotFound(message)
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        OrchestratorError::Transient(message)
    } else {
        OrchestratorError::Collaborator(message)
    }
}
