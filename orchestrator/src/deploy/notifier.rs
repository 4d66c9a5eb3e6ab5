//! Status change notifications
//!
//! The orchestrator only enqueues; delivery happens on the notifier worker so
//! a slow webhook never holds up a transition.

use std::time::Duration;

use chrono::{DateTime, Utc};
use openapi_client::WebhookPayload;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::OrchestratorError;
use crate::http::client::HttpClient;
use crate::models::deployment::Deployment;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// A payload bound for one webhook URL
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub url: String,
    pub payload: WebhookPayload,
}

/// Body sent for the record's current status
pub fn payload_for(record: &Deployment, timestamp: DateTime<Utc>) -> WebhookPayload {
    WebhookPayload {
        event: format!("deployment.{}", record.status),
        deployment_id: record.id.clone(),
        version: record.version,
        status: record.status.to_string(),
        timestamp,
    }
}

/// Handle used to enqueue notifications
#[derive(Debug, Clone)]
pub struct Notifier {
    queue: Option<mpsc::UnboundedSender<Notification>>,
    default_url: Option<String>,
}

impl Notifier {
    pub fn new(queue: mpsc::UnboundedSender<Notification>, default_url: Option<String>) -> Self {
        Self {
            queue: Some(queue),
            default_url,
        }
    }

    /// A notifier that drops everything
    pub fn disabled() -> Self {
        Self {
            queue: None,
            default_url: None,
        }
    }

    /// Queue a notification for the record's status, if it has a target.
    ///
    /// Never blocks and never drops; the worker bounds concurrent deliveries.
    pub fn notify(&self, record: &Deployment) {
        let Some(queue) = &self.queue else {
            return;
        };
        let Some(url) = record.webhook_url.clone().or_else(|| self.default_url.clone()) else {
            return;
        };

        let notification = Notification {
            url,
            payload: payload_for(record, Utc::now()),
        };
        match queue.send(notification) {
            Ok(()) => debug!(deployment_id = %record.id, status = %record.status, "Queued webhook"),
            Err(mpsc::error::SendError(n)) => {
                warn!(deployment_id = %n.payload.deployment_id, event = %n.payload.event, "Webhook queue closed, notification not sent")
            }
        }
    }
}

/// Delivery settings
#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    pub max_attempts: u32,
    pub backoff: CooldownOptions,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: CooldownOptions {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
        }
    }
}

/// Posts notifications with bounded retry
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    client: HttpClient,
    options: DeliveryOptions,
}

impl WebhookDelivery {
    pub fn new(client: HttpClient, options: DeliveryOptions) -> Self {
        Self { client, options }
    }

    /// Deliver one notification, retrying transient failures.
    ///
    /// Returns the number of attempts made on success.
    pub async fn deliver(&self, notification: &Notification) -> Result<u32, OrchestratorError> {
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .client
                .post_webhook(&notification.url, &notification.payload)
                .await
            {
                Ok(()) => {
                    info!(
                        deployment_id = %notification.payload.deployment_id,
                        event = %notification.payload.event,
                        attempt,
                        "Delivered webhook"
                    );
                    return Ok(attempt);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = calc_exp_backoff(&self.options.backoff, attempt - 1);
                    warn!(
                        deployment_id = %notification.payload.deployment_id,
                        attempt,
                        error = %e,
                        "Webhook delivery failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
