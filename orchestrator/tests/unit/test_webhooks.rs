//! Webhook delivery tests against a local receiver

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::Utc;
use openapi_client::WebhookPayload;
use serveml::deploy::notifier::{payload_for, DeliveryOptions, Notification, WebhookDelivery};
use serveml::errors::OrchestratorError;
use serveml::http::client::HttpClient;
use serveml::models::deployment::{Deployment, DeploymentStatus};
use serveml::utils::CooldownOptions;
use serveml::workers::notifier;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

struct Receiver {
    failures_left: AtomicU32,
    failure: StatusCode,
    payloads: Mutex<Vec<WebhookPayload>>,

    /// Lets a request to `/slow` answer
    release: Notify,
}

async fn hook(
    State(receiver): State<Arc<Receiver>>,
    Json(payload): Json<WebhookPayload>,
) -> StatusCode {
    receiver.payloads.lock().unwrap().push(payload);
    let left = receiver.failures_left.load(Ordering::SeqCst);
    if left > 0 {
        receiver.failures_left.store(left - 1, Ordering::SeqCst);
        return receiver.failure;
    }
    StatusCode::NO_CONTENT
}

/// Records the payload, then holds the response until released
async fn slow_hook(
    State(receiver): State<Arc<Receiver>>,
    Json(payload): Json<WebhookPayload>,
) -> StatusCode {
    receiver.payloads.lock().unwrap().push(payload);
    receiver.release.notified().await;
    StatusCode::NO_CONTENT
}

/// Start a receiver that answers `failure` to the first `failures` posts
async fn spawn_receiver(failures: u32, failure: StatusCode) -> (String, Arc<Receiver>) {
    let receiver = Arc::new(Receiver {
        failures_left: AtomicU32::new(failures),
        failure,
        payloads: Mutex::new(Vec::new()),
        release: Notify::new(),
    });
    let app = Router::new()
        .route("/hook", post(hook))
        .route("/slow", post(slow_hook))
        .with_state(receiver.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/hook", addr), receiver)
}

fn delivery(max_attempts: u32) -> WebhookDelivery {
    WebhookDelivery::new(
        HttpClient::new("", None, Duration::from_secs(5)).unwrap(),
        DeliveryOptions {
            max_attempts,
            backoff: CooldownOptions {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
            },
        },
    )
}

fn notification(url: &str, status: DeploymentStatus) -> Notification {
    notification_for("dep-1", url, status)
}

fn notification_for(deployment_id: &str, url: &str, status: DeploymentStatus) -> Notification {
    let mut record = Deployment::new(deployment_id, "user-1", "iris", "sha256:a", Utc::now());
    record.status = status;
    Notification {
        url: url.to_string(),
        payload: payload_for(&record, Utc::now()),
    }
}

fn spawn_worker(
    rx: mpsc::UnboundedReceiver<Notification>,
    max_in_flight: usize,
) -> (oneshot::Sender<()>, JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let worker = tokio::spawn(async move {
        let options = notifier::Options {
            max_in_flight,
            drain_timeout: Duration::from_secs(5),
        };
        notifier::run(
            Arc::new(delivery(3)),
            rx,
            &options,
            Box::pin(async move {
                let _ = shutdown_rx.await;
            }),
        )
        .await;
    });
    (shutdown_tx, worker)
}

/// Statuses received for `deployment_id`, in arrival order
fn statuses_of(receiver: &Receiver, deployment_id: &str) -> Vec<String> {
    receiver
        .payloads
        .lock()
        .unwrap()
        .iter()
        .filter(|p| p.deployment_id == deployment_id)
        .map(|p| p.status.clone())
        .collect()
}

async fn wait_for_payloads(receiver: &Receiver, deployment_id: &str, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while statuses_of(receiver, deployment_id).len() < count {
        assert!(Instant::now() < deadline, "webhooks not delivered in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_delivery_retries_transient_failures() {
    let (url, receiver) = spawn_receiver(2, StatusCode::SERVICE_UNAVAILABLE).await;

    let attempts = delivery(3)
        .deliver(&notification(&url, DeploymentStatus::Building))
        .await
        .unwrap();
    assert_eq!(attempts, 3);

    let payloads = receiver.payloads.lock().unwrap();
    assert_eq!(payloads.len(), 3);
    assert_eq!(payloads[0].event, "deployment.building");
    assert_eq!(payloads[0].deployment_id, "dep-1");
}

#[tokio::test]
async fn test_delivery_gives_up() {
    let (url, receiver) = spawn_receiver(10, StatusCode::BAD_GATEWAY).await;

    let err = delivery(3)
        .deliver(&notification(&url, DeploymentStatus::Active))
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(receiver.payloads.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_rejected_webhook_not_retried() {
    let (url, receiver) = spawn_receiver(1, StatusCode::BAD_REQUEST).await;

    let err = delivery(3)
        .deliver(&notification(&url, DeploymentStatus::Failed))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Collaborator(_)));
    assert_eq!(receiver.payloads.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_worker_delivers_in_order() {
    let (url, receiver) = spawn_receiver(0, StatusCode::OK).await;
    let (tx, rx) = mpsc::unbounded_channel();
    for status in [
        DeploymentStatus::Pending,
        DeploymentStatus::Validating,
        DeploymentStatus::Building,
    ] {
        tx.send(notification(&url, status)).unwrap();
    }

    let (shutdown_tx, worker) = spawn_worker(rx, 4);
    wait_for_payloads(&receiver, "dep-1", 3).await;
    assert_eq!(statuses_of(&receiver, "dep-1"), ["pending", "validating", "building"]);

    shutdown_tx.send(()).unwrap();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_slow_receiver_does_not_hold_up_other_deployments() {
    let (url, receiver) = spawn_receiver(0, StatusCode::OK).await;
    let slow_url = url.replace("/hook", "/slow");
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(notification_for("dep-slow", &slow_url, DeploymentStatus::Pending))
        .unwrap();
    tx.send(notification_for("dep-slow", &url, DeploymentStatus::Validating))
        .unwrap();
    tx.send(notification_for("dep-fast", &url, DeploymentStatus::Pending))
        .unwrap();
    tx.send(notification_for("dep-fast", &url, DeploymentStatus::Validating))
        .unwrap();

    let (shutdown_tx, worker) = spawn_worker(rx, 4);

    wait_for_payloads(&receiver, "dep-fast", 2).await;
    assert_eq!(statuses_of(&receiver, "dep-fast"), ["pending", "validating"]);
    // the second notification waits for the first one of its deployment
    assert_eq!(statuses_of(&receiver, "dep-slow"), ["pending"]);

    receiver.release.notify_one();
    wait_for_payloads(&receiver, "dep-slow", 2).await;
    assert_eq!(statuses_of(&receiver, "dep-slow"), ["pending", "validating"]);

    shutdown_tx.send(()).unwrap();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_delivers_queued_notifications() {
    let (url, receiver) = spawn_receiver(0, StatusCode::OK).await;
    let (tx, rx) = mpsc::unbounded_channel();
    for deployment_id in ["dep-1", "dep-2", "dep-3"] {
        tx.send(notification_for(deployment_id, &url, DeploymentStatus::Pending))
            .unwrap();
        tx.send(notification_for(deployment_id, &url, DeploymentStatus::Validating))
            .unwrap();
    }

    let (shutdown_tx, worker) = spawn_worker(rx, 2);
    shutdown_tx.send(()).unwrap();
    worker.await.unwrap();

    assert_eq!(receiver.payloads.lock().unwrap().len(), 6);
    for deployment_id in ["dep-1", "dep-2", "dep-3"] {
        assert_eq!(statuses_of(&receiver, deployment_id), ["pending", "validating"]);
    }
    // the worker closed the queue on its way out
    assert!(tx
        .send(notification(&url, DeploymentStatus::Active))
        .is_err());
}
