//! Webhook delivery worker
//!
//! Deliveries for different deployments run concurrently, up to
//! `max_in_flight` at once. Notifications for the same deployment are
//! delivered one after another in queue order.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::deploy::notifier::{Notification, WebhookDelivery};

/// Notifier worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Deliveries running at once
    pub max_in_flight: usize,

    /// How long queued notifications keep being delivered after shutdown
    pub drain_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Run the notifier worker. A delivery that exhausts its attempts is logged
/// and dropped. On shutdown the queue is closed and what is left gets
/// delivered within `drain_timeout`.
pub async fn run(
    delivery: Arc<WebhookDelivery>,
    mut queue: mpsc::UnboundedReceiver<Notification>,
    options: &Options,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Notifier worker starting...");
    let mut pool = DeliveryPool::new(delivery, options.max_in_flight);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Notifier worker shutting down...");
                break;
            }
            notification = queue.recv() => {
                let Some(notification) = notification else {
                    info!("Notification queue closed");
                    break;
                };
                pool.push(notification);
            }
            Some(joined) = pool.tasks.join_next(), if !pool.tasks.is_empty() => {
                pool.finished(joined);
            }
        }
    }

    queue.close();
    while let Ok(notification) = queue.try_recv() {
        pool.push(notification);
    }
    if pool.tasks.is_empty() {
        return;
    }

    info!(pending = pool.pending(), "Draining webhook queue");
    if tokio::time::timeout(options.drain_timeout, pool.drain())
        .await
        .is_err()
    {
        warn!(pending = pool.pending(), "Webhook drain timed out, dropping the rest");
        pool.tasks.shutdown().await;
    }
}

struct DeliveryPool {
    delivery: Arc<WebhookDelivery>,
    permits: Arc<Semaphore>,

    /// Notifications waiting per deployment. A key is present while a
    /// delivery for that deployment runs.
    backlog: HashMap<String, VecDeque<Notification>>,

    /// Each task yields the deployment it delivered for
    tasks: JoinSet<String>,
}

impl DeliveryPool {
    fn new(delivery: Arc<WebhookDelivery>, max_in_flight: usize) -> Self {
        Self {
            delivery,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            backlog: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    fn push(&mut self, notification: Notification) {
        let deployment_id = &notification.payload.deployment_id;
        match self.backlog.get_mut(deployment_id) {
            Some(waiting) => waiting.push_back(notification),
            None => {
                self.backlog.insert(deployment_id.clone(), VecDeque::new());
                self.spawn(notification);
            }
        }
    }

    fn spawn(&mut self, notification: Notification) {
        let delivery = self.delivery.clone();
        let permits = self.permits.clone();
        self.tasks.spawn(async move {
            let deployment_id = notification.payload.deployment_id.clone();
            let _permit = permits.acquire_owned().await.ok();
            let result = AssertUnwindSafe(delivery.deliver(&notification))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(
                    deployment_id = %deployment_id,
                    event = %notification.payload.event,
                    url = %notification.url,
                    error = %e,
                    "Webhook delivery failed"
                ),
                Err(_) => error!(deployment_id = %deployment_id, "Webhook delivery panicked"),
            }
            deployment_id
        });
    }

    /// Start the next delivery for the deployment whose delivery finished
    fn finished(&mut self, joined: Result<String, JoinError>) {
        let deployment_id = match joined {
            Ok(deployment_id) => deployment_id,
            Err(e) => {
                error!("Notifier task failed: {}", e);
                return;
            }
        };
        match self
            .backlog
            .get_mut(&deployment_id)
            .and_then(VecDeque::pop_front)
        {
            Some(next) => self.spawn(next),
            None => {
                self.backlog.remove(&deployment_id);
            }
        }
    }

    async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            self.finished(joined);
        }
    }

    fn pending(&self) -> usize {
        self.tasks.len() + self.backlog.values().map(VecDeque::len).sum::<usize>()
    }
}
