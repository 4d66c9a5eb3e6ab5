//! Executor worker
//!
//! Consumes the commands emitted by orchestrator transitions and runs the
//! matching collaborator off the transition path. Results go back through
//! `Orchestrator::apply_report`, which drops them if the record moved on.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::deploy::dispatcher::Dispatched;
use crate::deploy::fsm::DeploymentEvent;
use crate::deploy::orchestrator::{Command, Orchestrator, Report};
use crate::deploy::provisioner::ComputeProvisioner;
use crate::deploy::validator::Validator;
use crate::errors::OrchestratorError;
use crate::models::deployment::{Deployment, DeploymentStatus};

/// Runs collaborators on behalf of the orchestrator
pub struct Executor {
    orchestrator: Arc<Orchestrator>,
    validator: Arc<Validator>,
    provisioner: Arc<ComputeProvisioner>,
}

impl Executor {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        validator: Arc<Validator>,
        provisioner: Arc<ComputeProvisioner>,
    ) -> Self {
        Self {
            orchestrator,
            validator,
            provisioner,
        }
    }

    /// Run one command to completion. Failures are logged; the sweeper
    /// catches records left behind.
    pub async fn execute(&self, command: Command) {
        let deployment_id = command.deployment_id().to_string();
        let name = command.name();

        let result = match command {
            Command::Validate {
                deployment_id,
                cycle,
            } => self.validate(&deployment_id, cycle).await,
            Command::Build {
                deployment_id,
                cycle,
                attempt,
                delay,
                validate_first,
            } => {
                pause(delay).await;
                self.build(&deployment_id, cycle, attempt, validate_first)
                    .await
            }
            Command::Provision {
                deployment_id,
                cycle,
                delay,
            } => {
                pause(delay).await;
                self.provision(&deployment_id, cycle).await
            }
            Command::Teardown { deployment_id } => self.teardown(&deployment_id).await,
        };

        if let Err(e) = result {
            error!(deployment_id = %deployment_id, command = name, error = %e, "Command failed");
        }
    }

    /// The record, if it is still in `expected` for `cycle`
    async fn current(
        &self,
        id: &str,
        cycle: u64,
        expected: DeploymentStatus,
    ) -> Result<Option<Deployment>, OrchestratorError> {
        let record = self.orchestrator.get_deployment(id).await?;
        if record.cycle != cycle || record.status != expected {
            debug!(
                deployment_id = id,
                status = %record.status,
                cycle = record.cycle,
                "Record moved on, skipping command"
            );
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn validate(&self, id: &str, cycle: u64) -> Result<(), OrchestratorError> {
        let Some(record) = self.current(id, cycle, DeploymentStatus::Pending).await? else {
            return Ok(());
        };

        let event = match self.validator.validate(&record.artifact_ref, None).await {
            Ok(validation) => DeploymentEvent::ValidateOk {
                framework: validation.framework,
            },
            Err(e) => {
                warn!(deployment_id = id, error = %e, "Validation rejected artifact");
                DeploymentEvent::ValidateFail {
                    error: e.to_string(),
                }
            }
        };
        self.orchestrator.apply_report(id, cycle, event).await?;
        Ok(())
    }

    async fn build(
        &self,
        id: &str,
        cycle: u64,
        attempt: u32,
        validate_first: bool,
    ) -> Result<(), OrchestratorError> {
        let mut record = self.orchestrator.get_deployment(id).await?;
        let trigger = record.status == DeploymentStatus::Validating && attempt == 1;
        // retried or resumed attempt the record still waits on
        let waiting =
            record.status == DeploymentStatus::Building && record.build_attempt() == Some(attempt);
        if record.cycle != cycle || !(trigger || waiting) {
            debug!(
                deployment_id = id,
                attempt,
                status = %record.status,
                cycle = record.cycle,
                "Build attempt settled, skipping command"
            );
            return Ok(());
        }

        if trigger && validate_first {
            if let Err(e) = self
                .validator
                .validate(record.target_artifact_ref(), record.framework)
                .await
            {
                warn!(deployment_id = id, error = %e, "Validation rejected redeploy artifact");
                let event = DeploymentEvent::ValidateFail {
                    error: e.to_string(),
                };
                self.orchestrator.apply_report(id, cycle, event).await?;
                return Ok(());
            }
        }

        if trigger {
            match self
                .orchestrator
                .apply_report(id, cycle, DeploymentEvent::BuildTriggered { attempt })
                .await?
            {
                Report::Applied(building) => record = building,
                Report::Discarded(_) => return Ok(()),
            }
        }

        match self.orchestrator.dispatcher().dispatch(&record, attempt).await {
            Ok(Dispatched::Finished(job)) => {
                self.orchestrator.record_build(&job).await?;
            }
            // the callback reports the outcome
            Ok(Dispatched::Running(job)) => {
                debug!(deployment_id = id, attempt, log_ref = ?job.log_ref, "Build running remotely");
            }
            Err(OrchestratorError::BuildInProgress(_)) => {
                warn!(deployment_id = id, attempt, "Build already in progress");
            }
            Err(e) => {
                let event = DeploymentEvent::BuildFailure {
                    attempt,
                    transient: e.is_transient(),
                    error: e.to_string(),
                };
                self.orchestrator.apply_report(id, cycle, event).await?;
            }
        }
        Ok(())
    }

    async fn provision(&self, id: &str, cycle: u64) -> Result<(), OrchestratorError> {
        let Some(record) = self.current(id, cycle, DeploymentStatus::Deploying).await? else {
            return Ok(());
        };

        let event = match record.image_ref.as_deref() {
            None => DeploymentEvent::ProvisionFailure {
                error: "no published image to provision".to_string(),
                transient: false,
            },
            Some(image_ref) => match self.provisioner.provision(&record, image_ref).await {
                Ok(endpoint) => DeploymentEvent::ProvisionSuccess { endpoint },
                Err(e) => DeploymentEvent::ProvisionFailure {
                    transient: e.is_transient(),
                    error: e.to_string(),
                },
            },
        };
        let went_live = matches!(event, DeploymentEvent::ProvisionSuccess { .. });

        if let Report::Discarded(current) = self.orchestrator.apply_report(id, cycle, event).await? {
            if went_live && current.status == DeploymentStatus::Deleted {
                // the route went live after the delete; remove it again
                self.orchestrator.request_teardown(id);
            }
        }
        Ok(())
    }

    async fn teardown(&self, id: &str) -> Result<(), OrchestratorError> {
        self.orchestrator.dispatcher().release(id)?;
        self.provisioner.teardown(id).await?;
        self.orchestrator.complete_teardown(id).await?;
        Ok(())
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Run the executor worker
pub async fn run(
    executor: Arc<Executor>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Executor worker starting...");
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Executor worker shutting down...");
                break;
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    info!("Command channel closed");
                    break;
                };
                let executor = executor.clone();
                tasks.spawn(async move { executor.execute(command).await });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!("Executor task failed: {}", e);
                }
            }
        }
    }

    if !tasks.is_empty() {
        info!(in_flight = tasks.len(), "Aborting in-flight commands, they resume on next start");
    }
    tasks.shutdown().await;
}
