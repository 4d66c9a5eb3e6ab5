//! Deployment pipeline

pub mod dispatcher;
pub mod docker;
pub mod fsm;
pub mod notifier;
pub mod orchestrator;
pub mod provisioner;
pub mod validator;
