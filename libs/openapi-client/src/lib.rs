//! Wire models for the external systems the ServeML orchestrator talks to.

pub mod models;

pub use models::*;
