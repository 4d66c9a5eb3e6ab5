//! ServeML Orchestrator Library
//!
//! Core modules of the deployment pipeline that turns uploaded models into
//! live prediction endpoints.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod utils;
pub mod workers;
