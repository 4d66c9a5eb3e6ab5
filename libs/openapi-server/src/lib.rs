//! Wire models of the ServeML deployment status API.

pub mod models;

pub use models::*;
