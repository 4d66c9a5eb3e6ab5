//! Outbound HTTP

pub mod builds;
pub mod client;
pub mod compute;
pub mod webhooks;
