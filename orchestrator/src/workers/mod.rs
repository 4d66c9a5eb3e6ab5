//! Background workers

pub mod executor;
pub mod notifier;
pub mod sweeper;
