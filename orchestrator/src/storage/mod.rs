//! Persistent state: settings, layout, deployment records and artifacts

pub mod artifacts;
pub mod layout;
pub mod records;
pub mod settings;
