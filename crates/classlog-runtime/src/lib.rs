//! Runtime layer for classlog.
//!
//! Runs the batch pipeline across students on a tokio runtime and writes
//! the resulting metric tables.

pub mod export;
pub mod orchestrator;

pub use classlog_core as core;
pub use classlog_data as data;
