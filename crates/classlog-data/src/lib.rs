//! Data layer for classlog.
//!
//! Responsible for discovering and reading the raw notebook, chat and event
//! logs, building per-student session timelines, correlating events across
//! sources, running the analysers and rolling their output up per student.

pub mod aggregator;
pub mod analysers;
pub mod analysis;
pub mod correlator;
pub mod reader;
pub mod timeline;

pub use classlog_core as core;
