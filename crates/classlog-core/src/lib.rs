//! Core types for classlog.
//!
//! Events, sessions, episodes and metric records shared by every stage of the
//! pipeline, together with configuration, error types and the small numeric
//! and text helpers the analysers rely on.

pub mod data_processors;
pub mod error;
pub mod goals;
pub mod models;
pub mod settings;
pub mod stats;
pub mod text;
pub mod time_utils;
