//! Core types for the verdict incident analysis pipeline.
//!
//! This crate defines the shared vocabulary of the system: evidence,
//! hypotheses, verification results, the per-run state record, stage
//! events, configuration, and the common error taxonomy. Every other
//! crate in the workspace depends on it; it depends on nothing but
//! serialization and time.

pub mod config;
pub mod error;
pub mod evidence;
pub mod events;
pub mod hypothesis;
pub mod plan;
pub mod response;
pub mod state;
pub mod timeline;

pub use config::Config;
pub use error::{Error, Result};
