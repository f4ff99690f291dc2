//! Shared types for the diffbox inference worker.
//!
//! Everything that more than one workspace crate needs lives here: the
//! closed set of job types, the handler trait the supervisor dispatches
//! to, the progress reporting seam, the handler-boundary error type and
//! the process configuration.

pub mod config;
pub mod error;
pub mod handler;
pub mod progress;
pub mod types;
