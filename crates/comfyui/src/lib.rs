//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed event parsing, WebSocket connection setup, HTTP API
//! wrappers, the execution tracking state machine, output extraction,
//! and the [`executor::RemoteExecutor`] facade that job handlers use to
//! run one workflow end to end.

pub mod api;
pub mod client;
pub mod executor;
pub mod messages;
pub mod outputs;
pub mod tracker;

#[cfg(any(test, feature = "mock-server"))]
pub mod mock;
