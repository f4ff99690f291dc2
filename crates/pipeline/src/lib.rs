//! Workflow templates and the job handlers built on them.
//!
//! Graph handlers ([`handlers::I2vHandler`], [`handlers::QwenHandler`])
//! turn job parameters into a ComfyUI graph through [`templates`] and
//! run it with [`runtime::WorkflowRuntime`]. [`handlers::ChatHandler`]
//! talks to a completion server directly.

pub mod error;
pub mod handlers;
pub mod inputs;
pub mod runtime;
pub mod templates;
