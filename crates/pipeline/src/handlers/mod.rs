//! Job handlers, one per [`JobType`](diffbox_core::types::JobType).

mod chat;
mod i2v;
mod qwen;

pub use chat::ChatHandler;
pub use i2v::I2vHandler;
pub use qwen::QwenHandler;
