//! Per-turn chat orchestration.

pub mod chat;
pub mod model_select;

pub use chat::{CancellationHandle, ChatCallbacks, ChatPipeline, ChatRequest, ChatResponse, ModeFlags};
