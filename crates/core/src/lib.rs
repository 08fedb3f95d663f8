//! Request-serving plane for the chatgate LLM gateway.
//!
//! One module per concern (`session` = duplex connection handling,
//! `cluster` = node registry, `pipeline` = per-turn orchestration,
//! `rate_limit`, `tools`, `storage`, `auth`, `error`, `events`, `config`),
//! wired together by `Arc`-shared services rather than a god object.

pub mod auth;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod rate_limit;
pub mod session;
pub mod storage;
pub mod tools;

pub use error::GatewayError;
