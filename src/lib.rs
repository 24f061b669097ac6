//! # Agent broker
//!
//! Brokers streamed AI coding agent runs between HTTP requests and agent
//! processes.
//!
//! - One run at a time per conversation (browser tab), enforced by
//!   [`conversation::ConversationLocks`].
//! - Runs can be stopped from a second request through
//!   [`cancellation::CancellationRegistry`].
//! - Warm workers are kept per workspace by [`pool::WorkerPool`], with a
//!   one-shot fallback when none is available.
//! - [`bridge::StreamingBridge`] ties it together and guarantees cleanup
//!   happens exactly once however a run ends.

pub mod adapter;
pub mod api;
pub mod backend;
pub mod bridge;
pub mod cancellation;
pub mod config;
pub mod conversation;
pub mod pool;
mod util;
pub mod workspace;

pub use config::Config;
