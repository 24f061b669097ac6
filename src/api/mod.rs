//! HTTP API for the broker.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/chat` - Run a chat turn, streamed as NDJSON
//! - `POST /api/chat/cancel` - Cancel a run by request id or by conversation
//! - `GET /api/debug/state` - Locks, cancellation registry and worker pool (non-production)

mod chat;
mod debug;
mod routes;
pub mod types;

pub use routes::{build_engine, router, serve, AppState};
pub use types::*;
