//! # lanrelay-server
//!
//! Axum `WebSocket` relay that fans every inbound text frame out to all
//! connected clients.
//!
//! - Session registry: ordered, thread-safe membership with drop-guarded retirement
//! - Per-connection receive loop, bounded outbound queue and writer task
//! - Keep-alive pings with idle timeout
//! - Blocking `start()`, graceful `stop()` via `CancellationToken`
//! - `/health` and optional Prometheus `/metrics`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::{RelayError, SendError};
pub use server::{RelayServer, ServerState};
