//! `WebSocket` session registry, connection lifecycle, keep-alive and fan-out.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `session` | Per-client handle: outbound queue, liveness, lifecycle state |
//! | `registry` | Ordered, thread-safe set of admitted sessions + drop guard |
//! | `connection` | Admission, receive loop, writer task, teardown |
//! | `broadcast` | Snapshot fan-out with per-recipient write bound |
//! | `heartbeat` | Periodic Pings and idle timeout |
//!
//! ## Data Flow
//!
//! `connection` receives a text frame → `broadcast` snapshots `registry` →
//! each `session` queue → that session's writer task → socket.

pub mod broadcast;
pub mod connection;
pub mod heartbeat;
pub mod registry;
pub mod session;
