//! Relay error types.

use std::time::Duration;

use crate::server::ServerState;

/// Listener-level failures surfaced to the caller of `start()` / `listen()`.
///
/// Per-session and per-write failures never become a `RelayError`; they are
/// handled inside the connection that produced them.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration rejected before binding.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The accept loop terminated with an I/O error.
    #[error("accept loop failed: {0}")]
    Serve(#[source] std::io::Error),

    /// `start()` called while the server was not stopped.
    #[error("server is already {0}")]
    AlreadyRunning(ServerState),
}

impl RelayError {
    /// Error category string for logs and metrics labels.
    pub fn category(&self) -> &str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::Bind { .. } => "bind",
            Self::Serve(_) => "serve",
            Self::AlreadyRunning(_) => "already_running",
        }
    }
}

/// Failure to enqueue a frame for one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The recipient's outbound queue is closed (writer gone).
    #[error("session channel closed")]
    Closed,

    /// The recipient's queue stayed full for the whole write bound.
    #[error("write timed out after {0:?}")]
    TimedOut(Duration),
}
