//! Handle for one admitted `WebSocket` client.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::Utf8Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::errors::SendError;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier, increasing in admission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Per-connection lifecycle: `Admitting → Active → Closing → Retired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Upgraded, not yet in the registry.
    Admitting = 0,
    /// In the registry, receive loop running.
    Active = 1,
    /// Receive loop exited, teardown in progress.
    Closing = 2,
    /// Removed from the registry.
    Retired = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Admitting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Retired,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Admitting => "admitting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Retired => "retired",
        };
        f.write_str(s)
    }
}

/// Work item for a session's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Relay a text payload verbatim.
    Text(Utf8Bytes),
    /// Keep-alive ping.
    Ping,
    /// Start the close handshake and stop writing.
    Close,
}

/// Represents a connected `WebSocket` client.
///
/// The handle only ever enqueues; the socket itself is owned by the
/// connection's writer task.
pub struct Session {
    id: SessionId,
    tx: mpsc::Sender<Outbound>,
    connected_at: Instant,
    state: AtomicU8,
    /// Set by any inbound frame, cleared by the heartbeat before each ping.
    is_alive: AtomicBool,
    last_activity: Mutex<Instant>,
    dropped_messages: AtomicU64,
    cancel: CancellationToken,
}

impl Session {
    /// Create a new session in the `Admitting` state.
    ///
    /// `cancel` unblocks the receive loop; pass a child of the server's
    /// shutdown token so `stop()` reaches every session.
    pub fn new(id: SessionId, tx: mpsc::Sender<Outbound>, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            state: AtomicU8::new(SessionState::Admitting as u8),
            is_alive: AtomicBool::new(true),
            last_activity: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            cancel,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Liveness check used by broadcast: active, not cancelled, writer still draining.
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Active && !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    /// Enqueue a text frame, waiting at most `timeout` for queue space.
    pub async fn send_text(&self, payload: Utf8Bytes, timeout: Duration) -> Result<(), SendError> {
        match self.tx.send_timeout(Outbound::Text(payload), timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                match e {
                    SendTimeoutError::Timeout(_) => Err(SendError::TimedOut(timeout)),
                    SendTimeoutError::Closed(_) => Err(SendError::Closed),
                }
            }
        }
    }

    /// Queue a keep-alive ping. Returns `false` if the queue is full or closed.
    pub fn ping(&self) -> bool {
        self.tx.try_send(Outbound::Ping).is_ok()
    }

    /// Ask the writer to send a Close frame.
    ///
    /// Returns `false` when the writer is already gone.
    pub fn request_close(&self) -> bool {
        match self.tx.try_send(Outbound::Close) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                // Queue saturated; the writer is aborted after the close bound anyway.
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Total frames that could not be enqueued for this session.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound activity (any frame, including Pong).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    /// Check and reset the activity flag.
    ///
    /// Returns `true` if the peer showed activity since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last inbound frame (or admission).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Session age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Signal the receive loop to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the session has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}
