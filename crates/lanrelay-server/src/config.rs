//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::RelayError;

/// Routes served next to the upgrade path.
const RESERVED_PATHS: [&str; 2] = ["/health", "/metrics"];

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `8080`, `0` for auto-assign).
    pub port: u16,
    /// Path at which `WebSocket` upgrades are accepted.
    pub path: String,
    /// Interval between keep-alive Pings, in milliseconds.
    pub ping_interval_ms: u64,
    /// How long a peer has to show activity after a ping, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Max `WebSocket` message/frame size in bytes. `None` means unlimited.
    pub max_message_size: Option<usize>,
    /// Depth of each session's outbound queue.
    pub send_queue_capacity: usize,
    /// Upper bound on a single recipient write during broadcast, in milliseconds.
    pub write_timeout_ms: u64,
    /// Grace period given to in-flight work on `stop()`, in milliseconds.
    pub shutdown_grace_ms: u64,
    /// Upper bound on the close handshake during teardown, in milliseconds.
    pub close_timeout_ms: u64,
    /// Whether a sender receives its own messages.
    pub echo_to_sender: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            path: "/".into(),
            ping_interval_ms: 60_000,
            idle_timeout_ms: 15_000,
            max_message_size: None,
            send_queue_capacity: 1024,
            write_timeout_ms: 5_000,
            shutdown_grace_ms: 5_000,
            close_timeout_ms: 1_000,
            echo_to_sender: true,
        }
    }
}

impl ServerConfig {
    /// `host:port` string handed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Keep-alive ping interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Idle timeout after a ping.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Per-recipient write bound.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Close handshake bound.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), RelayError> {
        if !self.path.starts_with('/') {
            return Err(RelayError::InvalidConfig(format!(
                "path must start with '/': {:?}",
                self.path
            )));
        }
        if RESERVED_PATHS.contains(&self.path.as_str()) {
            return Err(RelayError::InvalidConfig(format!(
                "path {:?} is reserved",
                self.path
            )));
        }
        if self.send_queue_capacity == 0 {
            return Err(RelayError::InvalidConfig(
                "send_queue_capacity must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("ping_interval_ms", self.ping_interval_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
        ] {
            if value == 0 {
                return Err(RelayError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}
