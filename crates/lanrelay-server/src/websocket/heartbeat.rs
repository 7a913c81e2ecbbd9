//! Keep-alive pings and idle timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use super::session::Session;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer showed no activity within `timeout` of a ping.
    TimedOut,
    /// The session was cancelled by someone else.
    Cancelled,
}

/// Run keep-alive pings for a session.
///
/// Every `interval` the activity flag is reset and a Ping is queued. If no
/// inbound frame arrives within `timeout` of the ping the session is
/// cancelled and `HeartbeatResult::TimedOut` is returned; the receive loop
/// treats that like a closure and retires the session.
pub async fn run_heartbeat(
    session: Arc<Session>,
    interval: Duration,
    timeout: Duration,
) -> HeartbeatResult {
    let mut ticker = time::interval(interval);
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = session.cancelled() => return HeartbeatResult::Cancelled,
        }

        let _ = session.check_alive();
        // A saturated queue means traffic is flowing; skip this ping.
        let _ = session.ping();

        tokio::select! {
            () = time::sleep(timeout) => {}
            () = session.cancelled() => return HeartbeatResult::Cancelled,
        }

        if !session.check_alive() {
            session.cancel();
            return HeartbeatResult::TimedOut;
        }
    }
}
