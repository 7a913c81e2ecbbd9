//! `WebSocket` connection lifecycle: admission, receive loop, teardown.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use super::broadcast::broadcast;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use super::registry::{Membership, SessionRegistry};
use super::session::{Outbound, Session, SessionId, SessionState};
use crate::config::ServerConfig;
use crate::metrics::{
    RELAY_ADMISSION_FAILURES_TOTAL, RELAY_FRAMES_IGNORED_TOTAL, RELAY_FRAMES_RECEIVED_TOTAL,
    RELAY_HEARTBEAT_TIMEOUTS_TOTAL,
};

/// Everything a connection needs from the server that accepted it.
#[derive(Clone)]
pub struct ConnectionContext {
    /// Shared session registry.
    pub registry: Arc<SessionRegistry>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Server shutdown token; each session gets a child of it.
    pub shutdown: CancellationToken,
    /// Fired when the shutdown grace period runs out; drops the connection outright.
    pub force: CancellationToken,
}

impl ConnectionContext {
    /// Admit `session` unless shutdown has already begun.
    ///
    /// An upgrade can complete after `stop()` has drained and cleared the
    /// registry; such a session must never become a member.
    pub fn admit(&self, session: Arc<Session>) -> Option<Membership> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        Some(self.registry.admit(session))
    }
}

/// Why a receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// Peer sent a Close frame.
    Closed,
    /// Stream ended without a Close frame.
    Disconnected,
    /// Transport error while reading.
    Error,
    /// Session cancelled (server stop, idle timeout, stalled writes, or writer failure).
    Cancelled,
}

impl fmt::Display for SessionExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Run one upgraded connection from admission through retirement.
///
/// 1. Admits the session into the registry (it receives broadcasts from here on,
///    including its own)
/// 2. Spawns the writer task draining the outbound queue into the socket
/// 3. Spawns keep-alive pings
/// 4. Relays every inbound text frame to all registry members
/// 5. On any exit path, sends a Close frame (bounded) and leaves the registry
///
/// If the server's force token fires first, the whole connection is dropped:
/// writer and heartbeat are aborted and the membership guard retires the
/// session.
pub async fn run_connection(socket: WebSocket, ctx: ConnectionContext) {
    let id = SessionId::next();
    let span = info_span!("session", session_id = %id);
    let force = ctx.force.clone();
    async move {
        tokio::select! {
            () = serve_session(socket, ctx, id) => {}
            () = force.cancelled() => warn!("session force-closed after shutdown grace"),
        }
    }
    .instrument(span)
    .await;
}

async fn serve_session(socket: WebSocket, ctx: ConnectionContext, id: SessionId) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (send_tx, send_rx) = mpsc::channel::<Outbound>(ctx.config.send_queue_capacity);
    let session = Arc::new(Session::new(id, send_tx, ctx.shutdown.child_token()));

    let Some(membership) = ctx.admit(Arc::clone(&session)) else {
        debug!("upgrade completed during shutdown, dropping connection");
        counter!(RELAY_ADMISSION_FAILURES_TOTAL, "reason" => "shutting_down").increment(1);
        return;
    };
    info!(sessions = ctx.registry.size(), "session admitted");

    let close_timeout = ctx.config.close_timeout();
    let mut writer = AbortOnDropHandle::new(tokio::spawn(
        run_writer(ws_tx, send_rx, Arc::clone(&session), close_timeout).in_current_span(),
    ));
    let heartbeat = AbortOnDropHandle::new(tokio::spawn(
        run_heartbeat(
            Arc::clone(&session),
            ctx.config.ping_interval(),
            ctx.config.idle_timeout(),
        )
        .in_current_span(),
    ));

    let exit = receive_loop(&mut ws_rx, &session, &ctx).await;

    session.set_state(SessionState::Closing);
    session.cancel();
    if let Ok(HeartbeatResult::TimedOut) = heartbeat.await {
        warn!(
            idle_ms = session.idle_for().as_millis() as u64,
            "peer missed keep-alive window"
        );
        counter!(RELAY_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
    }

    if session.request_close()
        && tokio::time::timeout(close_timeout, &mut writer)
            .await
            .is_err()
    {
        debug!("close handshake did not finish in time");
    }
    writer.abort();
    drop(ws_rx);

    drop(membership);
    info!(
        reason = %exit,
        age_ms = session.age().as_millis() as u64,
        dropped = session.drop_count(),
        sessions = ctx.registry.size(),
        "session retired"
    );
}

/// Pull frames until the peer goes away or the session is cancelled.
async fn receive_loop(
    ws_rx: &mut SplitStream<WebSocket>,
    session: &Arc<Session>,
    ctx: &ConnectionContext,
) -> SessionExit {
    let exclude = (!ctx.config.echo_to_sender).then_some(session.id());
    let write_timeout = ctx.config.write_timeout();

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = session.cancelled() => return SessionExit::Cancelled,
        };

        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(error = %e, "receive error");
                return SessionExit::Error;
            }
            None => return SessionExit::Disconnected,
        };
        session.mark_alive();

        match msg {
            Message::Text(payload) => {
                counter!(RELAY_FRAMES_RECEIVED_TOTAL).increment(1);
                let _ = broadcast(&ctx.registry, &payload, exclude, write_timeout).await;
            }
            Message::Binary(data) => {
                counter!(RELAY_FRAMES_IGNORED_TOTAL).increment(1);
                debug!(len = data.len(), "ignoring binary frame");
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(frame) => {
                debug!(
                    code = frame.as_ref().map(|f| f.code),
                    "peer sent close frame"
                );
                return SessionExit::Closed;
            }
        }
    }
}

/// Drain the outbound queue into the socket.
///
/// A failed socket write cancels the session so its receive loop retires it.
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    session: Arc<Session>,
    close_timeout: Duration,
) {
    while let Some(out) = rx.recv().await {
        let (msg, last) = match out {
            Outbound::Text(text) => (Message::Text(text), false),
            Outbound::Ping => (Message::Ping(Vec::new().into()), false),
            Outbound::Close => (
                Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "server closing".into(),
                })),
                true,
            ),
        };
        if let Err(e) = ws_tx.send(msg).await {
            debug!(error = %e, "socket write failed");
            session.cancel();
            break;
        }
        if last {
            break;
        }
    }
    // Queue closed or close sent; release the sink without blocking teardown.
    let _ = tokio::time::timeout(close_timeout, ws_tx.close()).await;
}
