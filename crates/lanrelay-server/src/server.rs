//! `RelayServer`: Axum `WebSocket` relay.
//!
//! Server lifecycle: `Stopped → Starting → Running → Stopping → Stopped`.
//! [`RelayServer::start`] blocks the calling task for the whole time the
//! server runs; embedders that must stay responsive spawn it on a task of
//! their own and call [`RelayServer::stop`] from elsewhere.

use std::fmt;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::errors::RelayError;
use crate::health::{self, HealthResponse};
use crate::metrics::RELAY_ADMISSION_FAILURES_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::connection::{ConnectionContext, run_connection};
use crate::websocket::registry::SessionRegistry;

/// Server-wide lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Not listening.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// Draining the accept loop and sessions.
    Stopping,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

struct Lifecycle {
    state: ServerState,
    /// Replaced on every start so a stopped server can run again.
    shutdown: Arc<ShutdownCoordinator>,
    local_addr: Option<SocketAddr>,
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
struct AppState {
    connection: ConnectionContext,
    tracker: TaskTracker,
    lifecycle: Arc<Mutex<Lifecycle>>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

/// The relay server.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    /// Tracks the accept loop and every connection task.
    tracker: TaskTracker,
    lifecycle: Arc<Mutex<Lifecycle>>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl RelayServer {
    /// Create a new, stopped server.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            tracker: TaskTracker::new(),
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: ServerState::Stopped,
                shutdown: Arc::new(ShutdownCoordinator::new()),
                local_addr: None,
            })),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve Prometheus text at `/metrics` from this handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.lifecycle.lock().state
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().local_addr
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let coordinator = Arc::clone(&self.lifecycle.lock().shutdown);
        self.build_router(&coordinator)
    }

    fn build_router(&self, coordinator: &ShutdownCoordinator) -> Router {
        let state = AppState {
            connection: ConnectionContext {
                registry: Arc::clone(&self.registry),
                config: Arc::clone(&self.config),
                shutdown: coordinator.token(),
                force: coordinator.force_token(),
            },
            tracker: self.tracker.clone(),
            lifecycle: Arc::clone(&self.lifecycle),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(&self.config.path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    /// Bind the listener and serve until [`stop`](Self::stop) is called.
    ///
    /// Blocks the calling task for the server's entire lifetime. Only
    /// listener-level failures are returned; per-session errors stay inside
    /// their connection.
    pub async fn start(&self) -> Result<(), RelayError> {
        let (listener, _) = self.bind().await?;
        self.serve(listener).await
    }

    /// Bind the listener and serve on a spawned task.
    ///
    /// Returns the bound address (useful with port `0`) and the handle of
    /// the accept loop, which resolves once the server stops.
    pub async fn listen(
        self: &Arc<Self>,
    ) -> Result<(SocketAddr, JoinHandle<Result<(), RelayError>>), RelayError> {
        let (listener, addr) = self.bind().await?;
        let server = Arc::clone(self);
        let handle = tokio::spawn(async move { server.serve(listener).await });
        Ok((addr, handle))
    }

    async fn bind(&self) -> Result<(TcpListener, SocketAddr), RelayError> {
        self.config.validate()?;
        {
            let mut lc = self.lifecycle.lock();
            if lc.state != ServerState::Stopped {
                return Err(RelayError::AlreadyRunning(lc.state));
            }
            lc.state = ServerState::Starting;
            lc.shutdown = Arc::new(ShutdownCoordinator::new());
        }

        let addr = self.config.bind_addr();
        let bound = match TcpListener::bind(&addr).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local)),
            Err(e) => Err(e),
        };

        let mut lc = self.lifecycle.lock();
        match bound {
            Ok((listener, local)) => {
                // A stop() that raced the bind leaves the state alone; serve()
                // then sees a cancelled token and returns at once.
                if lc.state == ServerState::Starting {
                    lc.state = ServerState::Running;
                    lc.local_addr = Some(local);
                }
                info!(addr = %local, path = %self.config.path, "relay server listening");
                Ok((listener, local))
            }
            Err(source) => {
                lc.state = ServerState::Stopped;
                let err = RelayError::Bind { addr, source };
                error!(category = err.category(), error = %err, "failed to bind listener");
                Err(err)
            }
        }
    }

    async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        let coordinator = Arc::clone(&self.lifecycle.lock().shutdown);
        let router = self.build_router(&coordinator);
        let graceful = coordinator.token().cancelled_owned();
        let force = coordinator.force_token();
        let accept = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .into_future();

        let result = self
            .tracker
            .track_future(async move {
                tokio::select! {
                    result = accept => result,
                    () = force.cancelled() => Ok(()),
                }
            })
            .await;

        match result {
            Ok(()) => {
                debug!("accept loop finished");
                Ok(())
            }
            Err(e) => {
                let err = RelayError::Serve(e);
                error!(category = err.category(), error = %err, "accept loop failed");
                self.stop().await;
                Err(err)
            }
        }
    }

    /// Stop accepting, drain sessions within the grace period, then clear
    /// the registry.
    ///
    /// Sessions get a Close frame. Connections still running when the grace
    /// period ends are force-closed: their tasks are dropped and the
    /// membership guards retire them. Calling `stop()` on a server that is
    /// not running is a no-op.
    pub async fn stop(&self) {
        let coordinator = {
            let mut lc = self.lifecycle.lock();
            match lc.state {
                ServerState::Starting | ServerState::Running => {}
                state => {
                    debug!(%state, "stop requested while not running");
                    return;
                }
            }
            lc.state = ServerState::Stopping;
            Arc::clone(&lc.shutdown)
        };

        info!(sessions = self.registry.size(), "stopping relay server");
        let drained = coordinator
            .graceful_shutdown(&self.tracker, self.config.shutdown_grace())
            .await;
        if !drained {
            // The force token is out; stragglers only have to unwind.
            let unwound = tokio::time::timeout(self.config.close_timeout(), self.tracker.wait())
                .await
                .is_ok();
            if !unwound {
                warn!(remaining = self.tracker.len(), "tasks still running after force-close");
            }
        }
        self.registry.clear();
        let _ = self.tracker.reopen();

        let mut lc = self.lifecycle.lock();
        lc.state = ServerState::Stopped;
        lc.local_addr = None;
        info!(drained, "relay server stopped");
    }
}

/// GET {path}: `WebSocket` upgrade into a relay session.
async fn ws_handler(
    State(state): State<AppState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(error = %rejection, "rejected websocket upgrade");
            counter!(RELAY_ADMISSION_FAILURES_TOTAL, "reason" => "rejected").increment(1);
            return rejection.into_response();
        }
    };
    if state.connection.shutdown.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let limit = state.connection.config.max_message_size.unwrap_or(usize::MAX);
    let tracker = state.tracker.clone();
    let ctx = state.connection.clone();
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .accept_unmasked_frames(true)
        .on_failed_upgrade(|error| {
            warn!(error = %error, "websocket upgrade failed");
            counter!(RELAY_ADMISSION_FAILURES_TOTAL, "reason" => "handshake").increment(1);
        })
        .on_upgrade(move |socket| tracker.track_future(run_connection(socket, ctx)))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let server_state = state.lifecycle.lock().state;
    let sessions = state.connection.registry.size();
    Json(health::health_check(state.start_time, server_state, sessions))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
