//! Fan-out of one text payload to every registry member.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use futures::future::join_all;
use metrics::counter;
use tracing::{debug, warn};

use super::registry::SessionRegistry;
use super::session::{Session, SessionId};
use crate::errors::SendError;
use crate::metrics::{
    RELAY_BROADCAST_DELIVERIES_TOTAL, RELAY_BROADCAST_FAILURES_TOTAL,
    RELAY_BROADCAST_SKIPPED_TOTAL,
};

/// Outcome of a single broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members in the snapshot.
    pub recipients: usize,
    /// Frames enqueued successfully.
    pub delivered: usize,
    /// Members skipped (failed liveness check or excluded sender).
    pub skipped: usize,
    /// Members whose queue was closed or stayed full past the write bound.
    pub failed: usize,
}

/// Relay `payload` to every live member of `registry`.
///
/// Writes run concurrently against a snapshot, each bounded by
/// `write_timeout`. A failed write is logged and counted for that recipient
/// only; the recipient stays registered until its own receive loop retires
/// it. A recipient whose queue stayed full for the whole bound is cancelled,
/// so later broadcasts skip it instead of paying the bound again.
/// `exclude` suppresses delivery to one session (the sender, when self-echo
/// is disabled).
pub async fn broadcast(
    registry: &SessionRegistry,
    payload: &Utf8Bytes,
    exclude: Option<SessionId>,
    write_timeout: Duration,
) -> BroadcastReport {
    let members = registry.snapshot();
    let mut report = BroadcastReport {
        recipients: members.len(),
        ..BroadcastReport::default()
    };

    let targets: Vec<&Arc<Session>> = members
        .iter()
        .filter(|s| Some(s.id()) != exclude && s.is_open())
        .collect();
    report.skipped = members.len() - targets.len();

    let results = join_all(
        targets
            .iter()
            .map(|s| s.send_text(payload.clone(), write_timeout)),
    )
    .await;

    for (session, result) in targets.iter().zip(results) {
        match result {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.failed += 1;
                let reason = match e {
                    SendError::Closed => "closed",
                    SendError::TimedOut(_) => {
                        session.cancel();
                        "timed_out"
                    }
                };
                counter!(RELAY_BROADCAST_FAILURES_TOTAL, "reason" => reason).increment(1);
                warn!(
                    recipient = %session.id(),
                    error = %e,
                    total_drops = session.drop_count(),
                    "failed to relay frame to session"
                );
            }
        }
    }

    counter!(RELAY_BROADCAST_DELIVERIES_TOTAL).increment(report.delivered as u64);
    counter!(RELAY_BROADCAST_SKIPPED_TOTAL).increment(report.skipped as u64);
    debug!(
        bytes = payload.as_str().len(),
        recipients = report.recipients,
        delivered = report.delivered,
        skipped = report.skipped,
        failed = report.failed,
        "broadcast frame"
    );
    report
}
