//! Registry of sessions eligible to receive broadcasts.
//!
//! Membership is a `BTreeMap` keyed by [`SessionId`]; ids are allocated in
//! admission order, so iteration follows insertion order. The lock is held
//! only to mutate or to copy out a snapshot of `Arc` handles. Visitors and
//! broadcast writes run against the snapshot with the lock released, so a
//! slow broadcast never stalls admissions or retirements.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;

use super::session::{Session, SessionId, SessionState};
use crate::metrics::{
    RELAY_SESSION_DURATION_SECONDS, RELAY_SESSIONS_ACTIVE, RELAY_SESSIONS_ADMITTED_TOTAL,
    RELAY_SESSIONS_RETIRED_TOTAL,
};

/// Thread-safe, insertion-ordered set of live sessions.
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert a session. No-op (returns `false`) if it is already a member.
    pub fn add(&self, session: Arc<Session>) -> bool {
        match self.sessions.write().entry(session.id()) {
            Entry::Vacant(slot) => {
                let _ = slot.insert(session);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Remove a session. No-op (returns `false`) if it is not a member.
    pub fn remove(&self, id: SessionId) -> bool {
        self.sessions.write().remove(&id).is_some()
    }

    /// Whether `id` is currently a member.
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    /// Copy out the current members in admission order.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Visit every session that was a member when the call began.
    ///
    /// Membership may change while visiting; a visited session can already
    /// have been removed by the time the visitor sees it.
    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<Session>)) {
        for session in &self.snapshot() {
            visitor(session);
        }
    }

    /// Drop every member. Only used during shutdown.
    pub fn clear(&self) {
        self.sessions.write().clear();
    }

    /// Current member count. Advisory only.
    pub fn size(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether the registry has no members.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Admit a session and return the guard that retires it.
    ///
    /// The session moves to `Active` once it is a member. Dropping the
    /// returned [`Membership`] removes it again and marks it `Retired`,
    /// whichever way the owning task exits, including being aborted.
    pub fn admit(self: &Arc<Self>, session: Arc<Session>) -> Membership {
        let _ = self.add(Arc::clone(&session));
        session.set_state(SessionState::Active);
        counter!(RELAY_SESSIONS_ADMITTED_TOTAL).increment(1);
        gauge!(RELAY_SESSIONS_ACTIVE).increment(1.0);
        Membership {
            registry: Arc::clone(self),
            session,
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped registry membership for one session.
#[must_use = "dropping the membership retires the session immediately"]
pub struct Membership {
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
}

impl Membership {
    /// The admitted session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        let _ = self.registry.remove(self.session.id());
        self.session.set_state(SessionState::Retired);
        counter!(RELAY_SESSIONS_RETIRED_TOTAL).increment(1);
        gauge!(RELAY_SESSIONS_ACTIVE).decrement(1.0);
        histogram!(RELAY_SESSION_DURATION_SECONDS).record(self.session.age().as_secs_f64());
    }
}
