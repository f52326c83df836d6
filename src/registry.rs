//! Concurrent session registry
//!
//! Holds live sessions and sessions still being provisioned behind a single
//! lock. The lock is only ever held for map operations, never across an await.

use crate::session::Session;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Lifecycle phase of a registered session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Registered while its containers are still being created
    Provisioning,
    /// Fully provisioned
    Live,
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub session: Arc<Session>,
    pub phase: SessionPhase,
}

#[derive(Default)]
struct RegistryState {
    live: HashMap<String, Arc<Session>>,
    provisioning: HashMap<String, Arc<Session>>,
}

impl RegistryState {
    fn contains(&self, id: &str) -> bool {
        self.live.contains_key(id) || self.provisioning.contains_key(id)
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a session in either phase
    pub fn get(&self, id: &str) -> Option<RegistryEntry> {
        let state = self.state.read();
        if let Some(session) = state.live.get(id) {
            return Some(RegistryEntry {
                session: Arc::clone(session),
                phase: SessionPhase::Live,
            });
        }
        state.provisioning.get(id).map(|session| RegistryEntry {
            session: Arc::clone(session),
            phase: SessionPhase::Provisioning,
        })
    }

    pub fn get_live(&self, id: &str) -> Option<Arc<Session>> {
        self.state.read().live.get(id).cloned()
    }

    /// Register a session that is about to be provisioned.
    /// Returns false if the id is already known in any phase.
    pub fn begin_provisioning(&self, session: Arc<Session>) -> bool {
        let mut state = self.state.write();
        if state.contains(&session.id) {
            return false;
        }
        state.provisioning.insert(session.id.clone(), session);
        true
    }

    /// Make a session live. Clears a matching provisioning entry.
    /// Returns false, leaving the registry untouched, if a live session with
    /// the same id already exists.
    pub fn insert(&self, session: Arc<Session>) -> bool {
        let mut state = self.state.write();
        if state.live.contains_key(&session.id) {
            return false;
        }
        state.provisioning.remove(&session.id);
        state.live.insert(session.id.clone(), session);
        true
    }

    /// Drop a provisioning entry whose creation failed
    pub fn abandon(&self, id: &str) -> Option<Arc<Session>> {
        self.state.write().provisioning.remove(id)
    }

    /// Remove a live session. Only the first caller for a given id gets it back.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.state.write().live.remove(id)
    }

    /// Remove and return every live session
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.state.write().live.drain().map(|(_, s)| s).collect()
    }

    /// Snapshot of all live sessions
    pub fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.state.read().live.values().cloned().collect()
    }

    /// Snapshot of sessions still being provisioned
    pub fn provisioning_sessions(&self) -> Vec<Arc<Session>> {
        self.state.read().provisioning.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn provisioning_count(&self) -> usize {
        self.state.read().provisioning.len()
    }
}
