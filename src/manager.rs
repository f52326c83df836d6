//! Session lifecycle: creation, expiry, deletion and shutdown

use crate::error::ProvisionError;
use crate::prober::ReadinessProber;
use crate::provisioner::Provisioner;
use crate::registry::{RegistryEntry, SessionPhase, SessionRegistry};
use crate::session::{generate_session_id, Session};
use crate::status::StatusResponse;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Attempts at drawing an unused session id before giving up
const ID_ATTEMPTS: usize = 4;

/// How long shutdown waits for in-flight provisioning to settle
const PROVISION_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionReason {
    /// TTL elapsed
    Expired,
    /// Operator request through the admin API
    Requested,
    /// Gateway shutdown
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub ttl: Duration,
    /// Return from creation before provisioning finishes
    pub provision_in_background: bool,
}

pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    provisioner: Arc<Provisioner>,
    prober: ReadinessProber,
    settings: ManagerSettings,
    closing: AtomicBool,
    in_flight: AtomicUsize,
    settled: Notify,
    weak_self: Weak<SessionManager>,
}

/// Counts one provisioning attempt as in flight until dropped
struct InFlight(Arc<SessionManager>);

impl InFlight {
    fn enter(manager: Arc<SessionManager>) -> Self {
        manager.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(manager)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.settled.notify_waiters();
        }
    }
}

impl SessionManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        provisioner: Arc<Provisioner>,
        prober: ReadinessProber,
        settings: ManagerSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            registry,
            provisioner,
            prober,
            settings,
            closing: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            settled: Notify::new(),
            weak_self: weak_self.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn ttl(&self) -> Duration {
        self.settings.ttl
    }

    /// Create a new session.
    ///
    /// Inline mode returns once the session is live. Background mode registers
    /// the session as provisioning and returns immediately. Either way the
    /// attempt runs on its own task, so it always reaches success or rollback
    /// even if the caller goes away.
    pub async fn create_session(&self) -> Result<Arc<Session>, ProvisionError> {
        let Some(manager) = self.weak_self.upgrade() else {
            return Err(ProvisionError::ShuttingDown);
        };

        // Counted before checking `closing` so shutdown cannot miss it
        let in_flight = InFlight::enter(Arc::clone(&manager));
        if self.closing.load(Ordering::SeqCst) {
            return Err(ProvisionError::ShuttingDown);
        }

        let session = self.reserve_session()?;
        let background = self.settings.provision_in_background;
        info!(session_id = %session.id, background, "Creating session");

        let provisioned = Arc::clone(&session);
        let task = tokio::spawn(async move {
            let _in_flight = in_flight;
            let result = manager.provision_and_promote(provisioned).await;
            if background {
                if let Err(e) = &result {
                    error!(error = %e, "Background provisioning failed");
                }
            }
            result
        });

        if background {
            return Ok(session);
        }

        match task.await {
            Ok(result) => result.map(|()| session),
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Provisioning task did not complete");
                Err(ProvisionError::Interrupted)
            }
        }
    }

    /// Draw a fresh id and register it as provisioning
    fn reserve_session(&self) -> Result<Arc<Session>, ProvisionError> {
        let mut last_id = String::new();
        for _ in 0..ID_ATTEMPTS {
            let session = Arc::new(Session::new(generate_session_id(), self.settings.ttl));
            if self.registry.begin_provisioning(Arc::clone(&session)) {
                return Ok(session);
            }
            warn!(session_id = %session.id, "Session id collision, drawing another");
            last_id = session.id.clone();
        }
        Err(ProvisionError::IdCollision(last_id))
    }

    async fn provision_and_promote(&self, session: Arc<Session>) -> Result<(), ProvisionError> {
        let endpoints = match self.provisioner.provision(&session).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                self.registry.abandon(&session.id);
                error!(session_id = %session.id, step = e.step().unwrap_or("-"), error = %e, "Session provisioning failed");
                return Err(e);
            }
        };
        session.set_endpoints(endpoints);

        if self.closing.load(Ordering::SeqCst) {
            info!(session_id = %session.id, "Gateway closing, discarding new session");
            self.registry.abandon(&session.id);
            session.stop_log_streams();
            self.provisioner.teardown(&session).await;
            return Err(ProvisionError::ShuttingDown);
        }

        if !self.registry.insert(Arc::clone(&session)) {
            // begin_provisioning reserved the id, so this only happens on misuse
            self.registry.abandon(&session.id);
            session.stop_log_streams();
            self.provisioner.teardown(&session).await;
            return Err(ProvisionError::IdCollision(session.id.clone()));
        }

        self.arm_deletion_timer(&session);
        info!(
            session_id = %session.id,
            entry = ?session.entry_address(),
            expires_at = %session.expires_at_utc,
            "Session live"
        );
        Ok(())
    }

    /// Schedule deletion at the session's expiry instant
    fn arm_deletion_timer(&self, session: &Arc<Session>) {
        let manager = self.weak_self.clone();
        let id = session.id.clone();
        let deadline = session.expires_at();

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(manager) = manager.upgrade() {
                manager.delete_session(&id, DeletionReason::Expired).await;
            }
        });
        session.set_deletion_timer(handle.abort_handle());
    }

    /// Remove a session and tear down its resources.
    ///
    /// Only the caller that removes the session from the registry performs
    /// teardown; every other concurrent or later call returns `false`.
    pub async fn delete_session(&self, id: &str, reason: DeletionReason) -> bool {
        let Some(session) = self.registry.remove(id) else {
            debug!(session_id = %id, ?reason, "Session already gone");
            return false;
        };

        if let Some(timer) = session.take_deletion_timer() {
            // An expiring timer is the task running this call
            if reason != DeletionReason::Expired {
                timer.abort();
            }
        }

        info!(session_id = %id, ?reason, "Deleting session");
        session.stop_log_streams();
        self.provisioner.teardown(&session).await;
        info!(session_id = %id, "Session cleanup completed");
        true
    }

    pub fn lookup(&self, id: &str) -> Option<RegistryEntry> {
        self.registry.get(id)
    }

    pub async fn is_ready(&self, session: &Session) -> bool {
        self.prober.is_ready(session).await
    }

    /// Current status as reported to polling clients
    pub async fn status(&self, id: &str) -> StatusResponse {
        let Some(entry) = self.registry.get(id) else {
            return StatusResponse::missing(id);
        };

        let ready = match entry.phase {
            SessionPhase::Provisioning => false,
            SessionPhase::Live => self.prober.is_ready(&entry.session).await,
        };

        StatusResponse {
            exists: true,
            ready,
            session_id: id.to_string(),
            seconds_left: entry.session.seconds_left(),
        }
    }

    /// Number of provisioning attempts that have not finished yet
    pub fn provisioning_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no provisioning attempt is running
    async fn wait_for_provisioning(&self) {
        loop {
            let settled = self.settled.notified();
            let pending = self.in_flight.load(Ordering::SeqCst);
            if pending == 0 {
                return;
            }
            debug!(pending, "Waiting for in-flight provisioning");
            settled.await;
        }
    }

    /// Stop accepting new sessions, let in-flight provisioning finish or roll
    /// back, then tear down every live session
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);

        let pending = self.provisioning_in_flight();
        if pending > 0 {
            info!(pending, "Waiting for sessions still provisioning");
            if tokio::time::timeout(PROVISION_DRAIN_TIMEOUT, self.wait_for_provisioning())
                .await
                .is_err()
            {
                warn!(
                    pending = self.provisioning_in_flight(),
                    timeout_secs = PROVISION_DRAIN_TIMEOUT.as_secs(),
                    "Provisioning still running at shutdown; its resources may need manual cleanup"
                );
            }
        }

        let sessions = self.registry.drain();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "Tearing down live sessions");

        let teardowns = sessions.into_iter().map(|session| async move {
            if let Some(timer) = session.take_deletion_timer() {
                timer.abort();
            }
            session.stop_log_streams();
            self.provisioner.teardown(&session).await;
        });
        futures::future::join_all(teardowns).await;
        info!("All sessions torn down");
    }
}
