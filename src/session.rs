//! Session identity, derived infrastructure names and per-session state
//!
//! A session id is the public routing key. Every runtime resource that belongs
//! to a session (network, containers, compose project) is named from the
//! sanitized form of that id, so the names can always be recomputed from the id
//! alone.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Random bytes drawn for every session id before encoding
pub const SESSION_ID_BYTES: usize = 32;

/// Upper bound for a sanitized id, leaving room for resource name prefixes
pub const MAX_SANITIZED_LEN: usize = 60;

/// Used when sanitizing leaves nothing usable
pub const FALLBACK_NAME: &str = "session";

/// Generate a new opaque, URL-safe session id
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Derive a container/network-name-safe token from a session id.
///
/// Lowercases, keeps `[a-z0-9]`, collapses every run of other characters
/// into a single `-`, trims separators from both ends and caps the length.
/// Never returns an empty string.
pub fn sanitize_id(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut last_was_separator = true;

    for ch in input.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            output.push(ch);
            last_was_separator = false;
        } else if !last_was_separator {
            output.push('-');
            last_was_separator = true;
        }
    }

    let mut output = output.trim_matches('-').to_string();
    if output.len() > MAX_SANITIZED_LEN {
        output.truncate(MAX_SANITIZED_LEN);
        output = output.trim_end_matches('-').to_string();
    }

    if output.is_empty() {
        return FALLBACK_NAME.to_string();
    }
    output
}

/// A container role within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Externally facing entry point the gateway proxies to
    Dashboard,
    /// Terminal relay bridging the session to the shared backend service
    Relay,
    /// Client process driven by the dashboard
    Client,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Dashboard, Role::Relay, Role::Client];

    /// Prefix of the per-session container name for this role
    pub fn container_prefix(&self) -> &'static str {
        match self {
            Role::Dashboard => "dashboard",
            Role::Relay => "void-proxy",
            Role::Client => "client",
        }
    }

    /// Service name this role carries in a compose file
    pub fn compose_service(&self) -> &'static str {
        match self {
            Role::Dashboard => "dashboard",
            Role::Relay => "void",
            Role::Client => "client",
        }
    }

    pub fn from_compose_service(service: &str) -> Option<Role> {
        Role::ALL
            .into_iter()
            .find(|role| role.compose_service() == service)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Dashboard => write!(f, "dashboard"),
            Role::Relay => write!(f, "relay"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Runtime resource names derived from a session id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionNames {
    pub sanitized_id: String,
    pub network: String,
    pub dashboard: String,
    pub relay: String,
    pub client: String,
    /// Compose project name (compose provisioning only)
    pub project: String,
}

impl SessionNames {
    pub fn derive(session_id: &str) -> Self {
        let sanitized_id = sanitize_id(session_id);
        Self {
            network: format!("sess-{}", sanitized_id),
            dashboard: format!("{}-{}", Role::Dashboard.container_prefix(), sanitized_id),
            relay: format!("{}-{}", Role::Relay.container_prefix(), sanitized_id),
            client: format!("{}-{}", Role::Client.container_prefix(), sanitized_id),
            project: sanitized_id.clone(),
            sanitized_id,
        }
    }

    pub fn container(&self, role: Role) -> &str {
        match role {
            Role::Dashboard => &self.dashboard,
            Role::Relay => &self.relay,
            Role::Client => &self.client,
        }
    }
}

/// Addresses of a provisioned session, known once provisioning succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpoints {
    /// host:port the gateway forwards traffic to
    pub entry: String,
    /// host:port targets that must all answer before the session counts as ready
    pub probe_targets: Vec<String>,
}

/// Cached result of the last readiness probe
#[derive(Debug, Clone, Default)]
pub struct ReadinessCache {
    pub last_check: Option<Instant>,
    pub last_ready: bool,
    pub last_not_ready_log: Option<Instant>,
}

/// One ephemeral session
pub struct Session {
    pub id: String,
    pub names: SessionNames,
    pub created_at: DateTime<Utc>,
    pub expires_at_utc: DateTime<Utc>,
    expires_at: Instant,
    endpoints: RwLock<Option<SessionEndpoints>>,
    pub(crate) readiness: Mutex<ReadinessCache>,
    /// Serializes fresh probes so one cache window costs at most one probe
    pub(crate) probe_lock: tokio::sync::Mutex<()>,
    deletion_timer: Mutex<Option<AbortHandle>>,
    log_streams: Mutex<Vec<watch::Sender<bool>>>,
}

impl Session {
    pub fn new(id: String, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let expires_at_utc = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            names: SessionNames::derive(&id),
            id,
            created_at,
            expires_at_utc,
            expires_at: Instant::now() + ttl,
            endpoints: RwLock::new(None),
            readiness: Mutex::new(ReadinessCache::default()),
            probe_lock: tokio::sync::Mutex::new(()),
            deletion_timer: Mutex::new(None),
            log_streams: Mutex::new(Vec::new()),
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Whole seconds until expiry, saturating at zero
    pub fn seconds_left(&self) -> u64 {
        self.expires_at
            .saturating_duration_since(Instant::now())
            .as_secs()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn endpoints(&self) -> Option<SessionEndpoints> {
        self.endpoints.read().clone()
    }

    pub fn set_endpoints(&self, endpoints: SessionEndpoints) {
        *self.endpoints.write() = Some(endpoints);
    }

    /// Entry address, if provisioning has completed
    pub fn entry_address(&self) -> Option<String> {
        self.endpoints.read().as_ref().map(|e| e.entry.clone())
    }

    pub fn readiness_snapshot(&self) -> ReadinessCache {
        self.readiness.lock().clone()
    }

    /// Cached readiness if the last probe is younger than `window`
    pub fn cached_readiness(&self, window: Duration) -> Option<bool> {
        let cache = self.readiness.lock();
        cache
            .last_check
            .filter(|checked| checked.elapsed() < window)
            .map(|_| cache.last_ready)
    }

    pub fn set_deletion_timer(&self, handle: AbortHandle) {
        if let Some(previous) = self.deletion_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn take_deletion_timer(&self) -> Option<AbortHandle> {
        self.deletion_timer.lock().take()
    }

    pub fn attach_log_stream(&self, shutdown: watch::Sender<bool>) {
        self.log_streams.lock().push(shutdown);
    }

    /// Signal every container log follower of this session to stop
    pub fn stop_log_streams(&self) {
        for shutdown in self.log_streams.lock().drain(..) {
            let _ = shutdown.send(true);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("names", &self.names)
            .field("created_at", &self.created_at)
            .field("expires_at_utc", &self.expires_at_utc)
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_runtime_safe(name: &str) -> bool {
        name.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }

    #[test]
    fn test_generated_ids_are_url_safe_and_unique() {
        let a = generate_session_id();
        let b = generate_session_id();

        assert_ne!(a, b);
        // 32 bytes -> 43 chars of unpadded base64
        assert_eq!(a.len(), 43);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_sanitized_generated_ids_are_safe_and_bounded() {
        for _ in 0..500 {
            let id = generate_session_id();
            let sanitized = sanitize_id(&id);

            assert!(!sanitized.is_empty());
            assert!(sanitized.len() <= MAX_SANITIZED_LEN);
            assert!(is_runtime_safe(&sanitized), "unsafe name: {}", sanitized);
            assert!(!sanitized.starts_with('-') && !sanitized.ends_with('-'));
        }
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for _ in 0..200 {
            let once = sanitize_id(&generate_session_id());
            assert_eq!(sanitize_id(&once), once);
        }
        assert_eq!(sanitize_id("abc-123"), "abc-123");
    }

    #[test]
    fn test_sanitize_collapses_and_lowercases() {
        assert_eq!(sanitize_id("AbC__dE--f"), "abc-de-f");
        assert_eq!(sanitize_id("-_leading.and.trailing_-"), "leading-and-trailing");
    }

    #[test]
    fn test_sanitize_empty_falls_back() {
        assert_eq!(sanitize_id(""), FALLBACK_NAME);
        assert_eq!(sanitize_id("___---"), FALLBACK_NAME);
        assert_eq!(sanitize_id("äöü"), FALLBACK_NAME);
    }

    #[test]
    fn test_sanitize_caps_length_without_trailing_separator() {
        let long = format!("{}_{}", "a".repeat(59), "b".repeat(20));
        let sanitized = sanitize_id(&long);
        assert_eq!(sanitized, "a".repeat(59));

        let exact = "x".repeat(80);
        assert_eq!(sanitize_id(&exact).len(), MAX_SANITIZED_LEN);
    }

    #[test]
    fn test_names_are_pure_function_of_id() {
        let first = SessionNames::derive("Session_ID-1");
        let second = SessionNames::derive("Session_ID-1");
        assert_eq!(first, second);

        assert_eq!(first.sanitized_id, "session-id-1");
        assert_eq!(first.network, "sess-session-id-1");
        assert_eq!(first.dashboard, "dashboard-session-id-1");
        assert_eq!(first.relay, "void-proxy-session-id-1");
        assert_eq!(first.client, "client-session-id-1");
        assert_eq!(first.project, "session-id-1");
        assert_eq!(first.container(Role::Relay), first.relay);
    }

    #[test]
    fn test_role_compose_service_mapping() {
        assert_eq!(Role::from_compose_service("dashboard"), Some(Role::Dashboard));
        assert_eq!(Role::from_compose_service("void"), Some(Role::Relay));
        assert_eq!(Role::from_compose_service("client"), Some(Role::Client));
        assert_eq!(Role::from_compose_service("db"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seconds_left_counts_down_to_zero() {
        let session = Session::new("abc".to_string(), Duration::from_secs(10));
        assert!(session.expires_at_utc > session.created_at);
        assert_eq!(session.seconds_left(), 10);

        tokio::time::advance(Duration::from_millis(2500)).await;
        assert_eq!(session.seconds_left(), 7);
        assert!(!session.is_expired());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(session.seconds_left(), 0);
        assert!(session.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_readiness_respects_window() {
        let session = Session::new("abc".to_string(), Duration::from_secs(60));
        assert_eq!(session.cached_readiness(Duration::from_secs(1)), None);

        {
            let mut cache = session.readiness.lock();
            cache.last_check = Some(Instant::now());
            cache.last_ready = true;
        }
        assert_eq!(session.cached_readiness(Duration::from_secs(1)), Some(true));

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(session.cached_readiness(Duration::from_secs(1)), None);
    }

    #[test]
    fn test_stop_log_streams_signals_followers() {
        let session = Session::new("abc".to_string(), Duration::from_secs(60));
        let (tx, rx) = watch::channel(false);
        session.attach_log_stream(tx);

        session.stop_log_streams();
        assert!(*rx.borrow());
    }
}
