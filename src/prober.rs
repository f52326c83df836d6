//! Readiness probing for session entry points
//!
//! A session is ready when every one of its probe targets answers. Results are
//! cached per session for a short window so polling clients and the proxy
//! never trigger more than one probe per window.

use crate::pool::ConnectionPool;
use crate::session::Session;
use async_trait::async_trait;
use hyper::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const CACHE_WINDOW: Duration = Duration::from_secs(1);
pub const TCP_PROBE_TIMEOUT: Duration = Duration::from_millis(200);
pub const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Minimum spacing between "still not ready" log lines per session
pub const NOT_READY_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// A single reachability check against a `host:port` target
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    async fn check(&self, target: &str) -> Result<(), String>;
}

/// Ready when a TCP connection can be opened
pub struct TcpConnectCheck {
    timeout: Duration,
}

impl TcpConnectCheck {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnectCheck {
    fn default() -> Self {
        Self::new(TCP_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl ReadinessCheck for TcpConnectCheck {
    async fn check(&self, target: &str) -> Result<(), String> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("connect timed out after {:?}", self.timeout)),
        }
    }
}

/// Ready when `GET /` answers 200
pub struct HttpHealthCheck {
    pool: Arc<ConnectionPool>,
    path: String,
    timeout: Duration,
}

impl HttpHealthCheck {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            path: "/".to_string(),
            timeout: HTTP_PROBE_TIMEOUT,
        }
    }
}

#[async_trait]
impl ReadinessCheck for HttpHealthCheck {
    async fn check(&self, target: &str) -> Result<(), String> {
        match self.pool.probe(target, &self.path, self.timeout).await {
            Ok(StatusCode::OK) => Ok(()),
            Ok(status) => Err(format!("unexpected status {}", status)),
            Err(e) => Err(e.to_string()),
        }
    }
}

pub struct ReadinessProber {
    check: Arc<dyn ReadinessCheck>,
    cache_window: Duration,
    log_interval: Duration,
}

impl ReadinessProber {
    pub fn new(check: Arc<dyn ReadinessCheck>) -> Self {
        Self {
            check,
            cache_window: CACHE_WINDOW,
            log_interval: NOT_READY_LOG_INTERVAL,
        }
    }

    pub fn with_cache_window(mut self, window: Duration) -> Self {
        self.cache_window = window;
        self
    }

    /// Whether the session's entry point currently accepts connections.
    /// Sessions without endpoints (still provisioning) are never ready.
    pub async fn is_ready(&self, session: &Session) -> bool {
        let Some(endpoints) = session.endpoints() else {
            return false;
        };

        if let Some(ready) = session.cached_readiness(self.cache_window) {
            return ready;
        }

        let _probe = session.probe_lock.lock().await;
        // Another caller may have refreshed the cache while we waited
        if let Some(ready) = session.cached_readiness(self.cache_window) {
            return ready;
        }

        let mut failure = None;
        for target in &endpoints.probe_targets {
            if let Err(e) = self.check.check(target).await {
                failure = Some((target.clone(), e));
                break;
            }
        }

        let ready = failure.is_none();
        self.record(session, ready, failure);
        ready
    }

    fn record(&self, session: &Session, ready: bool, failure: Option<(String, String)>) {
        let now = Instant::now();
        let mut cache = session.readiness.lock();
        let first_probe = cache.last_check.is_none();

        match (cache.last_ready, ready) {
            (false, true) => {
                info!(session_id = %session.id, "Session is ready");
            }
            (true, false) => {
                let (probe_target, error) = failure.unwrap_or_default();
                warn!(session_id = %session.id, probe_target = %probe_target, error = %error, "Session became unreachable");
                cache.last_not_ready_log = Some(now);
            }
            (false, false) => {
                let due = cache
                    .last_not_ready_log
                    .map_or(true, |logged| now.duration_since(logged) >= self.log_interval);
                if first_probe || due {
                    let (probe_target, error) = failure.unwrap_or_default();
                    debug!(session_id = %session.id, probe_target = %probe_target, error = %error, "Session still not ready");
                    cache.last_not_ready_log = Some(now);
                }
            }
            (true, true) => {}
        }

        cache.last_check = Some(now);
        cache.last_ready = ready;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEndpoints;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingCheck {
        calls: AtomicUsize,
        ready: AtomicBool,
    }

    impl CountingCheck {
        fn new(ready: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                ready: AtomicBool::new(ready),
            })
        }
    }

    #[async_trait]
    impl ReadinessCheck for CountingCheck {
        async fn check(&self, _target: &str) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.ready.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err("connection refused".to_string())
            }
        }
    }

    fn live_session(targets: &[&str]) -> Session {
        let session = Session::new("abc".to_string(), Duration::from_secs(60));
        session.set_endpoints(SessionEndpoints {
            entry: targets[0].to_string(),
            probe_targets: targets.iter().map(|t| t.to_string()).collect(),
        });
        session
    }

    #[tokio::test]
    async fn test_session_without_endpoints_is_not_ready() {
        let check = CountingCheck::new(true);
        let prober = ReadinessProber::new(check.clone());
        let session = Session::new("abc".to_string(), Duration::from_secs(60));

        assert!(!prober.is_ready(&session).await);
        assert_eq!(check.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_probe_per_cache_window() {
        let check = CountingCheck::new(false);
        let prober = ReadinessProber::new(check.clone());
        let session = live_session(&["127.0.0.1:1"]);

        for _ in 0..10 {
            assert!(!prober.is_ready(&session).await);
        }
        assert_eq!(check.calls.load(Ordering::SeqCst), 1);

        check.ready.store(true, Ordering::SeqCst);
        // Still cached
        assert!(!prober.is_ready(&session).await);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(prober.is_ready(&session).await);
        assert_eq!(check.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_probe() {
        let check = CountingCheck::new(true);
        let prober = Arc::new(ReadinessProber::new(check.clone()));
        let session = Arc::new(live_session(&["127.0.0.1:1"]));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let prober = Arc::clone(&prober);
                let session = Arc::clone(&session);
                tokio::spawn(async move { prober.is_ready(&session).await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(check.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_every_target_must_answer() {
        let check = CountingCheck::new(true);
        let prober = ReadinessProber::new(check.clone()).with_cache_window(Duration::ZERO);
        let session = live_session(&["a:80", "b:80", "c:80"]);

        assert!(prober.is_ready(&session).await);
        assert_eq!(check.calls.load(Ordering::SeqCst), 3);

        check.ready.store(false, Ordering::SeqCst);
        assert!(!prober.is_ready(&session).await);
        // Stops at the first failing target
        assert_eq!(check.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_log_is_rate_limited() {
        let check = CountingCheck::new(false);
        let prober = ReadinessProber::new(check.clone());
        let session = live_session(&["127.0.0.1:1"]);

        prober.is_ready(&session).await;
        let first_log = session.readiness_snapshot().last_not_ready_log.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        prober.is_ready(&session).await;
        assert_eq!(session.readiness_snapshot().last_not_ready_log, Some(first_log));

        tokio::time::advance(Duration::from_secs(10)).await;
        prober.is_ready(&session).await;
        assert!(session.readiness_snapshot().last_not_ready_log.unwrap() > first_log);
    }

    #[tokio::test]
    async fn test_tcp_check_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let check = TcpConnectCheck::default();

        assert!(check.check(&addr).await.is_ok());

        drop(listener);
        assert!(check.check(&addr).await.is_err());
    }

    /// Answer every request with `status` after `delay`
    async fn serve_status(status: &'static str, delay: Duration) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    tokio::time::sleep(delay).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    fn http_check() -> HttpHealthCheck {
        HttpHealthCheck::new(Arc::new(ConnectionPool::new(Default::default())))
    }

    #[tokio::test]
    async fn test_http_check_accepts_ok() {
        let addr = serve_status("200 OK", Duration::ZERO).await;
        assert!(http_check().check(&addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_check_rejects_other_statuses() {
        let addr = serve_status("502 Bad Gateway", Duration::ZERO).await;
        let err = http_check().check(&addr).await.unwrap_err();
        assert!(err.contains("502"), "error: {}", err);
    }

    #[tokio::test]
    async fn test_http_check_times_out_slow_targets() {
        let addr = serve_status("200 OK", Duration::from_secs(3)).await;

        let started = std::time::Instant::now();
        assert!(http_check().check(&addr).await.is_err());
        let elapsed = started.elapsed();
        assert!(elapsed >= HTTP_PROBE_TIMEOUT, "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_http_readiness_requires_every_service() {
        let dashboard = serve_status("200 OK", Duration::ZERO).await;
        let relay = serve_status("200 OK", Duration::ZERO).await;
        let client = serve_status("503 Service Unavailable", Duration::ZERO).await;

        let prober = ReadinessProber::new(Arc::new(http_check()));
        let session = live_session(&[dashboard.as_str(), relay.as_str(), client.as_str()]);
        assert!(!prober.is_ready(&session).await);

        let ready = live_session(&[dashboard.as_str(), relay.as_str()]);
        assert!(prober.is_ready(&ready).await);
    }
}
