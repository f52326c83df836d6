use crate::manager::{DeletionReason, SessionManager};
use crate::pool::PoolStats;
use crate::registry::SessionPhase;
use crate::session::Session;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

struct AdminContext {
    manager: Arc<SessionManager>,
    pool_stats: Arc<PoolStats>,
    auth_token: String,
}

/// Operator API, meant to be bound to loopback
pub struct AdminServer {
    bind_addr: SocketAddr,
    ctx: Arc<AdminContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<SessionManager>,
        pool_stats: Arc<PoolStats>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            ctx: Arc::new(AdminContext {
                manager,
                pool_stats,
                auth_token,
            }),
            shutdown_rx,
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.ctx.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, ctx).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, ctx: Arc<AdminContext>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let ctx = Arc::clone(&ctx);
        async move { handle_admin_request(req, ctx).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

fn session_json(session: &Session, phase: SessionPhase, now: Instant) -> serde_json::Value {
    let readiness = session.readiness_snapshot();
    let state = match phase {
        SessionPhase::Live => "live",
        SessionPhase::Provisioning => "provisioning",
    };
    serde_json::json!({
        "id": session.id,
        "state": state,
        "entry": session.entry_address(),
        "created_at": session.created_at.to_rfc3339(),
        "expires_at": session.expires_at_utc.to_rfc3339(),
        "seconds_left": session.seconds_left(),
        "ready": readiness.last_ready,
        "last_probe_ms_ago": readiness
            .last_check
            .map(|checked| now.duration_since(checked).as_millis() as u64),
    })
}

async fn handle_admin_request(
    req: Request<Incoming>,
    ctx: Arc<AdminContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let authorized = check_auth(&req, &ctx.auth_token);

    debug!(%method, %path, "Admin API request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        _ if !authorized => {
            warn!(%path, "Unauthorized admin API request");
            response(StatusCode::UNAUTHORIZED, "unauthorized")
        }

        (&Method::GET, "/sessions") => {
            let now = Instant::now();
            let registry = ctx.manager.registry();
            let live = registry.live_sessions();
            let provisioning = registry.provisioning_sessions();
            let sessions: Vec<serde_json::Value> = live
                .iter()
                .map(|session| session_json(session, SessionPhase::Live, now))
                .chain(
                    provisioning
                        .iter()
                        .map(|session| session_json(session, SessionPhase::Provisioning, now)),
                )
                .collect();
            let body = serde_json::json!({
                "count": live.len(),
                "provisioning": provisioning.len(),
                "sessions": sessions,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::GET, "/stats") => {
            let body = serde_json::json!({
                "live_sessions": ctx.manager.registry().len(),
                "provisioning_sessions": ctx.manager.registry().provisioning_count(),
                "forwarded_requests": ctx.pool_stats.get_total_requests(),
                "failed_requests": ctx.pool_stats.get_failed_requests(),
                "http_probes": ctx.pool_stats.get_health_checks(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::DELETE, path) if path.starts_with("/sessions/") => {
            let id = path.trim_start_matches("/sessions/").trim_end_matches('/');
            if id.is_empty() {
                response(StatusCode::BAD_REQUEST, "missing session id")
            } else if ctx.manager.delete_session(id, DeletionReason::Requested).await {
                info!(session_id = %id, "Session deleted via admin API");
                response(StatusCode::OK, "deleted")
            } else if ctx
                .manager
                .lookup(id)
                .is_some_and(|entry| entry.phase == SessionPhase::Provisioning)
            {
                // Provisioning runs to completion or rollback
                response(
                    StatusCode::CONFLICT,
                    "session is still provisioning; delete it once it is live",
                )
            } else {
                response(StatusCode::NOT_FOUND, "session not found")
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
