//! Integration tests for the session gateway

use std::sync::Arc;
use std::time::Duration;

use sessiongate::admin::AdminServer;
use sessiongate::config::{GatewayConfig, ProvisionMode};
use sessiongate::manager::{ManagerSettings, SessionManager};
use sessiongate::pool::{ConnectionPool, PoolConfig};
use sessiongate::prober::{ReadinessProber, TcpConnectCheck};
use sessiongate::provisioner::{Provisioner, ProvisionerSettings};
use sessiongate::proxy::{GatewayServer, RouteSettings};
use sessiongate::registry::SessionRegistry;
use sessiongate::runtime::{ContainerRuntime, MemoryRuntime, RuntimeOp};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const ADMIN_TOKEN: &str = "test-token";

struct TestGateway {
    port: u16,
    manager: Arc<SessionManager>,
    runtime: Arc<MemoryRuntime>,
    shutdown_tx: watch::Sender<bool>,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct GatewayOptions {
    ttl: Duration,
    background: bool,
    gate_on_readiness: bool,
    request_timeout: Duration,
    admin_port: Option<u16>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            background: false,
            gate_on_readiness: false,
            request_timeout: Duration::from_secs(5),
            admin_port: None,
        }
    }
}

async fn start_gateway(port: u16, runtime: Arc<MemoryRuntime>, options: GatewayOptions) -> TestGateway {
    runtime.create_network("backend").await.unwrap();

    let mut config = GatewayConfig::default();
    config.provision_mode = ProvisionMode::Direct;
    config.startup_grace_ms = 0;

    let provisioner = Arc::new(Provisioner::new(
        runtime.clone(),
        ProvisionerSettings::from_config(&config),
    ));
    let prober = ReadinessProber::new(Arc::new(TcpConnectCheck::default()))
        .with_cache_window(Duration::from_millis(50));

    let manager = SessionManager::new(
        Arc::new(SessionRegistry::new()),
        provisioner,
        prober,
        ManagerSettings {
            ttl: options.ttl,
            provision_in_background: options.background,
        },
    );

    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = GatewayServer::new(
        format!("127.0.0.1:{}", port).parse().unwrap(),
        Arc::clone(&manager),
        Arc::clone(&pool),
        RouteSettings {
            mount_prefix: "s".to_string(),
            gate_on_readiness: options.gate_on_readiness,
            request_timeout: options.request_timeout,
        },
        shutdown_rx.clone(),
    );
    tokio::spawn(async move {
        let _ = gateway.run().await;
    });
    assert!(wait_for_port(port, Duration::from_secs(5)).await, "gateway did not start");

    if let Some(admin_port) = options.admin_port {
        let admin = AdminServer::new(
            format!("127.0.0.1:{}", admin_port).parse().unwrap(),
            Arc::clone(&manager),
            pool.stats(),
            shutdown_rx,
            ADMIN_TOKEN.to_string(),
        );
        tokio::spawn(async move {
            let _ = admin.run().await;
        });
        assert!(wait_for_port(admin_port, Duration::from_secs(5)).await, "admin did not start");
    }

    TestGateway {
        port,
        manager,
        runtime,
        shutdown_tx,
    }
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n",
        method, path, port
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

async fn http_get(port: u16, path: &str) -> String {
    http_request(port, "GET", path, &[("Accept", "text/html")]).await.unwrap()
}

fn status_code(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split("\r\n\r\n").next()?;
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

/// Create a session through the gateway and return its id
async fn create_session(port: u16) -> String {
    let response = http_get(port, "/").await;
    assert_eq!(status_code(&response), 307, "unexpected response: {}", response);

    let location = header(&response, "location").expect("redirect has a location");
    let id = location
        .strip_prefix("/s/")
        .and_then(|rest| rest.strip_suffix('/'))
        .expect("location is /s/<id>/");
    id.to_string()
}

/// Serve a session entry point on the address the gateway will forward to.
/// Each response echoes the request head back in its body.
async fn serve_entry_point(gateway: &TestGateway, id: &str) -> tokio::task::JoinHandle<()> {
    let entry = gateway
        .manager
        .lookup(id)
        .and_then(|entry| entry.session.entry_address())
        .expect("session has an entry address");
    let listener = TcpListener::bind(&entry).await.unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Some(head) = read_head(&mut stream).await else {
                    return;
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nX-Upstream: yes\r\nConnection: close\r\n\r\n{}",
                    head.len(),
                    head
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    })
}

/// Send an upgrade request and return the response head
async fn upgrade_request(port: u16, path: &str) -> String {
    let mut client = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
        path
    );
    client.write_all(request.as_bytes()).await.unwrap();
    read_head(&mut client).await.unwrap()
}

async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return String::from_utf8(buf).ok();
        }
    }
}

// ============================================================================
// Session Creation Tests
// ============================================================================

#[tokio::test]
async fn test_root_creates_session_and_redirects() {
    let runtime = Arc::new(MemoryRuntime::new());
    let gateway = start_gateway(19301, runtime.clone(), GatewayOptions::default()).await;

    let response = http_get(gateway.port, "/").await;
    assert_eq!(status_code(&response), 307);
    assert_eq!(header(&response, "cache-control"), Some("no-store"));

    let location = header(&response, "location").unwrap();
    let id = location.trim_start_matches("/s/").trim_end_matches('/');
    assert!(gateway.manager.registry().get_live(id).is_some());

    let names = sessiongate::session::SessionNames::derive(id);
    assert!(runtime.has_container(&names.dashboard));
    assert!(runtime.has_container(&names.relay));
    assert!(runtime.has_container(&names.client));
    assert!(runtime.networks().contains(&names.network));
}

#[tokio::test]
async fn test_new_alias_creates_distinct_sessions() {
    let runtime = Arc::new(MemoryRuntime::new());
    let gateway = start_gateway(19302, runtime, GatewayOptions::default()).await;

    let first = create_session(gateway.port).await;
    let response = http_get(gateway.port, "/new").await;
    assert_eq!(status_code(&response), 307);
    let second = header(&response, "location").unwrap();

    assert_ne!(format!("/s/{}/", first), second);
    assert_eq!(gateway.manager.registry().len(), 2);
}

#[tokio::test]
async fn test_create_rejects_other_methods() {
    let runtime = Arc::new(MemoryRuntime::new());
    let gateway = start_gateway(19303, runtime.clone(), GatewayOptions::default()).await;

    let response = http_request(gateway.port, "POST", "/", &[("Content-Length", "0")])
        .await
        .unwrap();
    assert_eq!(status_code(&response), 405);
    assert!(gateway.manager.registry().is_empty());
    assert!(runtime.containers().is_empty());

    let head = http_request(gateway.port, "HEAD", "/", &[]).await.unwrap();
    assert_eq!(status_code(&head), 405);
    assert!(gateway.manager.registry().is_empty());
    assert!(runtime.containers().is_empty());
}

#[tokio::test]
async fn test_failed_provisioning_shows_failed_page() {
    let runtime = Arc::new(MemoryRuntime::new());
    runtime.fail_on(RuntimeOp::RunContainer, "dashboard-");
    let gateway = start_gateway(19304, runtime.clone(), GatewayOptions::default()).await;

    let response = http_get(gateway.port, "/").await;
    assert_eq!(status_code(&response), 503);
    assert!(body(&response).contains("Starting session"));
    assert!(body(&response).contains(r#"<a href="/">Retry</a>"#));

    assert!(gateway.manager.registry().is_empty());
    assert!(runtime.containers().is_empty());
    assert_eq!(runtime.networks(), vec!["backend".to_string()]);
}

#[tokio::test]
async fn test_background_creation_redirects_immediately() {
    let runtime = Arc::new(MemoryRuntime::new());
    let options = GatewayOptions {
        background: true,
        ..Default::default()
    };
    let gateway = start_gateway(19305, runtime, options).await;

    let id = create_session(gateway.port).await;
    let status = http_get(gateway.port, &format!("/status/{}", id)).await;
    assert!(body(&status).contains(r#""exists":true"#));
    assert!(body(&status).contains(r#""ready":false"#));
}

// ============================================================================
// Status Tests
// ============================================================================

#[tokio::test]
async fn test_status_for_unknown_session() {
    let runtime = Arc::new(MemoryRuntime::new());
    let gateway = start_gateway(19306, runtime, GatewayOptions::default()).await;

    let response = http_get(gateway.port, "/status/does-not-exist").await;
    assert_eq!(status_code(&response), 200);
    assert_eq!(header(&response, "content-type"), Some("application/json"));
    assert_eq!(header(&response, "cache-control"), Some("no-store"));
    assert_eq!(
        body(&response),
        r#"{"exists":false,"ready":false,"sessionId":"does-not-exist","secondsLeft":0}"#
    );
}

#[tokio::test]
async fn test_status_becomes_ready_when_entry_point_listens() {
    let runtime = Arc::new(MemoryRuntime::new());
    let gateway = start_gateway(19307, runtime, GatewayOptions::default()).await;
    let id = create_session(gateway.port).await;

    let before = http_get(gateway.port, &format!("/status/{}", id)).await;
    assert!(body(&before).contains(r#""exists":true"#));
    assert!(body(&before).contains(r#""ready":false"#));

    let _entry = serve_entry_point(&gateway, &id).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let after = http_get(gateway.port, &format!("/status/{}", id)).await;
    let status: serde_json::Value = serde_json::from_str(body(&after)).unwrap();
    assert_eq!(status["ready"], true, "status: {}", after);
    let seconds_left = status["secondsLeft"].as_u64().unwrap();
    assert!((55..=60).contains(&seconds_left));
}

// ============================================================================
// Proxy Tests
// ============================================================================

#[tokio::test]
async fn test_unknown_session_shows_expired_page() {
    let runtime = Arc::new(MemoryRuntime::new());
    let gateway = start_gateway(19308, runtime, GatewayOptions::default()).await;

    let response = http_get(gateway.port, "/s/nope/").await;
    assert_eq!(status_code(&response), 404);
    assert!(body(&response).contains("Session expired"));
    assert!(body(&response).contains(r#"<a href="/">Retry</a>"#));
}

#[tokio::test]
async fn test_unreachable_session_shows_starting_page() {
    let runtime = Arc::new(MemoryRuntime::new());
    let gateway = start_gateway(19309, runtime, GatewayOptions::default()).await;
    let id = create_session(gateway.port).await;

    let page = http_get(gateway.port, &format!("/s/{}/", id)).await;
    assert_eq!(status_code(&page), 200);
    assert!(body(&page).contains("Starting session"));
    assert!(body(&page).contains(&format!(r#"var sessionId = "{}";"#, id)));

    let api = http_request(
        gateway.port,
        "GET",
        &format!("/s/{}/api/data", id),
        &[("Accept", "application/json")],
    )
    .await
    .unwrap();
    assert_eq!(status_code(&api), 503);
    assert_eq!(header(&api, "x-gateway-error"), Some("SESSION_STARTING"));
    assert_eq!(body(&api), "starting");
}

#[tokio::test]
async fn test_requests_are_forwarded_with_prefix_stripped() {
    let runtime = Arc::new(MemoryRuntime::new());
    let gateway = start_gateway(19310, runtime, GatewayOptions::default()).await;
    let id = create_session(gateway.port).await;
    let _entry = serve_entry_point(&gateway, &id).await;

    let response = http_request(
        gateway.port,
        "GET",
        &format!("/s/{}/api/items?page=2", id),
        &[("Accept", "application/json"), ("X-Forwarded-For", "6.6.6.6")],
    )
    .await
    .unwrap();

    assert_eq!(status_code(&response), 200, "response: {}", response);
    assert_eq!(header(&response, "x-upstream"), Some("yes"));

    let echoed = body(&response).to_lowercase();
    assert!(echoed.starts_with("get /api/items?page=2 http/1.1"), "echoed: {}", echoed);
    assert!(echoed.contains(&format!("x-path-prefix: s/{}", id.to_lowercase())));
    assert!(echoed.contains("x-forwarded-for: 127.0.0.1"));
    assert!(echoed.contains("x-forwarded-proto: http"));
    assert!(echoed.contains("x-request-id: "));
    assert!(!echoed.contains("6.6.6.6"));
}

#[tokio::test]
async fn test_session_root_without_trailing_slash_is_forwarded() {
    let runtime = Arc::new(MemoryRuntime::new());
    let gateway = start_gateway(19311, runtime, GatewayOptions::default()).await;
    let id = create_session(gateway.port).await;
    let _entry = serve_entry_point(&gateway, &id).await;

    let response = http_get(gateway.port, &format!("/s/{}", id)).await;
    assert_eq!(status_code(&response), 200);
    assert!(body(&response).starts_with("GET / HTTP/1.1"));
}

#[tokio::test]
async fn test_gate_on_readiness_holds_back_until_ready() {
    let runtime = Arc::new(MemoryRuntime::new());
    let options = GatewayOptions {
        gate_on_readiness: true,
        ..Default::default()
    };
    let gateway = start_gateway(19312, runtime, options).await;
    let id = create_session(gateway.port).await;

    let page = http_get(gateway.port, &format!("/s/{}/", id)).await;
    assert!(body(&page).contains("Starting session"));

    let _entry = serve_entry_point(&gateway, &id).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let forwarded = http_get(gateway.port, &format!("/s/{}/", id)).await;
    assert_eq!(header(&forwarded, "x-upstream"), Some("yes"));
}

#[tokio::test]
async fn test_unknown_path_returns_404() {
    let runtime = Arc::new(MemoryRuntime::new());
    let gateway = start_gateway(19313, runtime, GatewayOptions::default()).await;

    let response = http_get(gateway.port, "/favicon.ico").await;
    assert_eq!(status_code(&response), 404);
    assert_eq!(header(&response, "x-gateway-error"), Some("NOT_FOUND"));
}

#[tokio::test]
async fn test_upgrade_is_relayed_to_session() {
    let runtime = Arc::new(MemoryRuntime::new());
    let gateway = start_gateway(19314, runtime, GatewayOptions::default()).await;
    let id = create_session(gateway.port).await;

    let entry = gateway
        .manager
        .lookup(&id)
        .and_then(|entry| entry.session.entry_address())
        .unwrap();
    let listener = TcpListener::bind(&entry).await.unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await.unwrap();
        assert!(head.starts_with("GET /ws HTTP/1.1"));
        stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if stream.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    });

    let mut client = TcpStream::connect(format!("127.0.0.1:{}", gateway.port)).await.unwrap();
    let request = format!(
        "GET /s/{}/ws HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
        id
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut client).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "head: {}", head);

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn test_upgrade_to_silent_session_times_out() {
    let runtime = Arc::new(MemoryRuntime::new());
    let options = GatewayOptions {
        request_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let gateway = start_gateway(19319, runtime, options).await;
    let id = create_session(gateway.port).await;

    // Accepts the connection but never answers
    let entry = gateway
        .manager
        .lookup(&id)
        .and_then(|entry| entry.session.entry_address())
        .unwrap();
    let listener = TcpListener::bind(&entry).await.unwrap();
    let silent = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stream);
    });

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        upgrade_request(gateway.port, &format!("/s/{}/ws", id)),
    )
    .await
    .expect("upgrade request must not hang");

    assert_eq!(status_code(&response), 504);
    assert_eq!(header(&response, "x-gateway-error"), Some("UPSTREAM_TIMEOUT"));
    silent.abort();
}

#[tokio::test]
async fn test_upgrade_to_unreachable_session_reports_starting() {
    let runtime = Arc::new(MemoryRuntime::new());
    let gateway = start_gateway(19320, runtime, GatewayOptions::default()).await;
    let id = create_session(gateway.port).await;

    let response = upgrade_request(gateway.port, &format!("/s/{}/ws", id)).await;

    assert_eq!(status_code(&response), 503);
    assert_eq!(header(&response, "x-gateway-error"), Some("SESSION_STARTING"));
}

// ============================================================================
// Expiry Tests
// ============================================================================

#[tokio::test]
async fn test_session_expires_after_ttl() {
    let runtime = Arc::new(MemoryRuntime::new());
    let options = GatewayOptions {
        ttl: Duration::from_secs(1),
        ..Default::default()
    };
    let gateway = start_gateway(19315, runtime.clone(), options).await;
    let id = create_session(gateway.port).await;

    let live = http_get(gateway.port, &format!("/status/{}", id)).await;
    assert!(body(&live).contains(r#""exists":true"#));

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let gone = http_get(gateway.port, &format!("/status/{}", id)).await;
    assert!(body(&gone).contains(r#""exists":false"#));
    assert!(runtime.containers().is_empty());
    assert_eq!(runtime.networks(), vec!["backend".to_string()]);

    let page = http_get(gateway.port, &format!("/s/{}/", id)).await;
    assert_eq!(status_code(&page), 404);
}

// ============================================================================
// Admin API Tests
// ============================================================================

#[tokio::test]
async fn test_admin_health_and_version() {
    let runtime = Arc::new(MemoryRuntime::new());
    let options = GatewayOptions {
        admin_port: Some(19321),
        ..Default::default()
    };
    let _gateway = start_gateway(19316, runtime, options).await;

    let health = http_request(19321, "GET", "/health", &[]).await.unwrap();
    assert_eq!(status_code(&health), 200);
    assert_eq!(body(&health), "ok");

    let version = http_request(19321, "GET", "/version", &[]).await.unwrap();
    assert!(body(&version).contains(r#""name":"sessiongate""#));
}

#[tokio::test]
async fn test_admin_lists_and_deletes_sessions() {
    let runtime = Arc::new(MemoryRuntime::new());
    let options = GatewayOptions {
        admin_port: Some(19322),
        ..Default::default()
    };
    let gateway = start_gateway(19317, runtime.clone(), options).await;
    let id = create_session(gateway.port).await;
    let auth = format!("Bearer {}", ADMIN_TOKEN);

    let unauthorized = http_request(19322, "GET", "/sessions", &[]).await.unwrap();
    assert_eq!(status_code(&unauthorized), 401);

    let listing = http_request(19322, "GET", "/sessions", &[("Authorization", &auth)])
        .await
        .unwrap();
    assert_eq!(status_code(&listing), 200);
    assert!(body(&listing).contains(&format!(r#""id":"{}""#, id)));
    assert!(body(&listing).contains(r#""count":1"#));

    let path = format!("/sessions/{}", id);
    let rejected = http_request(19322, "DELETE", &path, &[]).await.unwrap();
    assert_eq!(status_code(&rejected), 401);
    assert!(gateway.manager.lookup(&id).is_some());

    let deleted = http_request(19322, "DELETE", &path, &[("Authorization", &auth)])
        .await
        .unwrap();
    assert_eq!(status_code(&deleted), 200);
    assert!(runtime.containers().is_empty());

    let again = http_request(19322, "DELETE", &path, &[("Authorization", &auth)])
        .await
        .unwrap();
    assert_eq!(status_code(&again), 404);

    let status = http_get(gateway.port, &format!("/status/{}", id)).await;
    assert!(body(&status).contains(r#""exists":false"#));
}

#[tokio::test]
async fn test_admin_shows_provisioning_sessions() {
    let runtime = Arc::new(MemoryRuntime::new());
    runtime.delay_on(RuntimeOp::RunContainer, "client-", Duration::from_secs(3));
    let options = GatewayOptions {
        background: true,
        admin_port: Some(19324),
        ..Default::default()
    };
    let gateway = start_gateway(19323, runtime, options).await;
    let id = create_session(gateway.port).await;
    let auth = format!("Bearer {}", ADMIN_TOKEN);

    let listing = http_request(19324, "GET", "/sessions", &[("Authorization", &auth)])
        .await
        .unwrap();
    let listing: serde_json::Value = serde_json::from_str(body(&listing)).unwrap();
    assert_eq!(listing["count"], 0);
    assert_eq!(listing["provisioning"], 1);
    assert_eq!(listing["sessions"][0]["id"], id.as_str());
    assert_eq!(listing["sessions"][0]["state"], "provisioning");

    let path = format!("/sessions/{}", id);
    let conflict = http_request(19324, "DELETE", &path, &[("Authorization", &auth)])
        .await
        .unwrap();
    assert_eq!(status_code(&conflict), 409);
    assert!(gateway.manager.lookup(&id).is_some());
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_shutdown_tears_down_live_sessions() {
    let runtime = Arc::new(MemoryRuntime::new());
    let gateway = start_gateway(19318, runtime.clone(), GatewayOptions::default()).await;
    create_session(gateway.port).await;
    create_session(gateway.port).await;
    assert_eq!(gateway.runtime.containers().len(), 6);

    gateway.manager.shutdown().await;

    assert!(runtime.containers().is_empty());
    assert_eq!(runtime.networks(), vec!["backend".to_string()]);

    let response = http_get(gateway.port, "/").await;
    assert_eq!(status_code(&response), 503);
}
