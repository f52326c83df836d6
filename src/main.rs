use sessiongate::admin::{AdminServer, PKG_NAME, VERSION};
use sessiongate::config::{GatewayConfig, ReadinessProbeKind};
use sessiongate::docker::DockerRuntime;
use sessiongate::manager::{ManagerSettings, SessionManager};
use sessiongate::pool::{ConnectionPool, PoolConfig};
use sessiongate::prober::{HttpHealthCheck, ReadinessCheck, ReadinessProber, TcpConnectCheck};
use sessiongate::provisioner::{Provisioner, ProvisionerSettings};
use sessiongate::proxy::{GatewayServer, RouteSettings};
use sessiongate::registry::SessionRegistry;
use sessiongate::runtime::ContainerRuntime;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sessiongate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Optional TOML file; the environment overrides it
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let config = GatewayConfig::load(config_path.as_deref()).map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let listen_addr = config.listen_socket_addr()?;
    let admin_addr = config.admin_socket_addr()?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect(
            config.docker_host.as_deref(),
            config.docker_path.clone(),
            config.build_platform(),
        )
        .await?,
    );

    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&runtime),
        ProvisionerSettings::from_config(&config),
    ));

    provisioner.ensure_prerequisites().await.map_err(|e| {
        error!(error = %e, "Startup prerequisites failed");
        e
    })?;

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
        ..PoolConfig::default()
    }));

    let check: Arc<dyn ReadinessCheck> = match config.effective_readiness_probe() {
        ReadinessProbeKind::Tcp => Arc::new(TcpConnectCheck::default()),
        ReadinessProbeKind::Http => Arc::new(HttpHealthCheck::new(Arc::clone(&pool))),
    };

    let manager = SessionManager::new(
        Arc::new(SessionRegistry::new()),
        provisioner,
        ReadinessProber::new(check),
        ManagerSettings {
            ttl: config.session_ttl(),
            provision_in_background: config.provision_in_background,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = GatewayServer::new(
        listen_addr,
        Arc::clone(&manager),
        Arc::clone(&pool),
        RouteSettings {
            mount_prefix: config.mount_prefix.clone(),
            gate_on_readiness: config.gate_on_readiness,
            request_timeout: config.request_timeout(),
        },
        shutdown_rx.clone(),
    );

    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    let admin_handle = match admin_addr {
        Some(addr) => {
            let admin_token = config.admin_token.clone().unwrap_or_else(|| {
                let token = uuid::Uuid::new_v4().to_string();
                info!(token = %token, "Generated admin API token (set ADMIN_TOKEN to use a fixed value)");
                token
            });
            let admin_server = AdminServer::new(
                addr,
                Arc::clone(&manager),
                pool.stats(),
                shutdown_rx.clone(),
                admin_token,
            );
            Some(tokio::spawn(async move {
                if let Err(e) = admin_server.run().await {
                    error!(error = %e, "Admin server error");
                }
            }))
        }
        None => {
            info!("Admin API disabled");
            None
        }
    };

    wait_for_signal().await?;

    let _ = shutdown_tx.send(true);

    info!("Tearing down sessions...");
    manager.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = gateway_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &GatewayConfig) {
    info!(name = PKG_NAME, version = VERSION, "Starting session gateway");
    info!(
        listen = %config.listen_addr,
        admin = %config.admin_addr,
        mount_prefix = %config.mount_prefix,
        request_timeout_secs = config.request_timeout_secs,
        "Server configuration"
    );
    info!(
        ttl_secs = config.session_ttl_secs,
        mode = ?config.provision_mode,
        background = config.provision_in_background,
        readiness_probe = ?config.effective_readiness_probe(),
        gate_on_readiness = config.gate_on_readiness,
        redirect_logs = config.redirect_logs,
        "Session settings"
    );
    info!(
        backend_network = %config.backend_network,
        dashboard = %config.dashboard_image,
        relay = %config.relay_image,
        client = %config.client_image,
        shared_service = %config.shared_service_image,
        shared_service_name = %config.shared_service_name,
        "Container images"
    );
    info!(
        build_root = %config.image_build_root,
        compose_file = %config.compose_file,
        docker_path = %config.docker_path,
        build_platform = %config.build_platform,
        "Build settings"
    );
    info!(
        pool_max_idle = config.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.pool_idle_timeout_secs,
        "Connection pool settings"
    );
}
