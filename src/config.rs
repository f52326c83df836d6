use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Longest accepted session lifetime
const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// First path segments the gateway routes itself
const RESERVED_PREFIXES: &[&str] = &["status", "new"];

/// How a session's containers are created
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionMode {
    /// Individual runtime calls per container (default)
    #[default]
    Direct,
    /// One compose project per session
    Compose,
}

impl ProvisionMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Some(ProvisionMode::Direct),
            "compose" => Some(ProvisionMode::Compose),
            _ => None,
        }
    }
}

/// How readiness of a session entry point is checked
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessProbeKind {
    /// A TCP connect succeeds
    Tcp,
    /// `GET /` answers 200
    Http,
}

impl ReadinessProbeKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(ReadinessProbeKind::Tcp),
            "http" => Some(ReadinessProbeKind::Http),
            _ => None,
        }
    }
}

/// Gateway configuration
///
/// Loaded from an optional TOML file, then overridden from the environment.
/// Every field has a default, so an empty file (or none) is a valid config.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    /// Public listen address (default: 0.0.0.0:8080)
    pub listen_addr: String,

    /// Admin API listen address; empty disables the admin API (default: 127.0.0.1:9090)
    pub admin_addr: String,

    /// Bearer token for admin mutations. Generated at startup when unset
    pub admin_token: Option<String>,

    /// Session lifetime in seconds (default: 7200)
    pub session_ttl_secs: u64,

    /// First path segment of session URLs (default: "s")
    pub mount_prefix: String,

    pub provision_mode: ProvisionMode,

    /// Redirect before provisioning finishes (default: false)
    pub provision_in_background: bool,

    /// Readiness probe; unset picks tcp for direct mode and http for compose mode
    pub readiness_probe: Option<ReadinessProbeKind>,

    /// Serve the starting page until the session probes ready (default: false)
    pub gate_on_readiness: bool,

    /// Re-emit container output through the gateway's log (default: false)
    pub redirect_logs: bool,

    /// Network shared by every session and the shared service (default: backend)
    pub backend_network: String,

    pub dashboard_image: String,
    pub relay_image: String,
    pub client_image: String,
    pub shared_service_image: String,

    /// Container name of the shared service (default: shared-backend)
    pub shared_service_name: String,

    /// Extra environment for the shared service container (TOML only)
    pub shared_service_env: BTreeMap<String, String>,

    /// ARGUMENTS passed to the relay; defaults to `--server <shared_service_name>`
    pub relay_args: Option<String>,

    /// Directory holding one build context per image (default: /opt/userspace)
    pub image_build_root: String,

    /// Compose file used in compose mode (default: session.yml)
    pub compose_file: String,

    /// Docker daemon URL; unset means DOCKER_HOST or socket discovery
    pub docker_host: Option<String>,

    /// Docker CLI used for builds and compose (default: docker)
    pub docker_path: String,

    /// Platform passed to image builds; empty builds for the host (default: linux/amd64)
    pub build_platform: String,

    /// Max time to wait for a session response in seconds (default: 30)
    pub request_timeout_secs: u64,

    /// Maximum idle connections per session entry point (default: 10)
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    pub pool_idle_timeout_secs: u64,

    /// Port the dashboard listens on inside its container (default: 8080)
    pub dashboard_port: u16,

    /// Port every compose service listens on (default: 80)
    pub compose_service_port: u16,

    /// Wait before verifying the dashboard survived startup (default: 500)
    pub startup_grace_ms: u64,

    /// Log lines captured when a container dies during startup (default: 50)
    pub failure_log_tail: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            admin_addr: "127.0.0.1:9090".to_string(),
            admin_token: None,
            session_ttl_secs: 7200,
            mount_prefix: "s".to_string(),
            provision_mode: ProvisionMode::Direct,
            provision_in_background: false,
            readiness_probe: None,
            gate_on_readiness: false,
            redirect_logs: false,
            backend_network: "backend".to_string(),
            dashboard_image: "dashboard:latest".to_string(),
            relay_image: "terminal-void:latest".to_string(),
            client_image: "client:latest".to_string(),
            shared_service_image: "terminal-shared:latest".to_string(),
            shared_service_name: "shared-backend".to_string(),
            shared_service_env: BTreeMap::new(),
            relay_args: None,
            image_build_root: "/opt/userspace".to_string(),
            compose_file: "session.yml".to_string(),
            docker_host: None,
            docker_path: "docker".to_string(),
            build_platform: "linux/amd64".to_string(),
            request_timeout_secs: 30,
            pool_max_idle_per_host: 10,
            pool_idle_timeout_secs: 90,
            dashboard_port: 8080,
            compose_service_port: 80,
            startup_grace_ms: 500,
            failure_log_tail: 50,
        }
    }
}

/// Blank values count as unset
fn env_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut String) {
    if let Some(value) = lookup(key) {
        let value = value.trim();
        if !value.is_empty() {
            *target = value.to_string();
        }
    }
}

fn env_optional(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut Option<String>) {
    if let Some(value) = lookup(key) {
        let value = value.trim();
        *target = if value.is_empty() { None } else { Some(value.to_string()) };
    }
}

/// Malformed values, zero and values above `max` keep the current setting
fn env_bounded_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    max: u64,
    target: &mut u64,
) {
    if let Some(value) = lookup(key) {
        match value.trim().parse::<u64>() {
            Ok(parsed) if parsed > 0 && parsed <= max => *target = parsed,
            _ => warn!(key, value = %value, fallback = *target, max, "Ignoring out-of-range integer"),
        }
    }
}

fn env_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut bool) {
    if let Some(value) = lookup(key) {
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *target = true,
            "0" | "false" | "no" | "off" | "" => *target = false,
            _ => warn!(key, value = %value, fallback = *target, "Ignoring malformed boolean"),
        }
    }
}

impl GatewayConfig {
    /// Load from an optional TOML file plus the process environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    pub fn load_with(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    anyhow::anyhow!("Cannot read config file '{}': {}", path.display(), e)
                })?;
                toml::from_str(&content)?
            }
            None => GatewayConfig::default(),
        };
        config.apply_env(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment-style options
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        env_string(&lookup, "LISTEN_ADDR", &mut self.listen_addr);
        // An explicitly empty ADMIN_ADDR disables the admin API
        if let Some(value) = lookup("ADMIN_ADDR") {
            self.admin_addr = value.trim().to_string();
        }
        env_optional(&lookup, "ADMIN_TOKEN", &mut self.admin_token);
        env_bounded_u64(&lookup, "SESSION_TTL_SECONDS", MAX_TTL_SECS, &mut self.session_ttl_secs);
        env_string(&lookup, "MOUNT_PREFIX", &mut self.mount_prefix);
        env_bool(&lookup, "PROVISION_IN_BACKGROUND", &mut self.provision_in_background);
        env_bool(&lookup, "GATE_ON_READINESS", &mut self.gate_on_readiness);
        env_bool(&lookup, "REDIRECT_LOGS", &mut self.redirect_logs);
        env_string(&lookup, "BACKEND_NETWORK", &mut self.backend_network);
        env_string(&lookup, "DASHBOARD_IMAGE", &mut self.dashboard_image);
        env_string(&lookup, "RELAY_IMAGE", &mut self.relay_image);
        env_string(&lookup, "CLIENT_IMAGE", &mut self.client_image);
        env_string(&lookup, "SHARED_SERVICE_IMAGE", &mut self.shared_service_image);
        env_string(&lookup, "SHARED_SERVICE_NAME", &mut self.shared_service_name);
        env_optional(&lookup, "RELAY_ARGUMENTS", &mut self.relay_args);
        env_string(&lookup, "IMAGE_BUILD_ROOT", &mut self.image_build_root);
        env_string(&lookup, "COMPOSE_FILE", &mut self.compose_file);
        env_optional(&lookup, "DOCKER_HOST", &mut self.docker_host);
        env_string(&lookup, "DOCKER_PATH", &mut self.docker_path);
        env_string(&lookup, "BUILD_PLATFORM", &mut self.build_platform);
        env_bounded_u64(&lookup, "REQUEST_TIMEOUT_SECONDS", u64::MAX, &mut self.request_timeout_secs);

        if let Some(value) = lookup("PROVISION_MODE") {
            match ProvisionMode::parse(&value) {
                Some(mode) => self.provision_mode = mode,
                None => warn!(key = "PROVISION_MODE", value = %value, fallback = ?self.provision_mode, "Ignoring unknown provision mode"),
            }
        }

        if let Some(value) = lookup("READINESS_PROBE") {
            match ReadinessProbeKind::parse(&value) {
                Some(kind) => self.readiness_probe = Some(kind),
                None => warn!(key = "READINESS_PROBE", value = %value, fallback = ?self.readiness_probe, "Ignoring unknown readiness probe"),
            }
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.listen_addr.parse::<SocketAddr>().is_err() {
            errors.push(format!("listen_addr '{}' is not a socket address", self.listen_addr));
        }
        if !self.admin_addr.is_empty() && self.admin_addr.parse::<SocketAddr>().is_err() {
            errors.push(format!("admin_addr '{}' is not a socket address", self.admin_addr));
        }
        if self.session_ttl_secs == 0 {
            errors.push("session_ttl_secs must be greater than 0".to_string());
        } else if self.session_ttl_secs > MAX_TTL_SECS {
            errors.push(format!("session_ttl_secs must be at most {}", MAX_TTL_SECS));
        }
        if self.mount_prefix.is_empty() || self.mount_prefix.contains('/') {
            errors.push(format!(
                "mount_prefix '{}' must be a single non-empty path segment",
                self.mount_prefix
            ));
        } else if RESERVED_PREFIXES.contains(&self.mount_prefix.as_str()) {
            errors.push(format!("mount_prefix '{}' is reserved", self.mount_prefix));
        }
        if self.request_timeout_secs == 0 {
            errors.push("request_timeout_secs must be greater than 0".to_string());
        }

        let images = [
            ("dashboard_image", &self.dashboard_image),
            ("relay_image", &self.relay_image),
            ("client_image", &self.client_image),
            ("shared_service_image", &self.shared_service_image),
            ("backend_network", &self.backend_network),
            ("shared_service_name", &self.shared_service_name),
        ];
        for (field, value) in images {
            if value.trim().is_empty() {
                errors.push(format!("{} must not be empty", field));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn listen_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {}", self.listen_addr, e))
    }

    /// Admin listen address, `None` when the admin API is disabled
    pub fn admin_socket_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        if self.admin_addr.is_empty() {
            return Ok(None);
        }
        self.admin_addr
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid admin address '{}': {}", self.admin_addr, e))
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn relay_arguments(&self) -> String {
        self.relay_args
            .clone()
            .unwrap_or_else(|| format!("--server {}", self.shared_service_name))
    }

    pub fn effective_readiness_probe(&self) -> ReadinessProbeKind {
        self.readiness_probe.unwrap_or(match self.provision_mode {
            ProvisionMode::Direct => ReadinessProbeKind::Tcp,
            ProvisionMode::Compose => ReadinessProbeKind::Http,
        })
    }

    pub fn build_platform(&self) -> Option<String> {
        let platform = self.build_platform.trim();
        if platform.is_empty() {
            None
        } else {
            Some(platform.to_string())
        }
    }
}
