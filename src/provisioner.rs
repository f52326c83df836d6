//! Session provisioning and teardown
//!
//! Provisioning is expressed as a plan of [`Step`]s run by a [`Saga`]. Every
//! step that creates something records a [`Compensation`]; when a later step
//! fails, the recorded compensations run in reverse order so a failed attempt
//! leaves no resources behind.

use crate::config::{GatewayConfig, ProvisionMode};
use crate::error::{ProvisionError, RuntimeResult};
use crate::runtime::{ComposeProject, ContainerRuntime, ContainerSpec, PortPublish, ServiceContainer};
use crate::session::{Role, Session, SessionEndpoints, SessionNames};
use anyhow::Context;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Alias the relay carries on the session network
pub const RELAY_ALIAS: &str = "proxy";

const NETWORK_REMOVE_ATTEMPTS: u32 = 3;
const NETWORK_REMOVE_BACKOFF: Duration = Duration::from_millis(500);

/// Container images for each role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleImages {
    pub dashboard: String,
    pub relay: String,
    pub client: String,
    pub shared_service: String,
}

#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    pub mode: ProvisionMode,
    pub backend_network: String,
    pub images: RoleImages,
    pub shared_service_name: String,
    pub shared_service_env: BTreeMap<String, String>,
    pub relay_arguments: String,
    pub image_build_root: PathBuf,
    pub compose_file: PathBuf,
    pub redirect_logs: bool,
    /// Address the dashboard port is published on
    pub host_ip: String,
    /// Port the dashboard listens on inside its container
    pub dashboard_port: u16,
    /// Port of every service in a compose project
    pub compose_service_port: u16,
    /// Wait before checking that the dashboard survived startup
    pub startup_grace: Duration,
    pub failure_log_tail: usize,
}

impl ProvisionerSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            mode: config.provision_mode,
            backend_network: config.backend_network.clone(),
            images: RoleImages {
                dashboard: config.dashboard_image.clone(),
                relay: config.relay_image.clone(),
                client: config.client_image.clone(),
                shared_service: config.shared_service_image.clone(),
            },
            shared_service_name: config.shared_service_name.clone(),
            shared_service_env: config.shared_service_env.clone(),
            relay_arguments: config.relay_arguments(),
            image_build_root: PathBuf::from(&config.image_build_root),
            compose_file: PathBuf::from(&config.compose_file),
            redirect_logs: config.redirect_logs,
            host_ip: "127.0.0.1".to_string(),
            dashboard_port: config.dashboard_port,
            compose_service_port: config.compose_service_port,
            startup_grace: Duration::from_millis(config.startup_grace_ms),
            failure_log_tail: config.failure_log_tail,
        }
    }

    fn compose_project(&self, names: &SessionNames) -> ComposeProject {
        ComposeProject {
            name: names.project.clone(),
            file: self.compose_file.clone(),
        }
    }
}

/// One provisioning action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    CreateNetwork(String),
    RunContainer(ContainerSpec),
    ConnectNetwork {
        container: String,
        network: String,
        alias: Option<String>,
    },
    /// Wait out `grace`, then fail with recent logs unless the container runs
    VerifyRunning {
        container: String,
        grace: Duration,
        log_tail: usize,
    },
    ComposeUp(ComposeProject),
}

impl Step {
    /// Undo action for this step, if it creates anything
    pub fn compensation(&self) -> Option<Compensation> {
        match self {
            Step::CreateNetwork(name) => Some(Compensation::RemoveNetwork(name.clone())),
            Step::RunContainer(spec) if spec.auto_remove => {
                Some(Compensation::StopContainer(spec.name.clone()))
            }
            Step::RunContainer(spec) => Some(Compensation::RemoveContainer(spec.name.clone())),
            Step::ComposeUp(project) => Some(Compensation::ComposeDown(project.clone())),
            Step::ConnectNetwork { .. } | Step::VerifyRunning { .. } => None,
        }
    }

    /// A failed `compose up` may still leave part of the project running
    fn compensate_on_own_failure(&self) -> bool {
        matches!(self, Step::ComposeUp(_))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::CreateNetwork(name) => write!(f, "create network {}", name),
            Step::RunContainer(spec) => write!(f, "run container {}", spec.name),
            Step::ConnectNetwork {
                container, network, ..
            } => write!(f, "connect {} to {}", container, network),
            Step::VerifyRunning { container, .. } => write!(f, "verify {} is running", container),
            Step::ComposeUp(project) => write!(f, "compose up {}", project.name),
        }
    }
}

/// Undo action recorded by a completed step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    StopContainer(String),
    RemoveContainer(String),
    RemoveNetwork(String),
    ComposeDown(ComposeProject),
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensation::StopContainer(name) => write!(f, "stop container {}", name),
            Compensation::RemoveContainer(name) => write!(f, "remove container {}", name),
            Compensation::RemoveNetwork(name) => write!(f, "remove network {}", name),
            Compensation::ComposeDown(project) => write!(f, "compose down {}", project.name),
        }
    }
}

async fn compensate(runtime: &dyn ContainerRuntime, action: &Compensation) -> RuntimeResult<()> {
    match action {
        Compensation::StopContainer(name) => runtime.stop_container(name).await,
        Compensation::RemoveContainer(name) => runtime.remove_container(name).await,
        Compensation::ComposeDown(project) => runtime.compose_down(project).await,
        Compensation::RemoveNetwork(name) => {
            // Auto-removal of just-stopped containers can lag behind the stop call
            let mut attempt = 1;
            loop {
                match runtime.remove_network(name).await {
                    Ok(()) => return Ok(()),
                    Err(e) if attempt < NETWORK_REMOVE_ATTEMPTS => {
                        debug!(network = %name, attempt, error = %e, "Network removal failed, retrying");
                        attempt += 1;
                        tokio::time::sleep(NETWORK_REMOVE_BACKOFF).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

/// Runs steps in order and rolls back completed ones on failure
pub struct Saga<'a> {
    runtime: &'a dyn ContainerRuntime,
    session_id: &'a str,
    compensations: Vec<Compensation>,
}

impl<'a> Saga<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, session_id: &'a str) -> Self {
        Self {
            runtime,
            session_id,
            compensations: Vec::new(),
        }
    }

    /// Run every step. On the first failure, roll back and return the error.
    pub async fn run(&mut self, steps: Vec<Step>) -> Result<(), ProvisionError> {
        for step in steps {
            if let Err(e) = self.execute(&step).await {
                error!(session_id = %self.session_id, step = %step, error = %e, "Provisioning step failed");
                self.rollback().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Run a single step, recording its compensation. Does not roll back.
    pub async fn execute(&mut self, step: &Step) -> Result<(), ProvisionError> {
        info!(session_id = %self.session_id, step = %step, "Provisioning step");

        let compensation = step.compensation();
        if step.compensate_on_own_failure() {
            self.compensations.extend(compensation.clone());
        }

        self.apply(step).await?;

        if !step.compensate_on_own_failure() {
            self.compensations.extend(compensation);
        }
        Ok(())
    }

    async fn apply(&self, step: &Step) -> Result<(), ProvisionError> {
        let failed = |source| ProvisionError::StepFailed {
            step: step.to_string(),
            source,
        };

        match step {
            Step::CreateNetwork(name) => self.runtime.create_network(name).await.map_err(failed),
            Step::RunContainer(spec) => self.runtime.run_container(spec).await.map_err(failed),
            Step::ConnectNetwork {
                container,
                network,
                alias,
            } => self
                .runtime
                .connect_network(container, network, alias.as_deref())
                .await
                .map_err(failed),
            Step::ComposeUp(project) => self.runtime.compose_up(project).await.map_err(failed),
            Step::VerifyRunning {
                container,
                grace,
                log_tail,
            } => {
                tokio::time::sleep(*grace).await;
                match self.runtime.container_running(container).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(self.exited(container, *log_tail).await),
                    Err(e) => {
                        warn!(session_id = %self.session_id, container = %container, error = %e, "Could not inspect container");
                        Err(self.exited(container, *log_tail).await)
                    }
                }
            }
        }
    }

    async fn exited(&self, container: &str, tail: usize) -> ProvisionError {
        let logs = self
            .runtime
            .container_logs(container, tail)
            .await
            .unwrap_or_else(|e| format!("<logs unavailable: {}>", e));
        warn!(session_id = %self.session_id, container, logs = %logs, "Container exited during startup");
        ProvisionError::ContainerExited {
            container: container.to_string(),
            logs,
        }
    }

    /// Undo everything recorded so far, most recent first. Failures are logged.
    pub async fn rollback(&mut self) {
        while let Some(action) = self.compensations.pop() {
            info!(session_id = %self.session_id, action = %action, "Rolling back");
            if let Err(e) = compensate(self.runtime, &action).await {
                warn!(session_id = %self.session_id, action = %action, error = %e, "Rollback action failed");
            }
        }
    }

    pub fn compensations(&self) -> &[Compensation] {
        &self.compensations
    }
}

/// Steps that bring up a session in direct mode
pub fn direct_plan(names: &SessionNames, settings: &ProvisionerSettings, host_port: u16) -> Vec<Step> {
    vec![
        Step::CreateNetwork(names.network.clone()),
        Step::RunContainer(ContainerSpec {
            name: names.relay.clone(),
            image: settings.images.relay.clone(),
            network: settings.backend_network.clone(),
            env: vec![("ARGUMENTS".to_string(), settings.relay_arguments.clone())],
            auto_remove: true,
            ..Default::default()
        }),
        Step::ConnectNetwork {
            container: names.relay.clone(),
            network: names.network.clone(),
            alias: Some(RELAY_ALIAS.to_string()),
        },
        Step::RunContainer(ContainerSpec {
            name: names.client.clone(),
            image: settings.images.client.clone(),
            network: names.network.clone(),
            env: vec![("SERVER".to_string(), RELAY_ALIAS.to_string())],
            auto_remove: true,
            ..Default::default()
        }),
        Step::RunContainer(ContainerSpec {
            name: names.dashboard.clone(),
            image: settings.images.dashboard.clone(),
            network: names.network.clone(),
            env: vec![
                ("VOID_CONTAINER_NAME".to_string(), names.relay.clone()),
                ("CLIENT_CONTAINER_NAME".to_string(), names.client.clone()),
            ],
            published_port: Some(PortPublish {
                host_ip: settings.host_ip.clone(),
                host_port,
                container_port: settings.dashboard_port,
            }),
            auto_remove: true,
            ..Default::default()
        }),
        Step::VerifyRunning {
            container: names.dashboard.clone(),
            grace: settings.startup_grace,
            log_tail: settings.failure_log_tail,
        },
        Step::ConnectNetwork {
            container: names.dashboard.clone(),
            network: settings.backend_network.clone(),
            alias: None,
        },
    ]
}

/// Actions that remove everything a live session owns
pub fn teardown_plan(names: &SessionNames, settings: &ProvisionerSettings) -> Vec<Compensation> {
    match settings.mode {
        ProvisionMode::Direct => vec![
            Compensation::StopContainer(names.dashboard.clone()),
            Compensation::StopContainer(names.relay.clone()),
            Compensation::StopContainer(names.client.clone()),
            Compensation::RemoveNetwork(names.network.clone()),
        ],
        ProvisionMode::Compose => {
            vec![Compensation::ComposeDown(settings.compose_project(names))]
        }
    }
}

/// Container names of a compose project, by role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeRoles {
    pub dashboard: String,
    pub relay: String,
    pub client: String,
}

impl ComposeRoles {
    fn names(&self) -> [&str; 3] {
        [&self.dashboard, &self.relay, &self.client]
    }
}

/// Map compose containers to roles by their service label.
/// Every role must be claimed by exactly one container.
pub fn resolve_roles(containers: &[ServiceContainer]) -> Result<ComposeRoles, ProvisionError> {
    let mut found: HashMap<Role, &str> = HashMap::new();

    for container in containers {
        let Some(role) = container
            .service
            .as_deref()
            .and_then(Role::from_compose_service)
        else {
            continue;
        };

        if let Some(existing) = found.insert(role, container.name.as_str()) {
            return Err(ProvisionError::RoleUnresolved {
                role: role.compose_service().to_string(),
                detail: format!("claimed by both {} and {}", existing, container.name),
            });
        }
    }

    let mut take = |role: Role| {
        found
            .remove(&role)
            .map(str::to_string)
            .ok_or_else(|| ProvisionError::RoleUnresolved {
                role: role.compose_service().to_string(),
                detail: "no container carries this service label".to_string(),
            })
    };

    Ok(ComposeRoles {
        dashboard: take(Role::Dashboard)?,
        relay: take(Role::Relay)?,
        client: take(Role::Client)?,
    })
}

/// Bind an ephemeral loopback port and release it for the dashboard to use
pub fn allocate_host_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Directory an image is built from: the image's repository name without tag
pub fn image_build_dir(root: &Path, image: &str) -> PathBuf {
    let repository = image.rsplit('/').next().unwrap_or(image);
    let name = repository.split(':').next().unwrap_or(repository);
    root.join(name)
}

pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntime>,
    settings: ProvisionerSettings,
}

impl Provisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: ProvisionerSettings) -> Self {
        Self { runtime, settings }
    }

    pub fn settings(&self) -> &ProvisionerSettings {
        &self.settings
    }

    /// Create all resources for a session. Either succeeds completely or
    /// leaves nothing behind.
    pub async fn provision(&self, session: &Session) -> Result<SessionEndpoints, ProvisionError> {
        info!(session_id = %session.id, mode = ?self.settings.mode, "Provisioning session");

        let (endpoints, containers) = match self.settings.mode {
            ProvisionMode::Direct => self.provision_direct(session).await?,
            ProvisionMode::Compose => self.provision_compose(session).await?,
        };

        if self.settings.redirect_logs {
            for container in &containers {
                if let Some(shutdown) = self.runtime.follow_logs(container) {
                    session.attach_log_stream(shutdown);
                }
            }
        }

        info!(session_id = %session.id, entry = %endpoints.entry, "Session provisioned");
        Ok(endpoints)
    }

    async fn provision_direct(
        &self,
        session: &Session,
    ) -> Result<(SessionEndpoints, Vec<String>), ProvisionError> {
        let host_port = allocate_host_port().map_err(ProvisionError::PortAllocation)?;
        debug!(session_id = %session.id, host_port, "Allocated dashboard host port");

        let names = &session.names;
        let mut saga = Saga::new(self.runtime.as_ref(), &session.id);
        saga.run(direct_plan(names, &self.settings, host_port)).await?;

        let entry = format!("{}:{}", self.settings.host_ip, host_port);
        let endpoints = SessionEndpoints {
            probe_targets: vec![entry.clone()],
            entry,
        };
        let containers = Role::ALL
            .iter()
            .map(|role| names.container(*role).to_string())
            .collect();
        Ok((endpoints, containers))
    }

    async fn provision_compose(
        &self,
        session: &Session,
    ) -> Result<(SessionEndpoints, Vec<String>), ProvisionError> {
        let project = self.settings.compose_project(&session.names);
        let mut saga = Saga::new(self.runtime.as_ref(), &session.id);
        saga.run(vec![Step::ComposeUp(project.clone())]).await?;

        let resolved = match self.runtime.compose_containers(&project).await {
            Ok(containers) => resolve_roles(&containers),
            Err(source) => Err(ProvisionError::StepFailed {
                step: format!("list containers of {}", project.name),
                source,
            }),
        };

        let roles = match resolved {
            Ok(roles) => roles,
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Compose role resolution failed");
                saga.rollback().await;
                return Err(e);
            }
        };
        debug!(session_id = %session.id, ?roles, "Resolved compose roles");

        let port = self.settings.compose_service_port;
        let endpoints = SessionEndpoints {
            entry: format!("{}:{}", roles.dashboard, port),
            probe_targets: roles
                .names()
                .iter()
                .map(|name| format!("{}:{}", name, port))
                .collect(),
        };
        let containers = roles.names().iter().map(|n| n.to_string()).collect();
        Ok((endpoints, containers))
    }

    /// Remove everything a session owns. Failures are logged and skipped.
    pub async fn teardown(&self, session: &Session) {
        for action in teardown_plan(&session.names, &self.settings) {
            if let Err(e) = compensate(self.runtime.as_ref(), &action).await {
                warn!(session_id = %session.id, action = %action, error = %e, "Teardown action failed");
            }
        }
        info!(session_id = %session.id, "Session resources removed");
    }

    /// One-time startup checks. Any failure is fatal to the process.
    pub async fn ensure_prerequisites(&self) -> anyhow::Result<()> {
        match self.settings.mode {
            ProvisionMode::Compose => {
                self.runtime
                    .compose_build(&self.settings.compose_file)
                    .await
                    .with_context(|| {
                        format!(
                            "Failed to build compose services from {}",
                            self.settings.compose_file.display()
                        )
                    })?;
            }
            ProvisionMode::Direct => {
                self.ensure_backend_network().await?;
                self.ensure_images().await?;
                self.ensure_shared_service().await?;
            }
        }
        Ok(())
    }

    async fn ensure_backend_network(&self) -> anyhow::Result<()> {
        let network = &self.settings.backend_network;
        if self.runtime.network_exists(network).await? {
            debug!(network = %network, "Backend network already exists");
            return Ok(());
        }

        info!(network = %network, "Creating backend network");
        self.runtime
            .create_network(network)
            .await
            .with_context(|| format!("Failed to create backend network {}", network))
    }

    async fn ensure_images(&self) -> anyhow::Result<()> {
        let images = &self.settings.images;
        let root = &self.settings.image_build_root;

        for image in [&images.dashboard, &images.relay, &images.client, &images.shared_service] {
            if self.runtime.image_exists(image).await? {
                continue;
            }

            if !root.exists() {
                anyhow::bail!(
                    "Image {} is missing and build root {} does not exist",
                    image,
                    root.display()
                );
            }

            let dir = image_build_dir(root, image);
            info!(image = %image, dir = %dir.display(), "Image not found, building");
            self.runtime
                .build_image(image, &dir)
                .await
                .with_context(|| format!("Failed to build image {}", image))?;
        }
        Ok(())
    }

    async fn ensure_shared_service(&self) -> anyhow::Result<()> {
        let name = &self.settings.shared_service_name;
        if self.runtime.container_running(name).await? {
            info!(container = %name, "Shared service already running");
            return Ok(());
        }

        self.runtime.remove_container(name).await?;

        info!(container = %name, "Starting shared service");
        let spec = ContainerSpec {
            name: name.clone(),
            image: self.settings.images.shared_service.clone(),
            network: self.settings.backend_network.clone(),
            env: self
                .settings
                .shared_service_env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            auto_remove: true,
            ..Default::default()
        };
        self.runtime
            .run_container(&spec)
            .await
            .with_context(|| format!("Failed to start shared service {}", name))
    }
}
