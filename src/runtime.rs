//! Container runtime abstraction
//!
//! Provisioning only talks to a [`ContainerRuntime`]. The Docker-backed
//! implementation lives in [`crate::docker`]; [`MemoryRuntime`] keeps all state
//! in memory and is used to exercise provisioning and teardown without a daemon.

use crate::error::{RuntimeError, RuntimeResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;

/// Label compose puts on every container it creates
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Host port binding for a container port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPublish {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
}

/// What to run and where
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Network the container starts attached to
    pub network: String,
    /// Alias on `network`, if any
    pub alias: Option<String>,
    pub env: Vec<(String, String)>,
    pub published_port: Option<PortPublish>,
    /// Runtime removes the container once it stops
    pub auto_remove: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeProject {
    pub name: String,
    pub file: PathBuf,
}

/// A container belonging to a compose project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContainer {
    pub name: String,
    /// Value of the compose service label, if present
    pub service: Option<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn network_exists(&self, name: &str) -> RuntimeResult<bool>;

    async fn create_network(&self, name: &str) -> RuntimeResult<()>;

    /// Succeeds if the network is already gone
    async fn remove_network(&self, name: &str) -> RuntimeResult<()>;

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool>;

    async fn build_image(&self, image: &str, context: &Path) -> RuntimeResult<()>;

    /// Create and start a container. Nothing is left behind if this fails.
    async fn run_container(&self, spec: &ContainerSpec) -> RuntimeResult<()>;

    async fn connect_network(
        &self,
        container: &str,
        network: &str,
        alias: Option<&str>,
    ) -> RuntimeResult<()>;

    async fn container_running(&self, name: &str) -> RuntimeResult<bool>;

    async fn container_logs(&self, name: &str, tail: usize) -> RuntimeResult<String>;

    /// Stop immediately. Succeeds if the container is already gone.
    async fn stop_container(&self, name: &str) -> RuntimeResult<()>;

    /// Force-remove. Succeeds if the container is already gone.
    async fn remove_container(&self, name: &str) -> RuntimeResult<()>;

    async fn compose_build(&self, file: &Path) -> RuntimeResult<()>;

    async fn compose_up(&self, project: &ComposeProject) -> RuntimeResult<()>;

    /// Remove the project's containers, networks and volumes
    async fn compose_down(&self, project: &ComposeProject) -> RuntimeResult<()>;

    async fn compose_containers(
        &self,
        project: &ComposeProject,
    ) -> RuntimeResult<Vec<ServiceContainer>>;

    /// Start following a container's output. Sending `true` on the returned
    /// channel stops the follower.
    fn follow_logs(&self, container: &str) -> Option<watch::Sender<bool>>;
}

/// Operation kinds of [`MemoryRuntime`], used for failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuntimeOp {
    CreateNetwork,
    RemoveNetwork,
    BuildImage,
    RunContainer,
    ConnectNetwork,
    StopContainer,
    ComposeUp,
    ComposeDown,
}

#[derive(Debug, Clone)]
struct MemoryContainer {
    image: String,
    networks: Vec<(String, Option<String>)>,
    env: Vec<(String, String)>,
    running: bool,
    auto_remove: bool,
    project: Option<String>,
    service: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    networks: BTreeSet<String>,
    images: BTreeSet<String>,
    containers: BTreeMap<String, MemoryContainer>,
    failures: Vec<(RuntimeOp, String)>,
    delays: Vec<(RuntimeOp, String, Duration)>,
    exits_on_start: Vec<String>,
    compose_services: Option<Vec<String>>,
    operations: Vec<String>,
}

impl MemoryState {
    fn check_failure(&self, op: RuntimeOp, target: &str) -> RuntimeResult<()> {
        let injected = self
            .failures
            .iter()
            .any(|(failing, prefix)| *failing == op && target.starts_with(prefix.as_str()));
        if injected {
            return Err(RuntimeError::CommandFailed {
                command: format!("{:?} {}", op, target),
                output: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn attached_to(&self, network: &str) -> Vec<String> {
        self.containers
            .iter()
            .filter(|(_, c)| c.networks.iter().any(|(n, _)| n == network))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// In-memory container runtime.
///
/// Mirrors the Docker semantics provisioning relies on: auto-removed
/// containers disappear when stopped, and a network cannot be removed while
/// containers are still attached to it.
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `op` whose target name starts with `prefix` fail
    pub fn fail_on(&self, op: RuntimeOp, prefix: impl Into<String>) {
        self.state.lock().failures.push((op, prefix.into()));
    }

    /// Make every `op` whose target name starts with `prefix` take `delay`.
    /// Applies to `run_container` and `connect_network`.
    pub fn delay_on(&self, op: RuntimeOp, prefix: impl Into<String>, delay: Duration) {
        self.state.lock().delays.push((op, prefix.into(), delay));
    }

    async fn pause(&self, op: RuntimeOp, target: &str) {
        let delay = self
            .state
            .lock()
            .delays
            .iter()
            .find(|(delayed, prefix, _)| *delayed == op && target.starts_with(prefix.as_str()))
            .map(|(_, _, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Containers whose name starts with `prefix` stop right after starting
    pub fn exit_on_start(&self, prefix: impl Into<String>) {
        self.state.lock().exits_on_start.push(prefix.into());
    }

    /// Services `compose_up` creates. Defaults to dashboard, void and client.
    pub fn set_compose_services(&self, services: Vec<String>) {
        self.state.lock().compose_services = Some(services);
    }

    pub fn add_image(&self, image: impl Into<String>) {
        self.state.lock().images.insert(image.into());
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().networks.iter().cloned().collect()
    }

    pub fn images(&self) -> Vec<String> {
        self.state.lock().images.iter().cloned().collect()
    }

    pub fn containers(&self) -> Vec<String> {
        self.state.lock().containers.keys().cloned().collect()
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.state.lock().containers.contains_key(name)
    }

    /// Networks a container is attached to, with their aliases
    pub fn container_networks(&self, name: &str) -> Vec<(String, Option<String>)> {
        self.state
            .lock()
            .containers
            .get(name)
            .map(|c| c.networks.clone())
            .unwrap_or_default()
    }

    pub fn container_env(&self, name: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .containers
            .get(name)
            .map(|c| c.env.clone())
            .unwrap_or_default()
    }

    pub fn container_image(&self, name: &str) -> Option<String> {
        self.state.lock().containers.get(name).map(|c| c.image.clone())
    }

    /// Log of every call, in order, e.g. `"run_container dashboard-abc"`
    pub fn operations(&self) -> Vec<String> {
        self.state.lock().operations.clone()
    }

    /// Number of recorded calls starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .operations
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }

    fn record(&self, state: &mut MemoryState, op: String) {
        state.operations.push(op);
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn network_exists(&self, name: &str) -> RuntimeResult<bool> {
        Ok(self.state.lock().networks.contains(name))
    }

    async fn create_network(&self, name: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("create_network {}", name));
        state.check_failure(RuntimeOp::CreateNetwork, name)?;
        if !state.networks.insert(name.to_string()) {
            return Err(RuntimeError::CommandFailed {
                command: format!("network create {}", name),
                output: "network already exists".to_string(),
            });
        }
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("remove_network {}", name));
        state.check_failure(RuntimeOp::RemoveNetwork, name)?;
        let attached = state.attached_to(name);
        if !attached.is_empty() {
            return Err(RuntimeError::CommandFailed {
                command: format!("network rm {}", name),
                output: format!("network has active endpoints: {}", attached.join(", ")),
            });
        }
        state.networks.remove(name);
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        Ok(self.state.lock().images.contains(image))
    }

    async fn build_image(&self, image: &str, context: &Path) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        self.record(
            &mut state,
            format!("build_image {} {}", image, context.display()),
        );
        state.check_failure(RuntimeOp::BuildImage, image)?;
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> RuntimeResult<()> {
        self.pause(RuntimeOp::RunContainer, &spec.name).await;
        let mut state = self.state.lock();
        self.record(&mut state, format!("run_container {}", spec.name));
        state.check_failure(RuntimeOp::RunContainer, &spec.name)?;

        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::CommandFailed {
                command: format!("run {}", spec.name),
                output: "container name already in use".to_string(),
            });
        }
        if !state.networks.contains(&spec.network) {
            return Err(RuntimeError::NotFound {
                kind: "network",
                name: spec.network.clone(),
            });
        }

        let exits = state
            .exits_on_start
            .iter()
            .any(|prefix| spec.name.starts_with(prefix.as_str()));
        // An auto-removed container that exits is gone immediately
        if exits && spec.auto_remove {
            return Ok(());
        }

        state.containers.insert(
            spec.name.clone(),
            MemoryContainer {
                image: spec.image.clone(),
                networks: vec![(spec.network.clone(), spec.alias.clone())],
                env: spec.env.clone(),
                running: !exits,
                auto_remove: spec.auto_remove,
                project: None,
                service: None,
            },
        );
        Ok(())
    }

    async fn connect_network(
        &self,
        container: &str,
        network: &str,
        alias: Option<&str>,
    ) -> RuntimeResult<()> {
        self.pause(RuntimeOp::ConnectNetwork, container).await;
        let mut state = self.state.lock();
        self.record(
            &mut state,
            format!("connect_network {} {}", container, network),
        );
        state.check_failure(RuntimeOp::ConnectNetwork, container)?;

        if !state.networks.contains(network) {
            return Err(RuntimeError::NotFound {
                kind: "network",
                name: network.to_string(),
            });
        }
        let entry = state
            .containers
            .get_mut(container)
            .ok_or_else(|| RuntimeError::NotFound {
                kind: "container",
                name: container.to_string(),
            })?;
        entry
            .networks
            .push((network.to_string(), alias.map(str::to_string)));
        Ok(())
    }

    async fn container_running(&self, name: &str) -> RuntimeResult<bool> {
        Ok(self
            .state
            .lock()
            .containers
            .get(name)
            .map(|c| c.running)
            .unwrap_or(false))
    }

    async fn container_logs(&self, name: &str, tail: usize) -> RuntimeResult<String> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("container_logs {} {}", name, tail));
        Ok(format!("{}: exited during startup\n", name))
    }

    async fn stop_container(&self, name: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("stop_container {}", name));
        state.check_failure(RuntimeOp::StopContainer, name)?;

        let auto_remove = match state.containers.get_mut(name) {
            Some(container) => {
                container.running = false;
                container.auto_remove
            }
            None => return Ok(()),
        };
        if auto_remove {
            state.containers.remove(name);
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("remove_container {}", name));
        state.containers.remove(name);
        Ok(())
    }

    async fn compose_build(&self, file: &Path) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("compose_build {}", file.display()));
        state.check_failure(RuntimeOp::BuildImage, &file.display().to_string())
    }

    async fn compose_up(&self, project: &ComposeProject) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("compose_up {}", project.name));

        let services = state.compose_services.clone().unwrap_or_else(|| {
            vec!["dashboard".to_string(), "void".to_string(), "client".to_string()]
        });
        let network = format!("{}_default", project.name);
        state.networks.insert(network.clone());

        // Like compose, a failing `up` can leave part of the project behind
        for (index, service) in services.iter().enumerate() {
            let name = format!("{}-{}-{}", project.name, service, index + 1);
            state.containers.insert(
                name,
                MemoryContainer {
                    image: format!("{}:latest", service),
                    networks: vec![(network.clone(), Some(service.clone()))],
                    env: Vec::new(),
                    running: true,
                    auto_remove: false,
                    project: Some(project.name.clone()),
                    service: Some(service.clone()),
                },
            );
        }

        state.check_failure(RuntimeOp::ComposeUp, &project.name)
    }

    async fn compose_down(&self, project: &ComposeProject) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("compose_down {}", project.name));
        state.check_failure(RuntimeOp::ComposeDown, &project.name)?;

        state
            .containers
            .retain(|_, c| c.project.as_deref() != Some(project.name.as_str()));
        state.networks.remove(&format!("{}_default", project.name));
        Ok(())
    }

    async fn compose_containers(
        &self,
        project: &ComposeProject,
    ) -> RuntimeResult<Vec<ServiceContainer>> {
        Ok(self
            .state
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| c.project.as_deref() == Some(project.name.as_str()))
            .map(|(name, c)| ServiceContainer {
                name: name.clone(),
                service: c.service.clone(),
            })
            .collect())
    }

    fn follow_logs(&self, container: &str) -> Option<watch::Sender<bool>> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("follow_logs {}", container));
        let (tx, _rx) = watch::channel(false);
        Some(tx)
    }
}
