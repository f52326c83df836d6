//! Docker implementation of [`ContainerRuntime`]
//!
//! Container and network lifecycle go through the Docker API. Image builds
//! and compose projects go through the docker CLI.

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{
    ComposeProject, ContainerRuntime, ContainerSpec, ServiceContainer, COMPOSE_PROJECT_LABEL,
    COMPOSE_SERVICE_LABEL,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const DOCKER_TIMEOUT_SECS: u64 = 120;

fn is_status(err: &bollard::errors::Error, codes: &[u16]) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if codes.contains(status_code)
    )
}

pub struct DockerRuntime {
    client: Docker,
    docker_path: String,
    build_platform: Option<String>,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths
    pub async fn connect(
        docker_host: Option<&str>,
        docker_path: impl Into<String>,
        build_platform: Option<String>,
    ) -> anyhow::Result<Self> {
        let client = match docker_host {
            Some(host) => Self::connect_to_host(host)?,
            None => match std::env::var("DOCKER_HOST") {
                Ok(host) => Self::connect_to_host(&host)?,
                Err(_) => Self::connect_with_defaults().await?,
            },
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            docker_path: docker_path.into(),
            build_platform,
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let candidates = [
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
        ];

        for path in candidates.iter().filter(|p| Path::new(p).exists()) {
            debug!(path = %path, "Found Docker socket");
            if let Ok(client) =
                Docker::connect_with_socket(path, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            {
                if client.ping().await.is_ok() {
                    return Ok(client);
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon. Start dockerd or set DOCKER_HOST. Underlying error: {}",
                e
            )
        })
    }

    /// Run the docker CLI, returning combined output
    async fn run_cli(&self, args: &[&str]) -> RuntimeResult<String> {
        let command = format!("{} {}", self.docker_path, args.join(" "));
        debug!(command = %command, "Running docker CLI");

        let output = Command::new(&self.docker_path).args(args).output().await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command,
                output: combined.trim().to_string(),
            });
        }
        Ok(combined)
    }

    fn compose_args<'a>(project: &'a ComposeProject, file: &'a str) -> Vec<&'a str> {
        vec!["compose", "--project-name", &project.name, "--file", file]
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn network_exists(&self, name: &str) -> RuntimeResult<bool> {
        match self.client.inspect_network::<String>(name, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, &[404]) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_network(&self, name: &str) -> RuntimeResult<()> {
        self.client
            .create_network(CreateNetworkOptions {
                name,
                driver: "bridge",
                ..Default::default()
            })
            .await?;
        info!(network = name, "Created Docker network");
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
        match self.client.remove_network(name).await {
            Ok(_) => {
                debug!(network = name, "Removed Docker network");
                Ok(())
            }
            Err(e) if is_status(&e, &[404]) => {
                debug!(network = name, "Network not found");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, &[404]) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_image(&self, image: &str, context: &Path) -> RuntimeResult<()> {
        let context = context.display().to_string();
        let mut args = vec!["build"];
        if let Some(platform) = &self.build_platform {
            args.extend(["--platform", platform.as_str()]);
        }
        args.extend(["-t", image, context.as_str()]);

        info!(image, context = %context, "Building image");
        self.run_cli(&args).await?;
        info!(image, "Image built");
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> RuntimeResult<()> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut host_config = HostConfig {
            network_mode: Some(spec.network.clone()),
            auto_remove: Some(spec.auto_remove),
            ..Default::default()
        };

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        if let Some(publish) = &spec.published_port {
            let port_key = format!("{}/tcp", publish.container_port);
            let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
            port_bindings.insert(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some(publish.host_ip.clone()),
                    host_port: Some(publish.host_port.to_string()),
                }]),
            );
            host_config.port_bindings = Some(port_bindings);
            exposed_ports.insert(port_key, HashMap::new());
        }

        let networking_config = spec.alias.as_ref().map(|alias| {
            let mut endpoints_config = HashMap::new();
            endpoints_config.insert(
                spec.network.clone(),
                EndpointSettings {
                    aliases: Some(vec![alias.clone()]),
                    ..Default::default()
                },
            );
            NetworkingConfig { endpoints_config }
        });

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let response = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        debug!(container = %spec.name, id = %response.id, image = %spec.image, "Created container");

        if let Err(e) = self
            .client
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            // A created-but-never-started container is not auto-removed
            if let Err(cleanup) = self.remove_container(&response.id).await {
                warn!(container = %spec.name, id = %response.id, error = %cleanup, "Failed to remove container that did not start");
            }
            return Err(e.into());
        }

        info!(container = %spec.name, network = %spec.network, "Started container");
        Ok(())
    }

    async fn connect_network(
        &self,
        container: &str,
        network: &str,
        alias: Option<&str>,
    ) -> RuntimeResult<()> {
        self.client
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container,
                    endpoint_config: EndpointSettings {
                        aliases: alias.map(|a| vec![a.to_string()]),
                        ..Default::default()
                    },
                },
            )
            .await?;
        debug!(container, network, alias, "Connected container to network");
        Ok(())
    }

    async fn container_running(&self, name: &str) -> RuntimeResult<bool> {
        match self.client.inspect_container(name, None).await {
            Ok(info) => Ok(info.state.and_then(|s| s.running).unwrap_or(false)),
            Err(e) if is_status(&e, &[404]) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn container_logs(&self, name: &str, tail: usize) -> RuntimeResult<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(name, Some(options));
        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => logs.push_str(&String::from_utf8_lossy(&output.into_bytes())),
                Err(e) => {
                    // The container may already be gone along with its logs
                    debug!(container = name, error = %e, "Stopped reading container logs");
                    break;
                }
            }
        }
        Ok(logs)
    }

    async fn stop_container(&self, name: &str) -> RuntimeResult<()> {
        match self
            .client
            .stop_container(name, Some(StopContainerOptions { t: 0 }))
            .await
        {
            Ok(_) => {
                info!(container = name, "Stopped container");
                Ok(())
            }
            Err(e) if is_status(&e, &[304, 404]) => {
                debug!(container = name, "Container already stopped or gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, name: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(name, Some(options)).await {
            Ok(_) => {
                debug!(container = name, "Removed container");
                Ok(())
            }
            // 409: removal already in progress for an auto-removed container
            Err(e) if is_status(&e, &[404, 409]) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn compose_build(&self, file: &Path) -> RuntimeResult<()> {
        let file = file.display().to_string();
        info!(file = %file, "Building compose services");
        self.run_cli(&["compose", "--file", &file, "build"]).await?;
        Ok(())
    }

    async fn compose_up(&self, project: &ComposeProject) -> RuntimeResult<()> {
        let file = project.file.display().to_string();
        let mut args = Self::compose_args(project, &file);
        args.extend(["up", "--build", "--detach"]);
        self.run_cli(&args).await?;
        info!(project = %project.name, "Compose project up");
        Ok(())
    }

    async fn compose_down(&self, project: &ComposeProject) -> RuntimeResult<()> {
        let file = project.file.display().to_string();
        let mut args = Self::compose_args(project, &file);
        args.extend(["down", "--remove-orphans", "--volumes"]);
        self.run_cli(&args).await?;
        info!(project = %project.name, "Compose project down");
        Ok(())
    }

    async fn compose_containers(
        &self,
        project: &ComposeProject,
    ) -> RuntimeResult<Vec<ServiceContainer>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", COMPOSE_PROJECT_LABEL, project.name)],
        );

        let summaries = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())?
                    .trim_start_matches('/')
                    .to_string();
                let service = summary
                    .labels
                    .and_then(|mut labels| labels.remove(COMPOSE_SERVICE_LABEL));
                Some(ServiceContainer { name, service })
            })
            .collect())
    }

    fn follow_logs(&self, container: &str) -> Option<watch::Sender<bool>> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let client = self.client.clone();
        let container = container.to_string();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut log_stream = client.logs(&container, Some(options));

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!(container = %container, "Log streaming stopped");
                        break;
                    }
                    next = log_stream.next() => match next {
                        Some(Ok(output)) => emit_log_line(&container, output),
                        Some(Err(e)) => {
                            warn!(container = %container, error = %e, "Error reading container logs");
                            break;
                        }
                        None => {
                            debug!(container = %container, "Container log stream ended");
                            break;
                        }
                    }
                }
            }
        });

        Some(shutdown_tx)
    }
}

fn emit_log_line(container: &str, output: LogOutput) {
    let (stream, message) = match output {
        LogOutput::StdOut { message } => ("stdout", message),
        LogOutput::StdErr { message } => ("stderr", message),
        LogOutput::Console { message } => ("console", message),
        LogOutput::StdIn { .. } => return,
    };

    let text = String::from_utf8_lossy(&message);
    for line in text.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
        if stream == "stderr" {
            warn!(target: "container", container, stream, "{}", line);
        } else {
            info!(target: "container", container, stream, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(status_code: u16) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: "test".to_string(),
        }
    }

    #[test]
    fn test_is_status() {
        // Removal tolerates these; anything else is reported
        assert!(is_status(&server_error(404), &[404, 409]));
        assert!(is_status(&server_error(409), &[404, 409]));
        assert!(!is_status(&server_error(500), &[404, 409]));
        assert!(!is_status(&bollard::errors::Error::RequestTimeoutError, &[404]));
    }

    #[test]
    fn test_compose_args() {
        let project = ComposeProject {
            name: "abc".to_string(),
            file: "session.yml".into(),
        };
        assert_eq!(
            DockerRuntime::compose_args(&project, "session.yml"),
            vec!["compose", "--project-name", "abc", "--file", "session.yml"]
        );
    }
}
