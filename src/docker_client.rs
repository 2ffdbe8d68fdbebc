use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use futures_util::StreamExt;
use secrecy::ExposeSecret;

use crate::config::RegistryConfig;
use crate::errors::RuntimeError;
use crate::runtime::{ContainerRuntime, InstanceHandle, InstanceSpec, RunningInstance};

pub const APP_LABEL: &str = "slick.app";
pub const PORT_LABEL: &str = "slick.port";
pub const GENERATION_LABEL: &str = "slick.generation";

/// Container runtime backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    stop_timeout_secs: i64,
}

impl DockerRuntime {
    /// Connects using `DOCKER_HOST` or the platform's default socket.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            stop_timeout_secs: 10,
        })
    }

    /// Pulls `image`, authenticating against its registry when credentials are set.
    async fn pull_image(
        &self,
        image: &str,
        registry: Option<&RegistryConfig>,
    ) -> Result<(), RuntimeError> {
        let (from_image, tag) = split_image_reference(image);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        let credentials = registry.map(|r| DockerCredentials {
            username: Some(r.username.clone()),
            password: Some(r.password.expose_secret().to_string()),
            serveraddress: registry_host(image).map(str::to_string),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(Some(options), None, credentials);
        while let Some(progress) = stream.next().await {
            let info = progress?;
            if let Some(status) = info.status {
                tracing::trace!(image, %status, "pull progress");
            }
        }
        tracing::debug!(image, "image pulled");
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: &InstanceSpec<'_>) -> Result<InstanceHandle, RuntimeError> {
        self.pull_image(spec.image, spec.registry).await?;

        let name = spec.container_name();
        let container_port = format!("{}/tcp", spec.container_port);
        let labels = HashMap::from([
            (APP_LABEL.to_string(), spec.app_name.to_string()),
            (PORT_LABEL.to_string(), spec.host_port.to_string()),
            (GENERATION_LABEL.to_string(), spec.generation.to_string()),
        ]);
        let host_config = HostConfig {
            port_bindings: Some(HashMap::from([(
                container_port.clone(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(spec.host_port.to_string()),
                }]),
            )])),
            network_mode: spec.network.map(str::to_string),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.to_string()),
            env: Some(spec.env.to_vec()),
            labels: Some(labels),
            exposed_ports: Some(HashMap::from([(container_port, HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = self.remove(&created.id).await {
                tracing::warn!(container = %name, error = %cleanup, "failed to remove unstarted container");
            }
            return Err(e.into());
        }

        tracing::info!(container = %name, id = %created.id, port = spec.host_port, "container started");
        Ok(InstanceHandle::new(created.id))
    }

    async fn stop(&self, handle: &InstanceHandle) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: self.stop_timeout_secs,
        };
        match self.docker.stop_container(handle.as_str(), Some(options)).await {
            // 304: already stopped, 404: already gone
            Ok(())
            | Err(DockerError::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {}
            Err(e) => return Err(e.into()),
        }
        self.remove(handle.as_str()).await?;
        tracing::info!(container = %handle, "container stopped and removed");
        Ok(())
    }

    async fn find_running(&self, app_name: &str) -> Result<Option<RunningInstance>, RuntimeError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{APP_LABEL}={app_name}")],
        )]);
        let options = ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        };

        let mut containers = self.docker.list_containers(Some(options)).await?;
        containers.sort_by_key(|c| std::cmp::Reverse(c.created.unwrap_or_default()));

        for container in containers {
            let Some(id) = container.id else { continue };
            let labels = container.labels.unwrap_or_default();
            let Some(host_port) = labels.get(PORT_LABEL).and_then(|p| p.parse::<u16>().ok()) else {
                tracing::warn!(container = %id, "running container has no usable {PORT_LABEL} label");
                continue;
            };
            let generation = labels
                .get(GENERATION_LABEL)
                .and_then(|g| g.parse::<u64>().ok())
                .unwrap_or_default();
            return Ok(Some(RunningInstance {
                handle: InstanceHandle::new(id),
                host_port,
                generation,
            }));
        }
        Ok(None)
    }
}

/// Splits `repo[:tag]` for the pull API; an empty tag would pull every tag.
fn split_image_reference(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}

/// Registry host of an image reference, `None` for Docker Hub.
fn registry_host(image: &str) -> Option<&str> {
    let (first, _) = image.split_once('/')?;
    (first.contains('.') || first.contains(':') || first == "localhost").then_some(first)
}
