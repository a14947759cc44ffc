//! Docker Engine runtime over the local API socket

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;

use super::{ContainerRuntime, UnitSpec};
use crate::{Error, Result};

/// Label attached to every container we create
pub const MANAGED_LABEL: &str = "unit-spawner.managed";

/// Seconds Docker waits for a graceful stop before killing
const STOP_GRACE_SECS: i64 = 2;

const CONNECT_TIMEOUT_SECS: u64 = 120;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the daemon over a unix socket path
    pub fn connect(socket_path: &str) -> Result<Self> {
        let docker = Docker::connect_with_socket(
            socket_path,
            CONNECT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check the daemon is reachable
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Running containers created by any spawner on this daemon
    pub async fn count_units(&self) -> Result<usize> {
        let filters = HashMap::from([("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)])]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers.len())
    }

    fn container_config(spec: &UnitSpec) -> Config<String> {
        let port_bindings = HashMap::from([(
            spec.container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some(spec.host_ip.to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        )]);

        Config {
            image: Some(spec.image.clone()),
            exposed_ports: Some(HashMap::from([(spec.container_port.clone(), HashMap::new())])),
            labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                pids_limit: Some(spec.pids_limit),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_unit(&self, spec: &UnitSpec) -> Result<String> {
        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, Self::container_config(spec))
            .await
            .map_err(|e| Error::from_docker_create(e, &spec.image))?;

        for warning in &response.warnings {
            tracing::warn!(unit = %response.id, %warning, "docker create warning");
        }
        Ok(response.id)
    }

    async fn start_unit(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::from_docker(e, id))
    }

    async fn stop_unit(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
            .map_err(|e| Error::from_docker(e, id))
    }

    async fn remove_unit(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::from_docker(e, id))
    }
}
