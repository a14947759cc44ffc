//! Container runtime boundary
//!
//! The spawner only ever needs four calls from a runtime: create, start,
//! stop and remove. Anything that can express those is substitutable.

pub mod docker;

use std::net::IpAddr;

use async_trait::async_trait;

use crate::Result;

pub use docker::DockerRuntime;

/// Everything a runtime needs to create one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub image: String,
    /// Host interface the port mapping is published on
    pub host_ip: IpAddr,
    pub host_port: u16,
    /// `<port>/<proto>` inside the unit
    pub container_port: String,
    pub pids_limit: i64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a unit and return its runtime-assigned id
    async fn create_unit(&self, spec: &UnitSpec) -> Result<String>;

    async fn start_unit(&self, id: &str) -> Result<()>;

    /// Returns `Error::UnitNotFound` if the unit is already stopped or gone
    async fn stop_unit(&self, id: &str) -> Result<()>;

    /// Returns `Error::UnitNotFound` if the unit is already gone
    async fn remove_unit(&self, id: &str) -> Result<()>;
}
