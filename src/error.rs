//! Error types for the unit spawner

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provisioning failed: {0}")]
    Provision(String),

    #[error("Decommissioning unit {unit} failed: {reason}")]
    Decommission { unit: String, reason: String },

    #[error("Unit not found: {0}")]
    UnitNotFound(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The runtime no longer knows about the unit (already stopped or removed)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::UnitNotFound(_))
    }

    /// Map a Docker API error, folding "gone" responses into `UnitNotFound`
    pub fn from_docker(err: bollard::errors::Error, unit: &str) -> Self {
        match err {
            // 304 = already stopped, 404 = no such container
            bollard::errors::Error::DockerResponseServerError { status_code: 304 | 404, .. } => {
                Error::UnitNotFound(unit.to_string())
            }
            bollard::errors::Error::DockerResponseServerError { status_code, message } => {
                Error::Runtime(format!("{}: HTTP {} {}", unit, status_code, message))
            }
            other => Error::Docker(other),
        }
    }

    /// Map a Docker error from container creation. Nothing exists yet at
    /// that point, so a 404 names the missing image rather than a unit.
    pub fn from_docker_create(err: bollard::errors::Error, image: &str) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError { status_code: 404, message } => {
                Error::Runtime(format!("image {}: {}", image, message))
            }
            other => Error::from_docker(other, image),
        }
    }
}
