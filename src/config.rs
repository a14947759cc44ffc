//! Spawner configuration with builder pattern

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default process-count ceiling applied to every unit
pub const DEFAULT_PIDS_LIMIT: i64 = 20;

/// Post-start wait before a unit is treated as ready. Without it the first
/// proxied connection is occasionally reset by the still-booting service.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 200;

/// How long a parked unit stays warm in reuse mode
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 300_000;

/// How long shutdown waits for in-flight sessions before tearing their units down
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;

pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Validated, immutable spawner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawConfig")]
pub struct SpawnerConfig {
    pub image: String,
    pub host: String,
    pub listen_port: u16,
    /// Normalized `<port>/<proto>` inside the unit, e.g. `22/tcp`
    pub container_port: String,
    /// Minimum spacing between session starts per source address; `<= 0` disables
    pub rate_limit_ms: i64,
    /// Hard cap on proxy duration; `None` is unbounded
    pub session_timeout_ms: Option<u64>,
    pub pids_limit: i64,
    pub settle_delay_ms: u64,
    pub reuse: bool,
    pub idle_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub docker_socket: String,
}

/// Wire shape of the config file. Every field is optional here so that a
/// missing required property is reported as a configuration error naming it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
    pub image: Option<String>,
    pub host: Option<String>,
    #[serde(alias = "port")]
    pub listen_port: Option<u16>,
    #[serde(alias = "targetPort")]
    pub container_port: Option<PortSpec>,
    #[serde(alias = "rateLimit", alias = "rateLimitMs")]
    pub rate_limit_interval_ms: Option<i64>,
    #[serde(alias = "timeout")]
    pub session_timeout_ms: Option<u64>,
    pub pids_limit: Option<i64>,
    pub settle_delay_ms: Option<u64>,
    pub reuse: Option<bool>,
    #[serde(alias = "idleTimeout")]
    pub idle_timeout_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
    pub docker_socket: Option<String>,
}

/// A container port given either as a bare number or as `"22/tcp"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Number(u16),
    Text(String),
}

impl PortSpec {
    fn normalize(&self) -> Result<String> {
        let text = match self {
            PortSpec::Number(n) => n.to_string(),
            PortSpec::Text(s) => s.trim().to_string(),
        };

        let (port, proto) = match text.split_once('/') {
            Some((port, proto)) => (port, proto.to_ascii_lowercase()),
            None => (text.as_str(), "tcp".to_string()),
        };

        match port.parse::<u16>() {
            Ok(p) if p > 0 => {}
            _ => return Err(Error::Config(format!("invalid containerPort '{}'", text))),
        }
        if !matches!(proto.as_str(), "tcp" | "udp" | "sctp") {
            return Err(Error::Config(format!("invalid containerPort protocol '{}'", proto)));
        }

        Ok(format!("{}/{}", port, proto))
    }
}

impl TryFrom<RawConfig> for SpawnerConfig {
    type Error = Error;

    fn try_from(raw: RawConfig) -> Result<Self> {
        let image = raw.image.ok_or_else(|| missing("image"))?;
        let listen_port = raw.listen_port.ok_or_else(|| missing("listenPort"))?;
        let container_port = raw
            .container_port
            .ok_or_else(|| missing("containerPort"))?
            .normalize()?;

        let config = Self {
            image,
            host: raw.host.unwrap_or_else(|| DEFAULT_BIND_HOST.to_string()),
            listen_port,
            container_port,
            rate_limit_ms: raw.rate_limit_interval_ms.unwrap_or(0),
            // 0 means "no timeout", same as absent
            session_timeout_ms: raw.session_timeout_ms.filter(|ms| *ms > 0),
            pids_limit: raw.pids_limit.unwrap_or(DEFAULT_PIDS_LIMIT),
            settle_delay_ms: raw.settle_delay_ms.unwrap_or(DEFAULT_SETTLE_DELAY_MS),
            reuse: raw.reuse.unwrap_or(false),
            idle_timeout_ms: raw.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS),
            shutdown_grace_ms: raw.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            docker_socket: raw
                .docker_socket
                .unwrap_or_else(|| DEFAULT_DOCKER_SOCKET.to_string()),
        };
        config.validate()?;
        Ok(config)
    }
}

fn missing(prop: &str) -> Error {
    Error::Config(format!("Required property {} not found in config", prop))
}

impl SpawnerConfig {
    pub fn builder() -> SpawnerConfigBuilder {
        SpawnerConfigBuilder::default()
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(json)?;
        Self::try_from(raw)
    }

    /// Load a JSON config file. A missing file is fatal.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::Config("image cannot be empty".into()));
        }
        if self.pids_limit < 1 {
            return Err(Error::Config("pidsLimit must be at least 1".into()));
        }
        if self.reuse && self.idle_timeout_ms == 0 {
            return Err(Error::Config("idleTimeoutMs must be positive when reuse is enabled".into()));
        }
        PortSpec::Text(self.container_port.clone()).normalize()?;
        Ok(())
    }

    /// `None` when rate limiting is disabled
    pub fn rate_limit_interval(&self) -> Option<Duration> {
        (self.rate_limit_ms > 0).then(|| Duration::from_millis(self.rate_limit_ms as u64))
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_ms.map(Duration::from_millis)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.listen_port)
    }
}

#[derive(Default)]
pub struct SpawnerConfigBuilder {
    raw: RawConfig,
}

impl SpawnerConfigBuilder {
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.raw.image = Some(image.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.raw.host = Some(host.into());
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.raw.listen_port = Some(port);
        self
    }

    pub fn container_port(mut self, port: impl Into<String>) -> Self {
        self.raw.container_port = Some(PortSpec::Text(port.into()));
        self
    }

    pub fn rate_limit_ms(mut self, ms: i64) -> Self {
        self.raw.rate_limit_interval_ms = Some(ms);
        self
    }

    pub fn session_timeout_ms(mut self, ms: u64) -> Self {
        self.raw.session_timeout_ms = Some(ms);
        self
    }

    pub fn pids_limit(mut self, limit: i64) -> Self {
        self.raw.pids_limit = Some(limit);
        self
    }

    pub fn settle_delay_ms(mut self, ms: u64) -> Self {
        self.raw.settle_delay_ms = Some(ms);
        self
    }

    pub fn reuse(mut self, reuse: bool) -> Self {
        self.raw.reuse = Some(reuse);
        self
    }

    pub fn idle_timeout_ms(mut self, ms: u64) -> Self {
        self.raw.idle_timeout_ms = Some(ms);
        self
    }

    pub fn shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.raw.shutdown_grace_ms = Some(ms);
        self
    }

    pub fn docker_socket(mut self, path: impl Into<String>) -> Self {
        self.raw.docker_socket = Some(path.into());
        self
    }

    pub fn build(self) -> Result<SpawnerConfig> {
        SpawnerConfig::try_from(self.raw)
    }
}
