//! A single ephemeral execution unit

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Lifecycle of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Created,
    Started,
    Proxying,
    Stopping,
    Removed,
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitState::Created => write!(f, "Created"),
            UnitState::Started => write!(f, "Started"),
            UnitState::Proxying => write!(f, "Proxying"),
            UnitState::Stopping => write!(f, "Stopping"),
            UnitState::Removed => write!(f, "Removed"),
        }
    }
}

/// A runtime unit bound to one host port. Owned by exactly one session (or
/// the warm pool while parked) and never shared.
#[derive(Debug)]
pub struct ExecutionUnit {
    id: String,
    host_ip: IpAddr,
    host_port: u16,
    state: UnitState,
    created_at: Instant,
    sessions: u32,
}

impl ExecutionUnit {
    pub fn new(id: impl Into<String>, host_ip: IpAddr, host_port: u16) -> Self {
        Self {
            id: id.into(),
            host_ip,
            host_port,
            state: UnitState::Created,
            created_at: Instant::now(),
            sessions: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Shortened id for log lines
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// Where the proxy connects to reach the unit's service
    pub fn target_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host_ip, self.host_port)
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Sessions this unit has served; above one only in reuse mode
    pub(crate) fn sessions(&self) -> u32 {
        self.sessions
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            UnitState::Created | UnitState::Started | UnitState::Proxying
        )
    }

    pub(crate) fn set_state(&mut self, state: UnitState) {
        tracing::trace!(unit = %self.short_id(), from = %self.state, to = %state, "unit state");
        self.state = state;
    }

    pub(crate) fn begin_session(&mut self) {
        self.sessions += 1;
        self.set_state(UnitState::Proxying);
    }

    pub(crate) fn end_session(&mut self) {
        if self.state == UnitState::Proxying {
            self.set_state(UnitState::Started);
        }
    }
}

/// First 12 characters of a runtime id, the way `docker ps` shows it
pub(crate) fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
