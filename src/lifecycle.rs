//! Unit lifecycle: provision on demand, decommission exactly once

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::SpawnerConfig;
use crate::network::PortAllocator;
use crate::runtime::{ContainerRuntime, UnitSpec};
use crate::unit::{self, ExecutionUnit, UnitState};
use crate::{Error, Result};

/// Creates, starts, stops and removes units through a [`ContainerRuntime`]
pub struct UnitManager {
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    /// Every unit the runtime has created and we have not yet removed, by id
    live: Mutex<HashMap<String, u16>>,
    image: String,
    container_port: String,
    pids_limit: i64,
    settle_delay: Duration,
}

impl UnitManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &SpawnerConfig) -> Self {
        Self {
            runtime,
            ports: PortAllocator::default(),
            live: Mutex::new(HashMap::new()),
            image: config.image.clone(),
            container_port: config.container_port.clone(),
            pids_limit: config.pids_limit,
            settle_delay: config.settle_delay(),
        }
    }

    /// Units provisioned and not yet decommissioned
    pub fn active_units(&self) -> usize {
        self.ports.reserved_count()
    }

    /// Allocate a host port, create and start a unit mapped to it, then wait
    /// out the settling delay. A unit that was created but failed to start is
    /// decommissioned before the error is returned.
    pub async fn provision(&self) -> Result<ExecutionUnit> {
        let host_port = self.ports.allocate().await.map_err(|e| match e {
            Error::Provision(_) => e,
            other => Error::Provision(format!("port allocation failed: {}", other)),
        })?;

        let spec = UnitSpec {
            image: self.image.clone(),
            host_ip: self.ports.host(),
            host_port,
            container_port: self.container_port.clone(),
            pids_limit: self.pids_limit,
        };

        let id = match self.runtime.create_unit(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.ports.release(host_port);
                return Err(Error::Provision(format!("create failed: {}", e)));
            }
        };

        self.live.lock().insert(id.clone(), host_port);
        let mut unit = ExecutionUnit::new(id, spec.host_ip, host_port);
        tracing::info!(unit = %unit.short_id(), host_port, image = %self.image, "unit created");

        if let Err(e) = self.runtime.start_unit(unit.id()).await {
            if let Err(cleanup) = self.decommission(&mut unit).await {
                tracing::warn!(unit = %unit.short_id(), error = %cleanup, "cleanup after failed start");
            }
            return Err(Error::Provision(format!(
                "start failed for unit {}: {}",
                unit.short_id(),
                e
            )));
        }
        unit.set_state(UnitState::Started);

        tokio::time::sleep(self.settle_delay).await;
        Ok(unit)
    }

    /// Stop then remove a unit. Calling this on a unit that is already
    /// stopping or removed is a no-op, and "already gone" answers from the
    /// runtime are not failures.
    pub async fn decommission(&self, unit: &mut ExecutionUnit) -> Result<()> {
        if !unit.is_live() {
            tracing::debug!(unit = %unit.short_id(), state = %unit.state(), "unit already decommissioned");
            return Ok(());
        }
        unit.set_state(UnitState::Stopping);

        let result = self.teardown(unit.id(), unit.host_port()).await;
        unit.set_state(UnitState::Removed);
        if result.is_ok() {
            tracing::debug!(unit = %unit.short_id(), age_ms = unit.age().as_millis() as u64, "unit removed");
        }
        result
    }

    /// Tear down every unit still known to be live, whoever owns it. Used at
    /// shutdown once sessions are gone; returns how many were swept.
    pub async fn decommission_all(&self) -> usize {
        let live: Vec<(String, u16)> = self
            .live
            .lock()
            .iter()
            .map(|(id, port)| (id.clone(), *port))
            .collect();

        for (id, host_port) in &live {
            tracing::info!(unit = %unit::short_id(id), host_port, "decommissioning orphaned unit");
            if let Err(e) = self.teardown(id, *host_port).await {
                tracing::warn!(error = %e, "decommission failed");
            }
        }
        live.len()
    }

    async fn teardown(&self, id: &str, host_port: u16) -> Result<()> {
        let stopped = self.runtime.stop_unit(id).await;
        let removed = self.runtime.remove_unit(id).await;

        self.live.lock().remove(id);
        self.ports.release(host_port);

        let mut failure = None;
        for result in [stopped, removed] {
            match result {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::debug!(unit = %unit::short_id(id), "unit already removed");
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(e) => Err(Error::Decommission {
                unit: unit::short_id(id).to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Owns a provisioned unit until it is explicitly released or handed off.
///
/// If the guard is dropped while still holding the unit (the session task
/// was aborted or panicked) a decommission is spawned onto the current
/// runtime.
pub struct UnitGuard {
    unit: Option<ExecutionUnit>,
    manager: Arc<UnitManager>,
}

impl UnitGuard {
    pub fn new(unit: ExecutionUnit, manager: Arc<UnitManager>) -> Self {
        Self {
            unit: Some(unit),
            manager,
        }
    }

    pub fn unit(&self) -> &ExecutionUnit {
        self.unit.as_ref().expect("guard holds its unit until consumed")
    }

    pub fn unit_mut(&mut self) -> &mut ExecutionUnit {
        self.unit.as_mut().expect("guard holds its unit until consumed")
    }

    /// Disarm the guard and take ownership of the unit
    pub fn into_inner(mut self) -> ExecutionUnit {
        self.unit.take().expect("guard holds its unit until consumed")
    }

    /// Decommission the unit now
    pub async fn release(mut self) -> Result<()> {
        match self.unit.take() {
            Some(mut unit) => self.manager.decommission(&mut unit).await,
            None => Ok(()),
        }
    }
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        let Some(mut unit) = self.unit.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(unit = %unit.short_id(), "unit guard dropped, decommissioning in background");
                let manager = self.manager.clone();
                handle.spawn(async move {
                    if let Err(e) = manager.decommission(&mut unit).await {
                        tracing::warn!(error = %e, "background decommission failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!(unit = %unit.short_id(), "unit guard dropped outside a runtime, unit leaked");
            }
        }
    }
}
