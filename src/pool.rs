//! Warm unit cache for reuse mode
//!
//! When reuse is enabled a unit outlives its session: it is parked under the
//! client's source address and handed to that client's next session, until
//! it sits idle for longer than the idle timeout. A parked unit belongs to
//! the pool; a claimed unit belongs to the claiming session. Nothing is ever
//! held by both.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::lifecycle::UnitManager;
use crate::unit::ExecutionUnit;

struct Parked {
    unit: ExecutionUnit,
    generation: u64,
    expiry: AbortHandle,
}

/// Pool status information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub parked: usize,
    pub idle_timeout: Duration,
}

pub struct WarmPool {
    manager: Arc<UnitManager>,
    idle_timeout: Duration,
    parked: Arc<Mutex<HashMap<String, Parked>>>,
    generation: AtomicU64,
}

impl WarmPool {
    pub fn new(manager: Arc<UnitManager>, idle_timeout: Duration) -> Self {
        Self {
            manager,
            idle_timeout,
            parked: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            parked: self.parked.lock().len(),
            idle_timeout: self.idle_timeout,
        }
    }

    /// Take the idle unit parked for `key`, if any
    pub fn claim(&self, key: &str) -> Option<ExecutionUnit> {
        let parked = self.parked.lock().remove(key)?;
        parked.expiry.abort();
        tracing::info!(
            key,
            unit = %parked.unit.short_id(),
            served = parked.unit.sessions(),
            "warm unit claimed"
        );
        Some(parked.unit)
    }

    /// Park a unit under `key` and arm its idle timer. If another unit is
    /// already parked for the key the incoming one is decommissioned instead.
    pub async fn park(&self, key: &str, unit: ExecutionUnit) {
        if !unit.is_live() {
            return;
        }

        let rejected = {
            let mut parked = self.parked.lock();
            if parked.contains_key(key) {
                Some(unit)
            } else {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let expiry = self.spawn_expiry(key.to_string(), generation);
                tracing::debug!(key, unit = %unit.short_id(), idle_ms = self.idle_timeout.as_millis() as u64, "unit parked");
                parked.insert(
                    key.to_string(),
                    Parked {
                        unit,
                        generation,
                        expiry,
                    },
                );
                None
            }
        };

        if let Some(mut extra) = rejected {
            tracing::debug!(key, unit = %extra.short_id(), "key already has a warm unit, dropping extra");
            if let Err(e) = self.manager.decommission(&mut extra).await {
                tracing::warn!(error = %e, "decommission failed");
            }
        }
    }

    fn spawn_expiry(&self, key: String, generation: u64) -> AbortHandle {
        let parked = self.parked.clone();
        let manager = self.manager.clone();
        let idle = self.idle_timeout;

        let task = tokio::spawn(async move {
            tokio::time::sleep(idle).await;

            let expired = {
                let mut parked = parked.lock();
                match parked.get(&key) {
                    Some(entry) if entry.generation == generation => parked.remove(&key),
                    _ => None,
                }
            };

            if let Some(mut entry) = expired {
                tracing::info!(key = %key, unit = %entry.unit.short_id(), "warm unit idle, decommissioning");
                if let Err(e) = manager.decommission(&mut entry.unit).await {
                    tracing::warn!(error = %e, "decommission failed");
                }
            }
        });
        task.abort_handle()
    }

    /// Decommission every parked unit
    pub async fn drain(&self) {
        let entries: Vec<(String, Parked)> = self.parked.lock().drain().collect();
        for (key, mut entry) in entries {
            entry.expiry.abort();
            tracing::debug!(key = %key, unit = %entry.unit.short_id(), "draining warm unit");
            if let Err(e) = self.manager.decommission(&mut entry.unit).await {
                tracing::warn!(error = %e, "decommission failed");
            }
        }
    }
}
