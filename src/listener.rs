//! TCP listener that hands every accepted connection to its own session

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::SpawnerConfig;
use crate::lifecycle::UnitManager;
use crate::pool::WarmPool;
use crate::rate_limit::RateLimiter;
use crate::runtime::ContainerRuntime;
use crate::session::{Session, SessionContext, SessionOutcome};
use crate::{Error, Result};

/// Back-off after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Spawns one unit per inbound connection
pub struct Spawner {
    config: Arc<SpawnerConfig>,
    ctx: Arc<SessionContext>,
}

impl Spawner {
    /// Validates the configuration; a bad one is a fatal `Error::Config`
    pub fn new(config: SpawnerConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        config.validate()?;

        let manager = Arc::new(UnitManager::new(runtime, &config));
        let pool = config
            .reuse
            .then(|| Arc::new(WarmPool::new(manager.clone(), config.idle_timeout())));

        let ctx = Arc::new(SessionContext {
            limiter: Arc::new(RateLimiter::new(config.rate_limit_interval())),
            manager,
            pool,
            session_timeout: config.session_timeout(),
        });

        Ok(Self {
            config: Arc::new(config),
            ctx,
        })
    }

    pub fn config(&self) -> &SpawnerConfig {
        &self.config
    }

    /// Units currently provisioned (in session or parked)
    pub fn active_units(&self) -> usize {
        self.ctx.manager.active_units()
    }

    /// Bind the listening socket and start accepting. Returns once bound;
    /// the handle carries the bound address.
    pub async fn start(&self) -> Result<SpawnerHandle> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        tracing::info!(
            addr = %local_addr,
            image = %self.config.image,
            container_port = %self.config.container_port,
            reuse = self.config.reuse,
            "listening"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, self.ctx.clone(), shutdown_rx));

        Ok(SpawnerHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
            pool: self.ctx.pool.clone(),
            manager: self.ctx.manager.clone(),
        })
    }
}

/// A running listener
pub struct SpawnerHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<JoinSet<SessionOutcome>>,
    pool: Option<Arc<WarmPool>>,
    manager: Arc<UnitManager>,
}

impl SpawnerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listening socket and wait until it is fully closed. Sessions
    /// already in flight are left to finish on their own; parked warm units
    /// are decommissioned.
    pub async fn stop(self) -> Result<()> {
        let mut sessions = close(self.shutdown, self.task).await?;
        sessions.detach_all();

        if let Some(pool) = &self.pool {
            pool.drain().await;
        }

        tracing::info!(addr = %self.local_addr, "shutdown complete");
        Ok(())
    }

    /// Close the listener, give in-flight sessions up to `grace` to finish,
    /// then abort the rest and decommission every unit still live. Once this
    /// returns the runtime can be dropped without leaking units.
    pub async fn shutdown(self, grace: Duration) -> Result<()> {
        let mut sessions = close(self.shutdown, self.task).await?;

        if !sessions.is_empty() {
            tracing::info!(
                in_flight = sessions.len(),
                grace_ms = grace.as_millis() as u64,
                "waiting for sessions to drain"
            );
            let drained = tokio::time::timeout(grace, async {
                while sessions.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                tracing::warn!(remaining = sessions.len(), "grace period over, aborting sessions");
                sessions.shutdown().await;
            }
        }

        if let Some(pool) = &self.pool {
            pool.drain().await;
        }

        let swept = self.manager.decommission_all().await;
        if swept > 0 {
            tracing::warn!(swept, "decommissioned units left by aborted sessions");
        }

        tracing::info!(addr = %self.local_addr, "shutdown complete");
        Ok(())
    }
}

/// Signal the accept loop and wait for it to hand back its sessions
async fn close(
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<JoinSet<SessionOutcome>>,
) -> Result<JoinSet<SessionOutcome>> {
    // the loop may already be gone if it panicked; joining reports that
    let _ = shutdown.send(());
    task.await.map_err(|e| Error::Io(std::io::Error::other(e)))
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    mut shutdown: oneshot::Receiver<()>,
) -> JoinSet<SessionOutcome> {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "session task failed");
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let session = Session::new(ctx.clone());
                    sessions.spawn(async move {
                        let outcome = session.run(stream).await;
                        tracing::debug!(?outcome, "session closed");
                        outcome
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    tracing::info!(in_flight = sessions.len(), "listener closing");
    drop(listener);
    sessions
}
