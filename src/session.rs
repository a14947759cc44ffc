//! Per-connection session flow
//!
//! Every accepted connection runs this state machine in its own task:
//!
//! ```text
//! Accepted -> RateLimited -> Provisioning -> Proxying -> Decommissioning -> Closed
//!     \______________\______________________________________________________/
//!          client gone before provisioning: no unit is ever created
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{self, Interest};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::Instrument;

use crate::lifecycle::{UnitGuard, UnitManager};
use crate::pool::WarmPool;
use crate::proxy::{self, SessionEnd};
use crate::rate_limit::RateLimiter;

/// Session phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Accepted,
    RateLimited,
    Provisioning,
    Proxying,
    Decommissioning,
    Closed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Accepted => write!(f, "Accepted"),
            Phase::RateLimited => write!(f, "RateLimited"),
            Phase::Provisioning => write!(f, "Provisioning"),
            Phase::Proxying => write!(f, "Proxying"),
            Phase::Decommissioning => write!(f, "Decommissioning"),
            Phase::Closed => write!(f, "Closed"),
        }
    }
}

/// How a session finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// No peer address could be read; dropped untouched
    Dropped,
    /// Client left before a unit was provisioned
    ClientGone,
    /// Unit could not be provisioned; the client connection is dropped
    ProvisionFailed,
    /// Proxy ran and the unit was torn down or parked
    Completed(SessionEnd),
}

/// Collaborators shared by every session of one listener
pub struct SessionContext {
    pub limiter: Arc<RateLimiter>,
    pub manager: Arc<UnitManager>,
    /// Present only in reuse mode
    pub pool: Option<Arc<WarmPool>>,
    pub session_timeout: Option<Duration>,
}

pub struct Session {
    id: uuid::Uuid,
    ctx: Arc<SessionContext>,
    phase: Phase,
}

impl Session {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            ctx,
            phase: Phase::Accepted,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Drive one connection from accept to close
    pub async fn run(mut self, client: TcpStream) -> SessionOutcome {
        let peer = match client.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "connection has no peer address, dropping");
                self.enter(Phase::Closed);
                return SessionOutcome::Dropped;
            }
        };

        let span = tracing::info_span!("session", id = %self.id, addr = %peer);
        async move {
            let outcome = self.drive(client, peer).await;
            self.enter(Phase::Closed);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self, client: TcpStream, peer: SocketAddr) -> SessionOutcome {
        tracing::info!("new connection");
        let key = peer.ip().to_string();

        self.enter(Phase::RateLimited);
        let delay = self.ctx.limiter.admit(&key);
        if !delay.is_zero() {
            tracing::info!(delay_ms = delay.as_millis() as u64, "rate limited, holding connection");
        }
        if !wait_admitted(&client, delay).await {
            tracing::warn!("client disconnected before provisioning");
            return SessionOutcome::ClientGone;
        }

        self.enter(Phase::Provisioning);
        let warm = self.ctx.pool.as_ref().and_then(|pool| pool.claim(&key));
        let unit = match warm {
            Some(unit) => unit,
            None => match self.ctx.manager.provision().await {
                Ok(unit) => unit,
                Err(e) => {
                    tracing::warn!(error = %e, "session failed");
                    return SessionOutcome::ProvisionFailed;
                }
            },
        };
        let mut guard = UnitGuard::new(unit, self.ctx.manager.clone());

        self.enter(Phase::Proxying);
        let target = guard.unit().target_addr();
        guard.unit_mut().begin_session();
        let end = proxy::relay(client, target, self.ctx.session_timeout).await;
        guard.unit_mut().end_session();
        tracing::info!(unit = %guard.unit().short_id(), cause = %end, "session ending");

        self.enter(Phase::Decommissioning);
        match &self.ctx.pool {
            // a unit we could not reach is not worth keeping warm
            Some(pool) if end != SessionEnd::TargetUnreachable => {
                pool.park(&key, guard.into_inner()).await;
            }
            _ => {
                if let Err(e) = guard.release().await {
                    tracing::warn!(error = %e, "teardown failed");
                }
            }
        }

        SessionOutcome::Completed(end)
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(from = %self.phase, to = %phase, "session phase");
        self.phase = phase;
    }
}

/// Hold the connection for the rate-limit delay, then report whether the
/// client is still there. A close during the wait is noticed immediately,
/// including one queued behind bytes the client sent early.
async fn wait_admitted(client: &TcpStream, delay: Duration) -> bool {
    if !delay.is_zero() {
        let deadline = tokio::time::sleep_until(Instant::now() + delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                ready = client.ready(Interest::READABLE) => match ready {
                    Ok(ready) if ready.is_read_closed() => return false,
                    Ok(_) => {
                        // early bytes stay queued for the unit; clear readiness so
                        // only a new event (more data or the peer's FIN) wakes us
                        let _ = client.try_io(Interest::READABLE, || {
                            Err::<(), _>(io::ErrorKind::WouldBlock.into())
                        });
                    }
                    Err(_) => return false,
                },
            }
        }
    }
    is_connected(client)
}

/// Non-blocking liveness probe. Read-closed is reported even when unread
/// data sits in front of the FIN.
fn is_connected(client: &TcpStream) -> bool {
    match client.ready(Interest::READABLE).now_or_never() {
        Some(Ok(ready)) => !ready.is_read_closed(),
        Some(Err(_)) => false,
        None => true,
    }
}
