//! Bidirectional byte relay between a client and a unit
//!
//! Bytes are forwarded unmodified in both directions until the first of:
//! the client side ends, the unit side ends, or the session timeout fires.
//! Whatever is still buffered at that point is dropped; this is best-effort
//! forwarding, not a delivery guarantee on top of TCP.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Why a relay ended. None of these is an error; every variant means the
/// session is over and teardown should follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client closed or errored first
    ClientClosed,
    /// Unit closed or errored first
    TargetClosed,
    /// Session timeout elapsed
    TimedOut,
    /// Could not connect to the unit at all
    TargetUnreachable,
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::ClientClosed => write!(f, "client closed"),
            SessionEnd::TargetClosed => write!(f, "unit closed"),
            SessionEnd::TimedOut => write!(f, "timed out"),
            SessionEnd::TargetUnreachable => write!(f, "unit unreachable"),
        }
    }
}

/// Connect to `target` and relay bytes with `client` until the session ends.
/// Both streams are closed when this returns.
pub async fn relay<S>(client: S, target: SocketAddr, timeout: Option<Duration>) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session = bridge(client, target);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, session)
            .await
            .unwrap_or(SessionEnd::TimedOut),
        None => session.await,
    }
}

async fn bridge<S>(client: S, target: SocketAddr) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let upstream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(%target, error = %e, "unit connect failed");
            return SessionEnd::TargetUnreachable;
        }
    };
    if let Err(e) = upstream.set_nodelay(true) {
        tracing::trace!(error = %e, "set_nodelay failed");
    }

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut unit_read, mut unit_write) = upstream.into_split();

    tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut unit_write) => {
            match result {
                Ok(bytes) => tracing::debug!(bytes, "client -> unit ended"),
                Err(e) => tracing::debug!(error = %e, "client -> unit errored"),
            }
            SessionEnd::ClientClosed
        }
        result = tokio::io::copy(&mut unit_read, &mut client_write) => {
            match result {
                Ok(bytes) => tracing::debug!(bytes, "unit -> client ended"),
                Err(e) => tracing::debug!(error = %e, "unit -> client errored"),
            }
            SessionEnd::TargetClosed
        }
    }
}
