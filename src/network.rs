//! Host port allocation for unit port mappings
//!
//! Ports are discovered by binding an ephemeral socket and reading back the
//! port the OS picked, so ports in use by other processes are never handed
//! out. Ports held by our own live units are additionally tracked, since the
//! probe socket is closed again before the runtime binds the port.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::{Error, Result};

/// Attempts before giving up on finding a port we do not already hold
const MAX_PROBES: usize = 16;

pub struct PortAllocator {
    host: IpAddr,
    reserved: Mutex<HashSet<u16>>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl PortAllocator {
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Address units are published on
    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// Find a free port and reserve it until [`release`](Self::release)
    pub async fn allocate(&self) -> Result<u16> {
        for _ in 0..MAX_PROBES {
            let port = probe(self.host).await?;
            if self.reserved.lock().insert(port) {
                return Ok(port);
            }
            tracing::debug!(port, "probed port already reserved, retrying");
        }
        Err(Error::Provision(format!(
            "no free host port after {} probes",
            MAX_PROBES
        )))
    }

    pub fn release(&self, port: u16) {
        self.reserved.lock().remove(&port);
    }

    #[cfg(test)]
    fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }

    /// Ports currently held by live units
    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }
}

async fn probe(host: IpAddr) -> Result<u16> {
    let listener = TcpListener::bind(SocketAddr::new(host, 0)).await?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_distinct_ports() {
        let allocator = PortAllocator::default();
        let a = allocator.allocate().await.unwrap();
        let b = allocator.allocate().await.unwrap();

        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert_eq!(allocator.reserved_count(), 2);
    }

    #[tokio::test]
    async fn test_release() {
        let allocator = PortAllocator::default();
        let port = allocator.allocate().await.unwrap();
        assert!(allocator.is_reserved(port));

        allocator.release(port);
        assert!(!allocator.is_reserved(port));
        assert_eq!(allocator.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_allocated_port_is_bindable() {
        let allocator = PortAllocator::default();
        let port = allocator.allocate().await.unwrap();
        let listener = TcpListener::bind(("127.0.0.1", port)).await;
        assert!(listener.is_ok());
    }
}
