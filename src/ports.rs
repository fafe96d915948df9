//! TCP port leasing for instance backends.
//!
//! Ports are leased from a bounded range with a real bind probe on
//! `127.0.0.1`, so a port already taken by a foreign process is never
//! handed out. The cache is soft: `mark_used` reconciles it with
//! already-running containers at boot.

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::debug;

pub const DEFAULT_MIN_PORT: u16 = 10881;
pub const DEFAULT_MAX_PORT: u16 = 11881;

pub struct PortAllocator {
    leased: Mutex<HashSet<u16>>,
    min_port: u16,
    max_port: u16,
}

impl PortAllocator {
    /// Allocator over `[min_port, max_port]`. Out-of-order or zero bounds
    /// fall back to the default range.
    pub fn new(min_port: u16, max_port: u16) -> Self {
        let (min_port, max_port) = if min_port == 0 || max_port <= min_port {
            (DEFAULT_MIN_PORT, DEFAULT_MAX_PORT)
        } else {
            (min_port, max_port)
        };
        Self {
            leased: Mutex::new(HashSet::new()),
            min_port,
            max_port,
        }
    }

    /// Lease the lowest free port in range. A port counts as free when it is
    /// not cached as leased and a probe bind on `127.0.0.1` succeeds.
    pub fn lease(&self) -> Result<u16> {
        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        for port in self.min_port..=self.max_port {
            if leased.contains(&port) {
                continue;
            }
            if Self::is_bindable(port) {
                leased.insert(port);
                debug!(port, "Leased port");
                return Ok(port);
            }
        }
        Err(Error::ResourceExhausted(format!(
            "no available ports in range [{}, {}]",
            self.min_port, self.max_port
        )))
    }

    /// Lease a specific port if it is in range, unleased, and bindable.
    pub fn lease_specific(&self, port: u16) -> Result<()> {
        if port < self.min_port || port > self.max_port {
            return Err(Error::Invalid(format!(
                "port {} outside range [{}, {}]",
                port, self.min_port, self.max_port
            )));
        }
        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        if leased.contains(&port) {
            return Err(Error::Conflict(format!("port {} already leased", port)));
        }
        if !Self::is_bindable(port) {
            return Err(Error::Conflict(format!("port {} is in use", port)));
        }
        leased.insert(port);
        debug!(port, "Leased requested port");
        Ok(())
    }

    /// Return a port to the pool. Idempotent.
    pub fn release(&self, port: u16) {
        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        if leased.remove(&port) {
            debug!(port, "Released port");
        }
    }

    /// Mark a port as in use without probing. Used at boot to account for
    /// ports owned by containers that survived a daemon restart.
    pub fn mark_used(&self, port: u16) {
        if port == 0 {
            return;
        }
        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        leased.insert(port);
        debug!(port, "Marked port as used");
    }

    fn is_bindable(port: u16) -> bool {
        std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_PORT, DEFAULT_MAX_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_sequential_and_distinct() {
        let pa = PortAllocator::new(21881, 21890);
        let a = pa.lease().unwrap();
        let b = pa.lease().unwrap();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_release_allows_reuse() {
        let pa = PortAllocator::new(21891, 21895);
        let a = pa.lease().unwrap();
        pa.release(a);
        let b = pa.lease().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mark_used_skips_port() {
        let pa = PortAllocator::new(21896, 21899);
        pa.mark_used(21896);
        let a = pa.lease().unwrap();
        assert_ne!(a, 21896);
    }

    #[test]
    fn test_skips_bound_port() {
        let pa = PortAllocator::new(21900, 21905);
        let _listener = std::net::TcpListener::bind(("127.0.0.1", 21900)).unwrap();
        let a = pa.lease().unwrap();
        assert_ne!(a, 21900);
    }

    #[test]
    fn test_exhaustion() {
        let pa = PortAllocator::new(21906, 21907);
        pa.mark_used(21906);
        pa.mark_used(21907);
        assert!(matches!(
            pa.lease(),
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_lease_specific() {
        let pa = PortAllocator::new(21908, 21912);
        pa.lease_specific(21910).unwrap();
        assert!(matches!(
            pa.lease_specific(21910),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(pa.lease_specific(30000), Err(Error::Invalid(_))));
    }
}
