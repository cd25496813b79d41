use std::collections::BTreeSet;
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::sync::Mutex;

use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no available ports in range {start}-{end}")]
pub struct PortsExhausted {
    pub start: u16,
    pub end: u16,
}

/// Fixed range of ports handed out to deployed services.
///
/// A candidate is committed only after a successful bind, and the probe and
/// the commit happen under one lock, so concurrent deployments never receive
/// the same port.
#[derive(Debug)]
pub struct PortPool {
    range: RangeInclusive<u16>,
    allocated: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    fn allocated(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        self.allocated.lock().unwrap_or_else(|e| {
            warn!("port pool lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Claim the lowest free port in the range.
    pub fn allocate(&self) -> Result<u16, PortsExhausted> {
        let mut allocated = self.allocated();
        for port in self.range.clone() {
            if allocated.contains(&port) {
                continue;
            }
            // The listener is dropped right away; the port only has to be
            // bindable at the moment we commit it.
            match TcpListener::bind(("0.0.0.0", port)) {
                Ok(_) => {
                    allocated.insert(port);
                    debug!(port, "allocated port");
                    return Ok(port);
                }
                Err(e) => debug!(port, error = %e, "port busy, skipping"),
            }
        }
        Err(PortsExhausted {
            start: *self.range.start(),
            end: *self.range.end(),
        })
    }

    /// Return `port` to the pool. Releasing an unallocated port is a no-op.
    pub fn release(&self, port: u16) {
        if self.allocated().remove(&port) {
            debug!(port, "released port");
        }
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated().contains(&port)
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated().len()
    }

    pub fn capacity(&self) -> usize {
        self.range.clone().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release() {
        let pool = PortPool::new(47310..=47312);
        assert_eq!(pool.capacity(), 3);

        let port = pool.allocate().unwrap();
        assert!(pool.range.contains(&port));
        assert!(pool.is_allocated(port));

        pool.release(port);
        assert!(!pool.is_allocated(port));
        assert_eq!(pool.allocated_count(), 0);

        // Double release is harmless.
        pool.release(port);
    }

    #[test]
    fn exhaustion_reports_the_range() {
        let pool = PortPool::new(47320..=47321);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);

        let err = pool.allocate().unwrap_err();
        assert_eq!(err, PortsExhausted { start: 47320, end: 47321 });
        assert_eq!(err.to_string(), "no available ports in range 47320-47321");
    }

    #[test]
    fn externally_bound_port_is_skipped() {
        let held = TcpListener::bind(("0.0.0.0", 47330)).unwrap();
        let pool = PortPool::new(47330..=47331);
        assert_eq!(pool.allocate().unwrap(), 47331);
        assert!(pool.allocate().is_err());
        drop(held);
    }
}
