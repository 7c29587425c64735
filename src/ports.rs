//! Bounded pool of internal ports shared by all hosted apps
//!
//! Allocation and release are the one point of global synchronization on
//! the start path, so the pool sits behind a single cheap mutex. Allocation
//! always hands out the lowest free port, which keeps test scenarios
//! deterministic.

use crate::error::HostError;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Allocator over a contiguous port range `[min, max]`
pub struct PortAllocator {
    inner: Mutex<Pool>,
}

struct Pool {
    free: BTreeSet<u16>,
    by_app: HashMap<String, u16>,
}

impl PortAllocator {
    /// Create an allocator for the inclusive range `[min, max]`
    pub fn new(min: u16, max: u16) -> anyhow::Result<Arc<Self>> {
        if min > max {
            anyhow::bail!("invalid port range {}-{}", min, max);
        }
        Ok(Arc::new(Self {
            inner: Mutex::new(Pool {
                free: (min..=max).collect(),
                by_app: HashMap::new(),
            }),
        }))
    }

    /// Allocate the lowest free port for `app_id`.
    ///
    /// Returns a lease that releases the port on drop unless committed.
    /// Allocating for an app that already holds a port returns a lease over
    /// the existing binding.
    pub fn allocate(self: &Arc<Self>, app_id: &str) -> Result<PortLease, HostError> {
        let mut pool = self.inner.lock();
        if let Some(&port) = pool.by_app.get(app_id) {
            return Ok(PortLease::new(Arc::clone(self), app_id, port));
        }
        let port = *pool.free.iter().next().ok_or(HostError::AllocationExhausted)?;
        pool.free.remove(&port);
        pool.by_app.insert(app_id.to_string(), port);
        debug!(app_id, port, "Allocated internal port");
        Ok(PortLease::new(Arc::clone(self), app_id, port))
    }

    /// Release the port held by `app_id`. Idempotent: releasing an app that
    /// holds nothing is a no-op.
    pub fn release(&self, app_id: &str) -> Option<u16> {
        let mut pool = self.inner.lock();
        let port = pool.by_app.remove(app_id)?;
        pool.free.insert(port);
        debug!(app_id, port, "Released internal port");
        Some(port)
    }

    /// Whether `port` is currently bound to some app
    pub fn is_allocated(&self, port: u16) -> bool {
        let pool = self.inner.lock();
        pool.by_app.values().any(|&p| p == port)
    }

    /// Rebind a persisted allocation during recovery.
    ///
    /// Fails if the port is outside the configured range or already bound
    /// to a different app.
    pub fn restore(&self, app_id: &str, port: u16) -> Result<(), HostError> {
        let mut pool = self.inner.lock();
        if let Some(&held) = pool.by_app.get(app_id) {
            if held == port {
                return Ok(());
            }
            return Err(HostError::Persist(format!(
                "app {} already holds port {}",
                app_id, held
            )));
        }
        if !pool.free.remove(&port) {
            return Err(HostError::Persist(format!(
                "port {} is outside the pool or already claimed",
                port
            )));
        }
        pool.by_app.insert(app_id.to_string(), port);
        debug!(app_id, port, "Restored internal port binding");
        Ok(())
    }
}

/// Scoped port acquisition: the port goes back to the pool when the lease
/// is dropped, unless the owning operation commits it into app state.
pub struct PortLease {
    allocator: Arc<PortAllocator>,
    app_id: String,
    port: u16,
    armed: bool,
}

impl PortLease {
    fn new(allocator: Arc<PortAllocator>, app_id: &str, port: u16) -> Self {
        Self {
            allocator,
            app_id: app_id.to_string(),
            port,
            armed: true,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Keep the allocation: the binding now belongs to the app record and
    /// is released later via `PortAllocator::release`.
    pub fn commit(mut self) -> u16 {
        self.armed = false;
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if self.armed {
            self.allocator.release(&self.app_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_lowest_free_port() {
        let allocator = PortAllocator::new(9000, 9005).unwrap();
        let a = allocator.allocate("a").unwrap();
        let b = allocator.allocate("b").unwrap();
        assert_eq!(a.port(), 9000);
        assert_eq!(b.port(), 9001);
        a.commit();
        b.commit();
        assert!(allocator.is_allocated(9000));
        assert!(allocator.is_allocated(9001));
        assert!(!allocator.is_allocated(9002));
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        // Pool of two: A and B succeed, C fails, stopping A frees 9000 for C
        let allocator = PortAllocator::new(9000, 9001).unwrap();
        assert_eq!(allocator.allocate("a").unwrap().commit(), 9000);
        assert_eq!(allocator.allocate("b").unwrap().commit(), 9001);
        assert!(matches!(
            allocator.allocate("c"),
            Err(HostError::AllocationExhausted)
        ));

        assert_eq!(allocator.release("a"), Some(9000));
        assert_eq!(allocator.allocate("c").unwrap().commit(), 9000);
    }

    #[test]
    fn test_release_is_idempotent() {
        let allocator = PortAllocator::new(9000, 9001).unwrap();
        assert_eq!(allocator.release("ghost"), None);
        allocator.allocate("a").unwrap().commit();
        assert_eq!(allocator.release("a"), Some(9000));
        assert_eq!(allocator.release("a"), None);
    }

    #[test]
    fn test_dropped_lease_releases_port() {
        let allocator = PortAllocator::new(9000, 9000).unwrap();
        {
            let lease = allocator.allocate("a").unwrap();
            assert_eq!(lease.port(), 9000);
            // dropped uncommitted
        }
        assert!(!allocator.is_allocated(9000));
        assert_eq!(allocator.allocate("b").unwrap().commit(), 9000);
    }

    #[test]
    fn test_allocate_twice_returns_existing_binding() {
        let allocator = PortAllocator::new(9000, 9001).unwrap();
        allocator.allocate("a").unwrap().commit();
        let again = allocator.allocate("a").unwrap();
        assert_eq!(again.port(), 9000);
        again.commit();
        // B still gets the next port
        assert_eq!(allocator.allocate("b").unwrap().commit(), 9001);
    }

    #[test]
    fn test_restore() {
        let allocator = PortAllocator::new(9000, 9002).unwrap();
        allocator.restore("a", 9001).unwrap();
        assert!(allocator.is_allocated(9001));
        // Double claim by another app fails
        assert!(allocator.restore("b", 9001).is_err());
        // Out-of-range fails
        assert!(allocator.restore("c", 9500).is_err());
        // Fresh allocations skip the restored port
        assert_eq!(allocator.allocate("d").unwrap().commit(), 9000);
        assert_eq!(allocator.allocate("e").unwrap().commit(), 9002);
    }

    #[test]
    fn test_invalid_range_rejected() {
        assert!(PortAllocator::new(9001, 9000).is_err());
    }
}
