use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use crate::errors::DispatcherError;

/// Bounded pool of loopback ports for agent instances.
///
/// Invariant: at any instant a port is either free or assigned to exactly one
/// instance. Allocation is lowest-free-first so tests (and operators reading
/// logs) see deterministic assignments.
#[derive(Clone)]
pub struct PortPool {
    inner: Arc<Mutex<Pool>>,
}

struct Pool {
    free: BTreeSet<u16>,
    in_use: HashSet<u16>,
}

impl PortPool {
    /// Pool over the inclusive range `lo..=hi`.
    pub fn new(
        lo: u16,
        hi: u16,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Pool {
                free: (lo..=hi).collect(),
                in_use: HashSet::new(),
            })),
        }
    }

    pub fn acquire(&self) -> Result<u16, DispatcherError> {
        let mut pool = self.inner.lock().unwrap();
        match pool.free.pop_first() {
            Some(port) => {
                pool.in_use.insert(port);
                Ok(port)
            }
            None => Err(DispatcherError::PoolExhausted),
        }
    }

    /// Idempotent; releasing a port the pool never handed out is a no-op.
    pub fn release(
        &self,
        port: u16,
    ) {
        let mut pool = self.inner.lock().unwrap();
        if pool.in_use.remove(&port) {
            pool.free.insert(port);
        } else {
            tracing::warn!(port, "released a port that was not allocated");
        }
    }

    pub fn available(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }
}
