//! Operation Lock
//!
//! One lock per cluster serializes every mutating operation, so a quorum
//! check and the change it guards are never interleaved with another
//! mutation.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Cluster-wide mutual exclusion for mutations and maintenance
#[derive(Clone, Default)]
pub struct OperationLock {
    inner: Arc<Mutex<()>>,
}

impl OperationLock {
    /// Create a new, unlocked operation lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.inner).lock_owned().await
    }

    /// Wait for the lock, giving up at `deadline`
    pub async fn acquire_until(&self, deadline: Instant, operation: &str) -> Result<OwnedMutexGuard<()>> {
        tokio::time::timeout_at(deadline, self.acquire())
            .await
            .map_err(|_| Error::Timeout(format!("waiting for operation lock ({})", operation)))
    }

    /// Whether some operation currently holds the lock
    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
