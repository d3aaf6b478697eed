use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};

/// Bounds in-flight upstream calls independently of how many keys are in
/// the pool. A permit is acquired after a key lease, released when the
/// upstream response (or its stream) completes.
#[derive(Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
}

#[derive(Debug, thiserror::Error)]
#[error("concurrency gate saturated within the acquire timeout")]
pub struct GateTimeout;

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub async fn acquire(&self, timeout: Duration) -> Result<GatePermit<'_>, GateTimeout> {
        match tokio::time::timeout(timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => Ok(GatePermit { _permit: permit }),
            _ => Err(GateTimeout),
        }
    }

    /// Same admission check as `acquire`, but the permit is `'static` and can
    /// be moved into a spawned task — needed to hold the gate open for the
    /// lifetime of a streaming forward rather than just the initial dispatch.
    pub async fn acquire_owned(&self, timeout: Duration) -> Result<OwnedGatePermit, GateTimeout> {
        match tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(OwnedGatePermit { _permit: permit }),
            _ => Err(GateTimeout),
        }
    }
}

pub struct GatePermit<'a> {
    _permit: SemaphorePermit<'a>,
}

pub struct OwnedGatePermit {
    _permit: OwnedSemaphorePermit,
}
