use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::key::KeyId;
use crate::pool::PoolInner;

/// How an orchestrator classifies the outcome of a request made with a
/// leased key, fed back into `KeyPool::return_lease`.
#[derive(Debug, Clone, Copy)]
pub enum ReturnOutcome {
    Success,
    Failure(FailureClass),
}

#[derive(Debug, Clone, Copy)]
pub enum FailureClass {
    RateLimited { retry_after: Option<Duration> },
    Upstream5xx,
    AuthRejected,
    TransientClientOrNetwork,
}

/// A scoped handle on one `Active` key, issued by `KeyPool::acquire`.
///
/// The expected path is an explicit `pool.return_lease(lease, outcome).await`
/// once the upstream call resolves. If the lease is dropped without that
/// call — a bug in the caller, a panic unwinding through the orchestrator —
/// `Drop` performs a synchronous best-effort reclaim so the key does not get
/// stuck `Leased` forever; the stuck-lease sweep exists as a second-line
/// backstop for the same failure mode.
pub struct Lease {
    pub id: KeyId,
    pub identifier: String,
    pub brief: String,
    secret: Arc<str>,
    pool: Arc<PoolInner>,
    released: Arc<AtomicBool>,
}

impl Lease {
    pub(crate) fn new(id: KeyId, identifier: String, brief: String, secret: Arc<str>, pool: Arc<PoolInner>) -> Self {
        Self {
            id,
            identifier,
            brief,
            secret,
            pool,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub(crate) fn released_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.released)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!(
            key_id = self.id,
            identifier = %self.identifier,
            "lease dropped without return_lease; reclaiming as a transient failure"
        );
        self.pool.emergency_reclaim(self.id);
    }
}
