//! In-memory, persistence-backed pool of upstream credentials: round-robin
//! selection, exponential-backoff cooldown on failure, a bounded wait queue,
//! and a background sweep that reclaims abandoned leases. Paired with
//! `ConcurrencyGate`, which bounds total in-flight upstream calls
//! independently of how many keys exist.

mod error;
mod gate;
mod key;
mod lease;
mod pool;
mod store;

pub use error::{AcquireError, KeyPoolError};
pub use gate::{ConcurrencyGate, GatePermit, GateTimeout, OwnedGatePermit};
pub use key::{
    KeyEntry, KeyId, KeyState, KeyStatusEntry, NewUpstreamKey, PoolStatus, derive_brief,
    derive_identifier,
};
pub use lease::{FailureClass, Lease, ReturnOutcome};
pub use pool::{KeyPool, PoolConfig};
pub use store::{KeyStore, KeyStoreError, NewPersistedKey, PersistedKey};
