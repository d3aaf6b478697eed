use time::OffsetDateTime;

use crate::key::{KeyId, KeyState};

pub type KeyStoreError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Durable row shape the pool mirrors its in-memory state to. Defined here
/// (rather than depended on from `gateway-storage`) so this crate never has
/// to know about `sea_orm` — `gateway-storage` implements `KeyStore` instead.
#[derive(Debug, Clone)]
pub struct PersistedKey {
    pub id: KeyId,
    pub identifier: String,
    pub secret: String,
    pub brief: String,
    pub state: KeyState,
    pub failure_count: u32,
    pub cooldown_entry_count: u32,
    pub current_cooldown_secs: u64,
    pub cooldown_until: Option<OffsetDateTime>,
    pub in_use_since: Option<OffsetDateTime>,
}

/// A credential not yet assigned a primary key; the store hands back the
/// assigned `KeyId` so the pool never has to guess at autoincrement values.
#[derive(Debug, Clone)]
pub struct NewPersistedKey {
    pub identifier: String,
    pub secret: String,
    pub brief: String,
}

#[async_trait::async_trait]
pub trait KeyStore: Send + Sync {
    async fn load_all_keys(&self) -> Result<Vec<PersistedKey>, KeyStoreError>;
    async fn insert_key(&self, key: NewPersistedKey) -> Result<PersistedKey, KeyStoreError>;
    async fn upsert_key(&self, key: &PersistedKey) -> Result<(), KeyStoreError>;
    async fn delete_key(&self, id: KeyId) -> Result<(), KeyStoreError>;
}
