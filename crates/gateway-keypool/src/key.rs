use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

pub type KeyId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Active,
    Leased,
    Cooling,
}

/// In-memory authoritative view of one upstream credential. `secret` is kept
/// out of `Debug`/`Serialize` — only `identifier` and `brief` ever leave the
/// pool.
#[derive(Clone)]
pub struct KeyEntry {
    pub id: KeyId,
    pub identifier: String,
    pub secret: Arc<str>,
    pub brief: String,
    pub state: KeyState,
    pub failure_count: u32,
    pub cooldown_entry_count: u32,
    pub current_cooldown_secs: u64,
    pub cooldown_until: Option<OffsetDateTime>,
    pub in_use_since: Option<OffsetDateTime>,
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("id", &self.id)
            .field("identifier", &self.identifier)
            .field("brief", &self.brief)
            .field("state", &self.state)
            .field("failure_count", &self.failure_count)
            .field("cooldown_entry_count", &self.cooldown_entry_count)
            .field("current_cooldown_secs", &self.current_cooldown_secs)
            .field("cooldown_until", &self.cooldown_until)
            .field("in_use_since", &self.in_use_since)
            .finish()
    }
}

impl KeyEntry {
    pub fn reset_fields(&mut self) {
        self.state = KeyState::Active;
        self.failure_count = 0;
        self.cooldown_entry_count = 0;
        self.current_cooldown_secs = 0;
        self.cooldown_until = None;
        self.in_use_since = None;
    }
}

/// A freshly admin-supplied credential, before the pool assigns it a
/// persisted row.
pub struct NewUpstreamKey {
    pub secret: String,
}

/// Stable, opaque label derived from the secret (first 12 hex digits of its
/// blake3 digest). `identifier` is a lookup/display convenience backed by the
/// `KeyId` primary key, never a security boundary — collisions just mean two
/// keys share a display prefix.
pub fn derive_identifier(secret: &str) -> String {
    blake3::hash(secret.as_bytes()).to_hex()[..12].to_string()
}

pub fn derive_brief(secret: &str) -> String {
    let visible = 4usize.min(secret.len());
    let prefix: String = secret.chars().take(visible).collect();
    format!("{prefix}…({} chars)", secret.chars().count())
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyStatusEntry {
    pub identifier: String,
    pub brief: String,
    pub state: &'static str,
    pub cooldown_seconds_remaining: u64,
    pub failure_count: u32,
    pub cooldown_entry_count: u32,
    pub current_cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub keys: Vec<KeyStatusEntry>,
    pub active_count: usize,
    pub leased_count: usize,
    pub cooling_count: usize,
}
