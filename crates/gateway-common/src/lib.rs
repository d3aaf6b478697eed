use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > DB, then persisted back to DB (mirrors the way the
/// proxy core resolves its own config layers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a hash (blake3), never plaintext.
    pub admin_key_hash: String,
    pub dsn: String,
    pub upstream_base_url: String,
    pub upstream_proxy_url: Option<String>,

    pub max_concurrent_upstream: u32,
    pub acquire_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,

    pub base_cooldown_secs: u64,
    pub max_cooldown_secs: u64,
    pub failure_threshold: u32,
    pub rate_limit_default_wait_secs: u64,

    pub stuck_timeout_secs: u64,
    pub sweep_interval_secs: u64,

    pub client_rebuild_threshold: u32,
}

impl GlobalConfig {
    pub const DEFAULT_MAX_CONCURRENT_UPSTREAM: u32 = 64;
    pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;
    pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
    pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_BASE_COOLDOWN_SECS: u64 = 10;
    pub const DEFAULT_MAX_COOLDOWN_SECS: u64 = 3600;
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
    pub const DEFAULT_RATE_LIMIT_DEFAULT_WAIT_SECS: u64 = 30;
    pub const DEFAULT_STUCK_TIMEOUT_SECS: u64 = 300;
    pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
    pub const DEFAULT_CLIENT_REBUILD_THRESHOLD: u32 = 5;
}

/// Optional layer used for merging global config across CLI/ENV/DB sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key_hash: Option<String>,
    pub dsn: Option<String>,
    pub upstream_base_url: Option<String>,
    pub upstream_proxy_url: Option<String>,
    pub max_concurrent_upstream: Option<u32>,
    pub acquire_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub stream_idle_timeout_secs: Option<u64>,
    pub base_cooldown_secs: Option<u64>,
    pub max_cooldown_secs: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub rate_limit_default_wait_secs: Option<u64>,
    pub stuck_timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub client_rebuild_threshold: Option<u32>,
}

macro_rules! overlay_field {
    ($self:ident, $other:ident, $field:ident) => {
        if $other.$field.is_some() {
            $self.$field = $other.$field;
        }
    };
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        overlay_field!(self, other, host);
        overlay_field!(self, other, port);
        overlay_field!(self, other, admin_key_hash);
        overlay_field!(self, other, dsn);
        overlay_field!(self, other, upstream_base_url);
        overlay_field!(self, other, upstream_proxy_url);
        overlay_field!(self, other, max_concurrent_upstream);
        overlay_field!(self, other, acquire_timeout_secs);
        overlay_field!(self, other, request_timeout_secs);
        overlay_field!(self, other, stream_idle_timeout_secs);
        overlay_field!(self, other, base_cooldown_secs);
        overlay_field!(self, other, max_cooldown_secs);
        overlay_field!(self, other, failure_threshold);
        overlay_field!(self, other, rate_limit_default_wait_secs);
        overlay_field!(self, other, stuck_timeout_secs);
        overlay_field!(self, other, sweep_interval_secs);
        overlay_field!(self, other, client_rebuild_threshold);
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8080),
            admin_key_hash: self
                .admin_key_hash
                .ok_or(GlobalConfigError::MissingField("admin_key_hash"))?,
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            upstream_base_url: self
                .upstream_base_url
                .ok_or(GlobalConfigError::MissingField("upstream_base_url"))?,
            upstream_proxy_url: self.upstream_proxy_url,
            max_concurrent_upstream: self
                .max_concurrent_upstream
                .unwrap_or(GlobalConfig::DEFAULT_MAX_CONCURRENT_UPSTREAM),
            acquire_timeout_secs: self
                .acquire_timeout_secs
                .unwrap_or(GlobalConfig::DEFAULT_ACQUIRE_TIMEOUT_SECS),
            request_timeout_secs: self
                .request_timeout_secs
                .unwrap_or(GlobalConfig::DEFAULT_REQUEST_TIMEOUT_SECS),
            stream_idle_timeout_secs: self
                .stream_idle_timeout_secs
                .unwrap_or(GlobalConfig::DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
            base_cooldown_secs: self
                .base_cooldown_secs
                .unwrap_or(GlobalConfig::DEFAULT_BASE_COOLDOWN_SECS),
            max_cooldown_secs: self
                .max_cooldown_secs
                .unwrap_or(GlobalConfig::DEFAULT_MAX_COOLDOWN_SECS),
            failure_threshold: self
                .failure_threshold
                .unwrap_or(GlobalConfig::DEFAULT_FAILURE_THRESHOLD),
            rate_limit_default_wait_secs: self
                .rate_limit_default_wait_secs
                .unwrap_or(GlobalConfig::DEFAULT_RATE_LIMIT_DEFAULT_WAIT_SECS),
            stuck_timeout_secs: self
                .stuck_timeout_secs
                .unwrap_or(GlobalConfig::DEFAULT_STUCK_TIMEOUT_SECS),
            sweep_interval_secs: self
                .sweep_interval_secs
                .unwrap_or(GlobalConfig::DEFAULT_SWEEP_INTERVAL_SECS),
            client_rebuild_threshold: self
                .client_rebuild_threshold
                .unwrap_or(GlobalConfig::DEFAULT_CLIENT_REBUILD_THRESHOLD),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
            dsn: Some(value.dsn),
            upstream_base_url: Some(value.upstream_base_url),
            upstream_proxy_url: value.upstream_proxy_url,
            max_concurrent_upstream: Some(value.max_concurrent_upstream),
            acquire_timeout_secs: Some(value.acquire_timeout_secs),
            request_timeout_secs: Some(value.request_timeout_secs),
            stream_idle_timeout_secs: Some(value.stream_idle_timeout_secs),
            base_cooldown_secs: Some(value.base_cooldown_secs),
            max_cooldown_secs: Some(value.max_cooldown_secs),
            failure_threshold: Some(value.failure_threshold),
            rate_limit_default_wait_secs: Some(value.rate_limit_default_wait_secs),
            stuck_timeout_secs: Some(value.stuck_timeout_secs),
            sweep_interval_secs: Some(value.sweep_interval_secs),
            client_rebuild_threshold: Some(value.client_rebuild_threshold),
        }
    }
}

/// Day/week/month bucket boundaries in a caller-supplied UTC offset, used by the
/// usage-trend and heatmap aggregations. Kept here (rather than pulling in a full
/// IANA timezone database) since the storage crate needs the same arithmetic for
/// both the heatmap and the trend query.
pub fn day_bounds_utc(
    day: time::Date,
    utc_offset: time::UtcOffset,
) -> (time::OffsetDateTime, time::OffsetDateTime) {
    let start_local = day.with_hms(0, 0, 0).expect("midnight is valid");
    let start = time::OffsetDateTime::new_in_offset(day, start_local.time(), utc_offset)
        .to_offset(time::UtcOffset::UTC);
    let end = start + time::Duration::days(1);
    (start, end)
}
