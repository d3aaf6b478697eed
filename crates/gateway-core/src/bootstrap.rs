use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;
use gateway_common::{GlobalConfig, GlobalConfigPatch};
use gateway_keypool::{ConcurrencyGate, KeyPool, PoolConfig};
use gateway_storage::SeaOrmStore;

use crate::auth::{AdminAuth, PrincipalAuthenticator};
use crate::orchestrator::AppState;
use crate::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};

const ADMIN_JWT_TTL_SECS: i64 = 3600;

#[derive(Debug, Clone, Parser)]
#[command(name = "gateway", version, about = "Authenticated LLM API gateway")]
pub struct CliArgs {
    #[arg(long, env = "GATEWAY_DSN")]
    pub dsn: Option<String>,
    #[arg(long, env = "GATEWAY_HOST")]
    pub host: Option<String>,
    #[arg(long, env = "GATEWAY_PORT")]
    pub port: Option<u16>,
    /// Administrative password (plaintext). Stored as a blake3 hash; only
    /// ever printed once, at bootstrap, if none was configured.
    #[arg(long, env = "GATEWAY_PASSWORD")]
    pub password: Option<String>,
    #[arg(long, env = "GATEWAY_UPSTREAM_BASE_URL")]
    pub upstream_base_url: Option<String>,
    #[arg(long, env = "GATEWAY_UPSTREAM_PROXY_URL")]
    pub upstream_proxy_url: Option<String>,
    #[arg(long, env = "GATEWAY_MAX_CONCURRENT_UPSTREAM")]
    pub max_concurrent_upstream: Option<u32>,
    #[arg(long, env = "GATEWAY_ACQUIRE_TIMEOUT_SECS")]
    pub acquire_timeout_secs: Option<u64>,
    #[arg(long, env = "GATEWAY_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,
    #[arg(long, env = "GATEWAY_STREAM_IDLE_TIMEOUT_SECS")]
    pub stream_idle_timeout_secs: Option<u64>,
    #[arg(long, env = "GATEWAY_BASE_COOLDOWN_SECS")]
    pub base_cooldown_secs: Option<u64>,
    #[arg(long, env = "GATEWAY_MAX_COOLDOWN_SECS")]
    pub max_cooldown_secs: Option<u64>,
    #[arg(long, env = "GATEWAY_FAILURE_THRESHOLD")]
    pub failure_threshold: Option<u32>,
    #[arg(long, env = "GATEWAY_RATE_LIMIT_DEFAULT_WAIT_SECS")]
    pub rate_limit_default_wait_secs: Option<u64>,
    #[arg(long, env = "GATEWAY_STUCK_TIMEOUT_SECS")]
    pub stuck_timeout_secs: Option<u64>,
    #[arg(long, env = "GATEWAY_SWEEP_INTERVAL_SECS")]
    pub sweep_interval_secs: Option<u64>,
    #[arg(long, env = "GATEWAY_CLIENT_REBUILD_THRESHOLD")]
    pub client_rebuild_threshold: Option<u32>,
}

pub struct Bootstrap {
    pub store: Arc<SeaOrmStore>,
    pub state: Arc<AppState>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    bootstrap(CliArgs::parse()).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let dsn = sanitize_optional(args.dsn.clone()).unwrap_or_else(default_dsn);
    ensure_sqlite_parent_dir(&dsn)?;

    let store = Arc::new(SeaOrmStore::connect(&dsn).await.context("connect store")?);
    store.sync().await.context("schema sync")?;

    let db_config = store.load_global_config().await.context("load db global_config")?;
    let mut merged = db_config
        .map(|value| serde_json::from_value::<GlobalConfig>(value).context("decode stored global_config"))
        .transpose()?
        .map(GlobalConfigPatch::from)
        .unwrap_or_default();

    let admin_key_hash = if let Some(password) = sanitize_optional(args.password.clone()) {
        Some(hash_admin_key(&password))
    } else if merged.admin_key_hash.is_none() {
        let generated = generate_admin_password();
        eprintln!("generated admin password: {generated}");
        Some(hash_admin_key(&generated))
    } else {
        None
    };

    let cli_patch = GlobalConfigPatch {
        host: sanitize_optional(args.host.clone()),
        port: args.port,
        admin_key_hash,
        dsn: Some(dsn.clone()),
        upstream_base_url: sanitize_optional(args.upstream_base_url.clone()),
        upstream_proxy_url: sanitize_optional(args.upstream_proxy_url.clone()),
        max_concurrent_upstream: args.max_concurrent_upstream,
        acquire_timeout_secs: args.acquire_timeout_secs,
        request_timeout_secs: args.request_timeout_secs,
        stream_idle_timeout_secs: args.stream_idle_timeout_secs,
        base_cooldown_secs: args.base_cooldown_secs,
        max_cooldown_secs: args.max_cooldown_secs,
        failure_threshold: args.failure_threshold,
        rate_limit_default_wait_secs: args.rate_limit_default_wait_secs,
        stuck_timeout_secs: args.stuck_timeout_secs,
        sweep_interval_secs: args.sweep_interval_secs,
        client_rebuild_threshold: args.client_rebuild_threshold,
    };
    merged.overlay(cli_patch);
    let global: GlobalConfig = merged.into_config().context("finalize merged global config")?;

    let global_json = serde_json::to_value(&global).context("encode global_config")?;
    store.upsert_global_config(&global_json).await.context("upsert global_config")?;

    let pool_config = PoolConfig {
        base_cooldown_secs: global.base_cooldown_secs,
        max_cooldown_secs: global.max_cooldown_secs,
        failure_threshold: global.failure_threshold,
        rate_limit_default_wait_secs: global.rate_limit_default_wait_secs,
        stuck_timeout_secs: global.stuck_timeout_secs,
        sweep_interval_secs: global.sweep_interval_secs,
    };
    let pool = KeyPool::bootstrap(pool_config, Arc::clone(&store) as Arc<dyn gateway_keypool::KeyStore>)
        .await
        .context("bootstrap key pool")?;

    let gate = ConcurrencyGate::new(global.max_concurrent_upstream as usize);
    let upstream = WreqUpstreamClient::new(UpstreamClientConfig::from_global(&global)).context("build upstream client")?;
    let principal_auth = PrincipalAuthenticator::new(Arc::clone(&store) as Arc<dyn gateway_storage::Store>);
    let admin_auth = AdminAuth::new(global.admin_key_hash.clone(), global.admin_key_hash.clone().into_bytes(), ADMIN_JWT_TTL_SECS);

    let state = Arc::new(AppState {
        global: ArcSwap::from_pointee(global),
        pool,
        gate,
        store: Arc::clone(&store) as Arc<dyn gateway_storage::Store>,
        upstream,
        principal_auth,
        admin_auth,
    });

    Ok(Bootstrap { store, state })
}

fn sanitize_optional(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn default_dsn() -> String {
    if let Some(data_dir) = sanitize_optional(std::env::var("GATEWAY_DATA_DIR").ok()) {
        let dir = data_dir.trim_end_matches('/');
        return format!("sqlite://{dir}/gateway.db?mode=rwc");
    }
    "sqlite://gateway.db?mode=rwc".to_string()
}

fn ensure_sqlite_parent_dir(dsn: &str) -> anyhow::Result<()> {
    let Some(db_path) = sqlite_file_path_from_dsn(dsn) else {
        return Ok(());
    };
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).with_context(|| format!("create sqlite parent dir {}", parent.display()))
}

fn sqlite_file_path_from_dsn(dsn: &str) -> Option<PathBuf> {
    let rest = dsn.strip_prefix("sqlite:")?;
    let path_part = rest.split(['?', '#']).next()?.trim();
    if path_part.is_empty() {
        return None;
    }
    let mut normalized = path_part;
    if let Some(stripped) = normalized.strip_prefix("//") {
        normalized = stripped;
    }
    if normalized.to_ascii_lowercase() == ":memory:" {
        return None;
    }
    Some(PathBuf::from(normalized))
}

fn hash_admin_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

fn generate_admin_password() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::sqlite_file_path_from_dsn;

    #[test]
    fn sqlite_dsn_resolves_relative_path() {
        let path = sqlite_file_path_from_dsn("sqlite://gateway.db?mode=rwc").unwrap();
        assert_eq!(path.to_string_lossy(), "gateway.db");
    }

    #[test]
    fn sqlite_memory_dsn_is_ignored() {
        assert!(sqlite_file_path_from_dsn("sqlite::memory:").is_none());
        assert!(sqlite_file_path_from_dsn("sqlite://:memory:").is_none());
    }
}
