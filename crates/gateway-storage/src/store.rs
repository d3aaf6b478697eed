use time::{OffsetDateTime, UtcOffset};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("schema version mismatch: found {found:?}, expected {expected}")]
    SchemaVersionMismatch { found: Option<i32>, expected: i32 },
}

#[derive(Debug, Clone)]
pub struct AuthPrincipal {
    pub id: i64,
    pub api_key: String,
    pub alias: String,
    pub active: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewAuthPrincipal {
    pub api_key: String,
    pub alias: String,
}

/// One terminal record per proxied request. Insert-only — there is
/// deliberately no update method on `Store`.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub request_id: String,
    pub request_time: OffsetDateTime,
    pub principal_alias: Option<String>,
    pub key_identifier: Option<String>,
    pub key_brief: Option<String>,
    pub model_name: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub is_success: bool,
    pub error_kind: Option<String>,
    pub dialect: String,
    pub streamed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    pub principal_alias: Option<String>,
    pub key_identifier: Option<String>,
    pub model_name: Option<String>,
    pub is_success: Option<bool>,
    pub limit: u64,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct LogQueryResult {
    pub rows: Vec<RequestLog>,
    pub total_count: u64,
    pub min_time: Option<OffsetDateTime>,
    pub max_time: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct PrincipalCallCount {
    pub principal_alias: String,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeatmapMetric {
    Requests,
    Tokens,
}

#[derive(Debug, Clone)]
pub struct HeatmapPoint {
    pub day: time::Date,
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendUnit {
    Day,
    Week,
    Month,
}

#[derive(Debug, Clone)]
pub struct TrendSeries {
    pub label: String,
    pub data: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct UsageTrend {
    pub labels: Vec<String>,
    pub series: Vec<TrendSeries>,
}

#[derive(Debug, Clone)]
pub struct SuccessRatePoint {
    pub day: time::Date,
    pub model_name: String,
    pub hour: Option<u8>,
    pub success_rate: f64,
}

/// Durable persistence for `KeyPool` state (mirrored, not owned — see
/// `gateway_keypool::KeyStore`), auth principals, and the request log.
///
/// Runtime reads on the hot path (KeyPool state) never hit this trait; it is
/// consulted at bootstrap, on admin mutation, and for the aggregation
/// queries in `§4.7`.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn sync(&self) -> StoreResult<()>;

    async fn load_global_config(&self) -> StoreResult<Option<serde_json::Value>>;
    async fn upsert_global_config(&self, config: &serde_json::Value) -> StoreResult<()>;

    async fn list_principals(&self) -> StoreResult<Vec<AuthPrincipal>>;
    async fn upsert_principal(&self, new: NewAuthPrincipal) -> StoreResult<AuthPrincipal>;
    async fn set_principal_active(&self, id: i64, active: bool) -> StoreResult<()>;
    async fn delete_principal(&self, api_key: &str) -> StoreResult<()>;
    async fn find_principal_by_api_key(&self, api_key: &str) -> StoreResult<Option<AuthPrincipal>>;

    async fn insert_request_log(&self, log: RequestLog) -> StoreResult<()>;
    async fn query_request_logs(&self, filter: LogFilter) -> StoreResult<LogQueryResult>;

    async fn per_principal_call_counts(&self) -> StoreResult<Vec<PrincipalCallCount>>;
    async fn daily_usage_heatmap(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
        metric: HeatmapMetric,
        utc_offset: UtcOffset,
    ) -> StoreResult<Vec<HeatmapPoint>>;
    async fn usage_trend(
        &self,
        unit: TrendUnit,
        offset: i64,
        num_periods: u32,
        utc_offset: UtcOffset,
    ) -> StoreResult<UsageTrend>;
    async fn success_rate(
        &self,
        days: u32,
        hourly: bool,
        utc_offset: UtcOffset,
    ) -> StoreResult<Vec<SuccessRatePoint>>;
}
