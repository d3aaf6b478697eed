use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use gateway_core::AppState;
use gateway_storage::{HeatmapMetric, LogFilter, NewAuthPrincipal, TrendUnit};
use serde::Deserialize;
use time::{OffsetDateTime, UtcOffset, format_description::well_known::Rfc3339};
use futures_util::StreamExt as _;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
    pub log_feed: broadcast::Sender<String>,
}

/// Everything under `/api` gated by an admin bearer JWT, except `/auth/login`
/// itself. No provider/user-key CRUD, no self-update, no websocket event
/// feed — this gateway proxies exactly two upstream dialects, not a
/// multi-provider aggregator.
pub fn admin_router(app: Arc<AppState>, log_feed: broadcast::Sender<String>) -> Router {
    let state = AdminState { app, log_feed };

    Router::new()
        .route("/auth/login", post(login))
        .route("/auth_keys", get(list_auth_keys).post(create_auth_key))
        .route("/auth_keys/{id}", put(set_auth_key_active).delete(delete_auth_key))
        .route("/keys/status", get(keys_status))
        .route("/keys", post(add_keys))
        .route("/keys/reset", post(reset_all_keys))
        .route("/keys/{identifier}", delete(delete_key))
        .route("/keys/{identifier}/reset", post(reset_key))
        .route("/request_logs", get(request_logs))
        .route("/stats/per_principal_call_counts", get(stats_per_principal_call_counts))
        .route("/stats/daily_usage_heatmap", get(stats_daily_usage_heatmap))
        .route("/stats/usage_trend", get(stats_usage_trend))
        .route("/stats/success_rate", get(stats_success_rate))
        .route("/logs/sse", get(logs_sse))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<AdminState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path().ends_with("/auth/login") {
        return Ok(next.run(req).await);
    }
    state.app.admin_auth.authenticate_bearer(&headers).map_err(|_| StatusCode::UNAUTHORIZED)?;
    Ok(next.run(req).await)
}

fn err_json(status: StatusCode, error: &str, detail: impl std::fmt::Display) -> Response {
    (status, Json(serde_json::json!({ "error": error, "detail": detail.to_string() }))).into_response()
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    password: String,
}

async fn login(State(state): State<AdminState>, Json(body): Json<LoginBody>) -> Response {
    if !state.app.admin_auth.verify_admin_key(&body.password) {
        return err_json(StatusCode::UNAUTHORIZED, "invalid_password", "");
    }
    let now = OffsetDateTime::now_utc().unix_timestamp();
    match state.app.admin_auth.issue_jwt("admin", now) {
        Ok(token) => Json(serde_json::json!({ "token": token })).into_response(),
        Err(err) => err_json(StatusCode::INTERNAL_SERVER_ERROR, "jwt_issuance_failed", err),
    }
}

async fn list_auth_keys(State(state): State<AdminState>) -> Response {
    match state.app.store.list_principals().await {
        Ok(rows) => {
            let rows: Vec<_> = rows
                .into_iter()
                .map(|p| {
                    serde_json::json!({
                        "id": p.id,
                        "alias": p.alias,
                        "active": p.active,
                        "created_at": p.created_at.format(&Rfc3339).unwrap_or_default(),
                    })
                })
                .collect();
            Json(serde_json::json!({ "principals": rows })).into_response()
        }
        Err(err) => err_json(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err),
    }
}

#[derive(Debug, Deserialize)]
struct CreateAuthKeyBody {
    api_key: Option<String>,
    alias: String,
}

async fn create_auth_key(State(state): State<AdminState>, Json(body): Json<CreateAuthKeyBody>) -> Response {
    let api_key = body.api_key.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    match state
        .app
        .store
        .upsert_principal(NewAuthPrincipal { api_key: api_key.clone(), alias: body.alias })
        .await
    {
        Ok(principal) => Json(serde_json::json!({ "id": principal.id, "api_key": api_key, "alias": principal.alias })).into_response(),
        Err(err) => err_json(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err),
    }
}

#[derive(Debug, Deserialize)]
struct SetActiveBody {
    active: bool,
}

async fn set_auth_key_active(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(body): Json<SetActiveBody>,
) -> Response {
    match state.app.store.set_principal_active(id, body.active).await {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(err) => err_json(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err),
    }
}

async fn delete_auth_key(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    let principals = match state.app.store.list_principals().await {
        Ok(rows) => rows,
        Err(err) => return err_json(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err),
    };
    let Some(principal) = principals.into_iter().find(|p| p.id == id) else {
        return err_json(StatusCode::NOT_FOUND, "principal_not_found", "");
    };
    match state.app.store.delete_principal(&principal.api_key).await {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(err) => err_json(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err),
    }
}

async fn keys_status(State(state): State<AdminState>) -> Response {
    Json(state.app.pool.status()).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AddKeysBody {
    Many { secrets: Vec<String> },
    One { secret: String },
}

async fn add_keys(State(state): State<AdminState>, Json(body): Json<AddKeysBody>) -> Response {
    let secrets = match body {
        AddKeysBody::Many { secrets } => secrets,
        AddKeysBody::One { secret } => vec![secret],
    };
    let mut inserted = Vec::with_capacity(secrets.len());
    for secret in secrets {
        match state.app.pool.insert_key(gateway_keypool::NewUpstreamKey { secret }).await {
            Ok(id) => inserted.push(id),
            Err(err) => return err_json(StatusCode::INTERNAL_SERVER_ERROR, "key_store_error", err),
        }
    }
    Json(serde_json::json!({ "inserted": inserted.len() })).into_response()
}

async fn delete_key(State(state): State<AdminState>, Path(identifier): Path<String>) -> Response {
    let Some(id) = state.app.pool.find_id_by_identifier(&identifier) else {
        return err_json(StatusCode::NOT_FOUND, "key_not_found", "");
    };
    match state.app.pool.delete_key(id).await {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(gateway_keypool::KeyPoolError::NotFound) => err_json(StatusCode::NOT_FOUND, "key_not_found", ""),
        Err(gateway_keypool::KeyPoolError::KeyBusy) => err_json(StatusCode::CONFLICT, "key_busy", ""),
    }
}

async fn reset_key(State(state): State<AdminState>, Path(identifier): Path<String>) -> Response {
    let Some(id) = state.app.pool.find_id_by_identifier(&identifier) else {
        return err_json(StatusCode::NOT_FOUND, "key_not_found", "");
    };
    match state.app.pool.reset_key(id).await {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(gateway_keypool::KeyPoolError::NotFound) => err_json(StatusCode::NOT_FOUND, "key_not_found", ""),
        Err(gateway_keypool::KeyPoolError::KeyBusy) => err_json(StatusCode::CONFLICT, "key_busy", ""),
    }
}

async fn reset_all_keys(State(state): State<AdminState>) -> Response {
    state.app.pool.reset_all().await;
    Json(serde_json::json!({ "ok": true })).into_response()
}

#[derive(Debug, Deserialize)]
struct RequestLogsQuery {
    from: Option<String>,
    to: Option<String>,
    principal_alias: Option<String>,
    key_identifier: Option<String>,
    model_name: Option<String>,
    is_success: Option<bool>,
    #[serde(default = "default_limit")]
    limit: u64,
    #[serde(default)]
    offset: u64,
}

fn default_limit() -> u64 {
    100
}

async fn request_logs(State(state): State<AdminState>, Query(query): Query<RequestLogsQuery>) -> Response {
    let from = match query.from.as_deref().map(|s| OffsetDateTime::parse(s, &Rfc3339)) {
        Some(Ok(v)) => Some(v),
        Some(Err(err)) => return err_json(StatusCode::BAD_REQUEST, "invalid_from", err),
        None => None,
    };
    let to = match query.to.as_deref().map(|s| OffsetDateTime::parse(s, &Rfc3339)) {
        Some(Ok(v)) => Some(v),
        Some(Err(err)) => return err_json(StatusCode::BAD_REQUEST, "invalid_to", err),
        None => None,
    };
    let filter = LogFilter {
        from,
        to,
        principal_alias: query.principal_alias,
        key_identifier: query.key_identifier,
        model_name: query.model_name,
        is_success: query.is_success,
        limit: query.limit.clamp(1, 500),
        offset: query.offset,
    };
    match state.app.store.query_request_logs(filter).await {
        Ok(result) => {
            let rows: Vec<_> = result
                .rows
                .into_iter()
                .map(|row| {
                    serde_json::json!({
                        "request_id": row.request_id,
                        "request_time": row.request_time.format(&Rfc3339).unwrap_or_default(),
                        "principal_alias": row.principal_alias,
                        "key_identifier": row.key_identifier,
                        "key_brief": row.key_brief,
                        "model_name": row.model_name,
                        "prompt_tokens": row.prompt_tokens,
                        "completion_tokens": row.completion_tokens,
                        "total_tokens": row.total_tokens,
                        "is_success": row.is_success,
                        "error_kind": row.error_kind,
                        "dialect": row.dialect,
                        "streamed": row.streamed,
                    })
                })
                .collect();
            Json(serde_json::json!({
                "rows": rows,
                "total_count": result.total_count,
                "min_time": result.min_time.and_then(|t| t.format(&Rfc3339).ok()),
                "max_time": result.max_time.and_then(|t| t.format(&Rfc3339).ok()),
            }))
            .into_response()
        }
        Err(err) => err_json(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err),
    }
}

async fn stats_per_principal_call_counts(State(state): State<AdminState>) -> Response {
    match state.app.store.per_principal_call_counts().await {
        Ok(rows) => {
            let rows: Vec<_> = rows
                .into_iter()
                .map(|r| serde_json::json!({ "principal_alias": r.principal_alias, "count": r.count }))
                .collect();
            Json(serde_json::json!({ "rows": rows })).into_response()
        }
        Err(err) => err_json(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err),
    }
}

#[derive(Debug, Deserialize)]
struct HeatmapQuery {
    from: String,
    to: String,
    #[serde(default)]
    metric: Option<String>,
    #[serde(default)]
    utc_offset_minutes: Option<i16>,
}

async fn stats_daily_usage_heatmap(State(state): State<AdminState>, Query(query): Query<HeatmapQuery>) -> Response {
    let from = match OffsetDateTime::parse(&query.from, &Rfc3339) {
        Ok(v) => v,
        Err(err) => return err_json(StatusCode::BAD_REQUEST, "invalid_from", err),
    };
    let to = match OffsetDateTime::parse(&query.to, &Rfc3339) {
        Ok(v) => v,
        Err(err) => return err_json(StatusCode::BAD_REQUEST, "invalid_to", err),
    };
    let metric = match query.metric.as_deref() {
        None | Some("requests") => HeatmapMetric::Requests,
        Some("tokens") => HeatmapMetric::Tokens,
        Some(other) => return err_json(StatusCode::BAD_REQUEST, "invalid_metric", other),
    };
    let offset = utc_offset_from_minutes(query.utc_offset_minutes);
    match state.app.store.daily_usage_heatmap(from, to, metric, offset).await {
        Ok(points) => {
            let points: Vec<_> = points
                .into_iter()
                .map(|p| serde_json::json!({ "day": p.day.to_string(), "value": p.value }))
                .collect();
            Json(serde_json::json!({ "points": points })).into_response()
        }
        Err(err) => err_json(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err),
    }
}

#[derive(Debug, Deserialize)]
struct UsageTrendQuery {
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    offset: i64,
    #[serde(default = "default_num_periods")]
    num_periods: u32,
    #[serde(default)]
    utc_offset_minutes: Option<i16>,
}

fn default_num_periods() -> u32 {
    7
}

async fn stats_usage_trend(State(state): State<AdminState>, Query(query): Query<UsageTrendQuery>) -> Response {
    let unit = match query.unit.as_deref() {
        None | Some("day") => TrendUnit::Day,
        Some("week") => TrendUnit::Week,
        Some("month") => TrendUnit::Month,
        Some(other) => return err_json(StatusCode::BAD_REQUEST, "invalid_unit", other),
    };
    let utc_offset = utc_offset_from_minutes(query.utc_offset_minutes);
    match state.app.store.usage_trend(unit, query.offset, query.num_periods, utc_offset).await {
        Ok(trend) => {
            let series: Vec<_> = trend
                .series
                .into_iter()
                .map(|s| serde_json::json!({ "label": s.label, "data": s.data }))
                .collect();
            Json(serde_json::json!({ "labels": trend.labels, "series": series })).into_response()
        }
        Err(err) => err_json(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err),
    }
}

#[derive(Debug, Deserialize)]
struct SuccessRateQuery {
    #[serde(default = "default_success_rate_days")]
    days: u32,
    #[serde(default)]
    hourly: bool,
    #[serde(default)]
    utc_offset_minutes: Option<i16>,
}

fn default_success_rate_days() -> u32 {
    7
}

async fn stats_success_rate(State(state): State<AdminState>, Query(query): Query<SuccessRateQuery>) -> Response {
    let utc_offset = utc_offset_from_minutes(query.utc_offset_minutes);
    match state.app.store.success_rate(query.days, query.hourly, utc_offset).await {
        Ok(rows) => {
            let rows: Vec<_> = rows
                .into_iter()
                .map(|r| {
                    serde_json::json!({
                        "day": r.day.to_string(),
                        "model_name": r.model_name,
                        "hour": r.hour,
                        "success_rate": r.success_rate,
                    })
                })
                .collect();
            Json(serde_json::json!({ "rows": rows })).into_response()
        }
        Err(err) => err_json(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err),
    }
}

fn utc_offset_from_minutes(minutes: Option<i16>) -> UtcOffset {
    minutes
        .and_then(|m| UtcOffset::from_whole_seconds(m as i32 * 60).ok())
        .unwrap_or(UtcOffset::UTC)
}

/// Live tail of in-process application logs. Fed by
/// `gateway_router::LiveLogLayer` installed on the global tracing
/// subscriber.
async fn logs_sse(
    State(state): State<AdminState>,
) -> Sse<impl futures_util::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let stream = BroadcastStream::new(state.log_feed.subscribe()).filter_map(|item| match item {
        Ok(line) => Some(Ok(SseEvent::default().data(line))),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_offset_defaults_to_utc_when_absent() {
        assert_eq!(utc_offset_from_minutes(None), UtcOffset::UTC);
    }

    #[test]
    fn utc_offset_converts_minutes_to_whole_seconds() {
        let offset = utc_offset_from_minutes(Some(-300));
        assert_eq!(offset.whole_seconds(), -300 * 60);
    }

    #[test]
    fn utc_offset_falls_back_on_out_of_range_minutes() {
        let offset = utc_offset_from_minutes(Some(i16::MAX));
        assert_eq!(offset, UtcOffset::UTC);
    }
}
