use gateway_keypool::{KeyState, KeyStore as _, NewPersistedKey};
use gateway_storage::{
    HeatmapMetric, LogFilter, NewAuthPrincipal, RequestLog, SeaOrmStore, Store as _, TrendUnit,
};
use time::{Duration, OffsetDateTime, UtcOffset};

async fn fresh_store() -> SeaOrmStore {
    let db = sea_orm::Database::connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    let store = SeaOrmStore::from_connection(db);
    store.sync().await.expect("sync schema");
    store
}

fn log_at(request_id: &str, request_time: OffsetDateTime, model: &str, success: bool) -> RequestLog {
    RequestLog {
        request_id: request_id.to_string(),
        request_time,
        principal_alias: Some("alice".to_string()),
        key_identifier: Some("abc123".to_string()),
        key_brief: Some("sk-a…(40 chars)".to_string()),
        model_name: Some(model.to_string()),
        prompt_tokens: Some(10),
        completion_tokens: Some(20),
        total_tokens: Some(30),
        is_success: success,
        error_kind: None,
        dialect: "openai".to_string(),
        streamed: false,
    }
}

#[tokio::test]
async fn sync_is_idempotent_and_stamps_schema_version() {
    let store = fresh_store().await;
    store.sync().await.expect("second sync is a no-op");
}

#[tokio::test]
async fn principal_roundtrip_by_api_key() {
    let store = fresh_store().await;
    let created = store
        .upsert_principal(NewAuthPrincipal {
            api_key: "sk-live-abc".to_string(),
            alias: "alice".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(created.alias, "alice");
    assert!(created.active);

    let found = store
        .find_principal_by_api_key("sk-live-abc")
        .await
        .unwrap()
        .expect("principal exists");
    assert_eq!(found.id, created.id);

    store.set_principal_active(found.id, false).await.unwrap();
    let updated = store.list_principals().await.unwrap();
    assert_eq!(updated.len(), 1);
    assert!(!updated[0].active);

    store.delete_principal("sk-live-abc").await.unwrap();
    assert!(store.list_principals().await.unwrap().is_empty());
}

#[tokio::test]
async fn request_log_filters_narrow_by_principal_and_success() {
    let store = fresh_store().await;
    let now = OffsetDateTime::now_utc();
    store.insert_request_log(log_at("req-1", now, "gpt-4o", true)).await.unwrap();
    store.insert_request_log(log_at("req-2", now, "gpt-4o", false)).await.unwrap();

    let all = store.query_request_logs(LogFilter { limit: 10, ..Default::default() }).await.unwrap();
    assert_eq!(all.total_count, 2);

    let only_success = store
        .query_request_logs(LogFilter { is_success: Some(true), limit: 10, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(only_success.total_count, 1);
    assert_eq!(only_success.rows[0].request_id, "req-1");
}

#[tokio::test]
async fn per_principal_call_counts_only_count_successes() {
    let store = fresh_store().await;
    let now = OffsetDateTime::now_utc();
    store.insert_request_log(log_at("a", now, "gpt-4o", true)).await.unwrap();
    store.insert_request_log(log_at("b", now, "gpt-4o", true)).await.unwrap();
    store.insert_request_log(log_at("c", now, "gpt-4o", false)).await.unwrap();

    let counts = store.per_principal_call_counts().await.unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].principal_alias, "alice");
    assert_eq!(counts[0].count, 2);
}

#[tokio::test]
async fn daily_usage_heatmap_buckets_requests_per_day() {
    let store = fresh_store().await;
    let offset = UtcOffset::UTC;
    let today = OffsetDateTime::now_utc().date();
    let yesterday = today.saturating_sub(Duration::days(1));
    let (today_start, _) = gateway_common::day_bounds_utc(today, offset);
    let (yesterday_start, _) = gateway_common::day_bounds_utc(yesterday, offset);

    store.insert_request_log(log_at("t1", today_start, "gpt-4o", true)).await.unwrap();
    store.insert_request_log(log_at("t2", today_start + Duration::hours(1), "gpt-4o", true)).await.unwrap();
    store.insert_request_log(log_at("y1", yesterday_start, "gpt-4o", true)).await.unwrap();

    let points = store
        .daily_usage_heatmap(yesterday_start, today_start + Duration::days(1), HeatmapMetric::Requests, offset)
        .await
        .unwrap();

    assert_eq!(points.len(), 2);
    assert_eq!(points[0].day, yesterday);
    assert_eq!(points[0].value, 1);
    assert_eq!(points[1].day, today);
    assert_eq!(points[1].value, 2);
}

/// Seven days of one request per day for a single model: the day-unit trend
/// should report one label per day, oldest first, each with count 1.
#[tokio::test]
async fn usage_trend_by_day_covers_a_full_week() {
    let store = fresh_store().await;
    let offset = UtcOffset::UTC;
    let today = OffsetDateTime::now_utc().date();

    for back in 0..7 {
        let day = today.saturating_sub(Duration::days(back));
        let (start, _) = gateway_common::day_bounds_utc(day, offset);
        store
            .insert_request_log(log_at(&format!("req-{back}"), start, "gpt-4o", true))
            .await
            .unwrap();
    }

    let trend = store.usage_trend(TrendUnit::Day, 0, 7, offset).await.unwrap();
    assert_eq!(trend.labels.len(), 7);
    assert_eq!(trend.series.len(), 1);
    assert_eq!(trend.series[0].label, "gpt-4o");
    assert_eq!(trend.series[0].data, vec![1, 1, 1, 1, 1, 1, 1]);
}

#[tokio::test]
async fn success_rate_reflects_mixed_outcomes_per_model() {
    let store = fresh_store().await;
    let offset = UtcOffset::UTC;
    let today = OffsetDateTime::now_utc().date();
    let (start, _) = gateway_common::day_bounds_utc(today, offset);

    store.insert_request_log(log_at("s1", start, "gpt-4o", true)).await.unwrap();
    store.insert_request_log(log_at("s2", start, "gpt-4o", true)).await.unwrap();
    store.insert_request_log(log_at("s3", start, "gpt-4o", false)).await.unwrap();

    let points = store.success_rate(1, false, offset).await.unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].model_name, "gpt-4o");
    assert!((points[0].success_rate - (200.0 / 3.0)).abs() < 0.01);
}

#[tokio::test]
async fn key_store_roundtrip_through_sea_orm() {
    let store = fresh_store().await;
    let inserted = store
        .insert_key(NewPersistedKey {
            identifier: "abc123".to_string(),
            secret: "sk-upstream-secret".to_string(),
            brief: "sk-u…(19 chars)".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(inserted.state, KeyState::Active);

    let mut mutated = inserted.clone();
    mutated.state = KeyState::Cooling;
    mutated.failure_count = 3;
    mutated.cooldown_entry_count = 1;
    mutated.current_cooldown_secs = 30;
    mutated.cooldown_until = Some(OffsetDateTime::now_utc() + Duration::seconds(30));
    store.upsert_key(&mutated).await.unwrap();

    let all = store.load_all_keys().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].state, KeyState::Cooling);
    assert_eq!(all[0].failure_count, 3);

    store.delete_key(inserted.id).await.unwrap();
    assert!(store.load_all_keys().await.unwrap().is_empty());
}
