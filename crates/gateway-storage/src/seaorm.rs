use std::collections::BTreeMap;

use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, DatabaseBackend,
    DatabaseConnection, EntityTrait, FromQueryResult, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Schema,
};
use time::{Date, Duration as TimeDuration, Month, OffsetDateTime, UtcOffset};

use gateway_common::day_bounds_utc;
use gateway_keypool::{KeyState, KeyStore, KeyStoreError, NewPersistedKey, PersistedKey};

use crate::db::connect_shared;
use crate::entities;
use crate::entities::schema_meta::CURRENT_SCHEMA_VERSION;
use crate::store::{
    AuthPrincipal, HeatmapMetric, HeatmapPoint, LogFilter, LogQueryResult, NewAuthPrincipal,
    PrincipalCallCount, RequestLog, Store, StoreError, StoreResult, SuccessRatePoint, TrendSeries,
    TrendUnit, UsageTrend,
};

#[derive(Debug, FromQueryResult)]
struct ModelCountRow {
    model_name: Option<String>,
    matched: i64,
}

/// `sea_orm`-backed implementation of `Store`, over a single shared sqlite
/// connection. Also implements `gateway_keypool::KeyStore` so `KeyPool` can
/// mirror its state without this crate depending back on `gateway-keypool`'s
/// internals beyond the narrow port it defines.
#[derive(Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        let db = connect_shared(dsn).await.map_err(StoreError::Db)?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn check_schema_version(&self) -> StoreResult<()> {
        let row = entities::SchemaMeta::find().one(&self.db).await?;
        match row {
            Some(row) if row.version == CURRENT_SCHEMA_VERSION => Ok(()),
            Some(row) => Err(StoreError::SchemaVersionMismatch {
                found: Some(row.version),
                expected: CURRENT_SCHEMA_VERSION,
            }),
            None => {
                use entities::schema_meta::ActiveModel as SchemaActive;
                SchemaActive {
                    id: ActiveValue::Set(1),
                    version: ActiveValue::Set(CURRENT_SCHEMA_VERSION),
                }
                .insert(&self.db)
                .await?;
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl Store for SeaOrmStore {
    #[tracing::instrument(skip(self))]
    async fn sync(&self) -> StoreResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::GlobalConfig)
            .register(entities::Keys)
            .register(entities::Principals)
            .register(entities::RequestLogs)
            .register(entities::SchemaMeta)
            .sync(&self.db)
            .await?;
        self.check_schema_version().await
    }

    async fn load_global_config(&self) -> StoreResult<Option<serde_json::Value>> {
        use entities::global_config::Column;
        let row = entities::GlobalConfig::find()
            .order_by_asc(Column::Id)
            .one(&self.db)
            .await?;
        Ok(row.map(|m| m.config_json))
    }

    #[tracing::instrument(skip(self, config))]
    async fn upsert_global_config(&self, config: &serde_json::Value) -> StoreResult<()> {
        use entities::global_config::{ActiveModel, Column, Entity};
        let existing = Entity::find().order_by_asc(Column::Id).one(&self.db).await?;
        let now = OffsetDateTime::now_utc();
        match existing {
            Some(row) => {
                let mut active: ActiveModel = row.into();
                active.config_json = ActiveValue::Set(config.clone());
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                ActiveModel {
                    id: ActiveValue::Set(1),
                    config_json: ActiveValue::Set(config.clone()),
                    updated_at: ActiveValue::Set(now),
                }
                .insert(&self.db)
                .await?;
            }
        }
        Ok(())
    }

    async fn list_principals(&self) -> StoreResult<Vec<AuthPrincipal>> {
        let rows = entities::Principals::find().all(&self.db).await?;
        Ok(rows.into_iter().map(principal_from_model).collect())
    }

    #[tracing::instrument(skip(self, new))]
    async fn upsert_principal(&self, new: NewAuthPrincipal) -> StoreResult<AuthPrincipal> {
        use entities::principals::Column;
        let existing = entities::Principals::find()
            .filter(Column::ApiKey.eq(new.api_key.clone()))
            .one(&self.db)
            .await?;
        let model = match existing {
            Some(row) => {
                let mut active: entities::principals::ActiveModel = row.into();
                active.alias = ActiveValue::Set(new.alias);
                active.update(&self.db).await?
            }
            None => {
                entities::principals::ActiveModel {
                    id: ActiveValue::NotSet,
                    api_key: ActiveValue::Set(new.api_key),
                    alias: ActiveValue::Set(new.alias),
                    active: ActiveValue::Set(true),
                    created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
                }
                .insert(&self.db)
                .await?
            }
        };
        Ok(principal_from_model(model))
    }

    async fn set_principal_active(&self, id: i64, active: bool) -> StoreResult<()> {
        use entities::principals::Column;
        let row = entities::Principals::find()
            .filter(Column::Id.eq(id))
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::Db(sea_orm::DbErr::RecordNotFound("principal".into())))?;
        let mut active_model: entities::principals::ActiveModel = row.into();
        active_model.active = ActiveValue::Set(active);
        active_model.update(&self.db).await?;
        Ok(())
    }

    async fn delete_principal(&self, api_key: &str) -> StoreResult<()> {
        use entities::principals::Column;
        entities::Principals::delete_many()
            .filter(Column::ApiKey.eq(api_key))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn find_principal_by_api_key(&self, api_key: &str) -> StoreResult<Option<AuthPrincipal>> {
        use entities::principals::Column;
        let row = entities::Principals::find()
            .filter(Column::ApiKey.eq(api_key))
            .one(&self.db)
            .await?;
        Ok(row.map(principal_from_model))
    }

    #[tracing::instrument(skip(self, log))]
    async fn insert_request_log(&self, log: RequestLog) -> StoreResult<()> {
        entities::request_logs::ActiveModel {
            id: ActiveValue::NotSet,
            request_id: ActiveValue::Set(log.request_id),
            request_time: ActiveValue::Set(log.request_time),
            principal_alias: ActiveValue::Set(log.principal_alias),
            key_identifier: ActiveValue::Set(log.key_identifier),
            key_brief: ActiveValue::Set(log.key_brief),
            model_name: ActiveValue::Set(log.model_name),
            prompt_tokens: ActiveValue::Set(log.prompt_tokens),
            completion_tokens: ActiveValue::Set(log.completion_tokens),
            total_tokens: ActiveValue::Set(log.total_tokens),
            is_success: ActiveValue::Set(log.is_success),
            error_kind: ActiveValue::Set(log.error_kind),
            dialect: ActiveValue::Set(log.dialect),
            streamed: ActiveValue::Set(log.streamed),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    async fn query_request_logs(&self, filter: LogFilter) -> StoreResult<LogQueryResult> {
        use entities::request_logs::Column;

        let bounds = entities::RequestLogs::find()
            .select_only()
            .column_as(Column::RequestTime.min(), "min_time")
            .column_as(Column::RequestTime.max(), "max_time")
            .into_model::<TimeBoundsRow>()
            .one(&self.db)
            .await?;

        let mut query = entities::RequestLogs::find();
        if let Some(from) = filter.from {
            query = query.filter(Column::RequestTime.gte(from));
        }
        if let Some(to) = filter.to {
            query = query.filter(Column::RequestTime.lte(to));
        }
        if let Some(alias) = filter.principal_alias.as_deref() {
            query = query.filter(Column::PrincipalAlias.eq(alias));
        }
        if let Some(identifier) = filter.key_identifier.as_deref() {
            query = query.filter(Column::KeyIdentifier.eq(identifier));
        }
        if let Some(model) = filter.model_name.as_deref() {
            query = query.filter(Column::ModelName.eq(model));
        }
        if let Some(is_success) = filter.is_success {
            query = query.filter(Column::IsSuccess.eq(is_success));
        }

        let total_count = query.clone().count(&self.db).await?;
        let rows = query
            .order_by_desc(Column::RequestTime)
            .limit(filter.limit)
            .offset(filter.offset)
            .all(&self.db)
            .await?;

        Ok(LogQueryResult {
            rows: rows.into_iter().map(log_from_model).collect(),
            total_count,
            min_time: bounds.as_ref().and_then(|b| b.min_time),
            max_time: bounds.as_ref().and_then(|b| b.max_time),
        })
    }

    async fn per_principal_call_counts(&self) -> StoreResult<Vec<PrincipalCallCount>> {
        use entities::request_logs::Column;
        #[derive(Debug, FromQueryResult)]
        struct Row {
            principal_alias: Option<String>,
            matched: i64,
        }
        let rows: Vec<Row> = entities::RequestLogs::find()
            .select_only()
            .column(Column::PrincipalAlias)
            .column_as(Column::Id.count(), "matched")
            .filter(Column::IsSuccess.eq(true))
            .filter(Column::PrincipalAlias.is_not_null())
            .group_by(Column::PrincipalAlias)
            .into_model::<Row>()
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                r.principal_alias.map(|principal_alias| PrincipalCallCount {
                    principal_alias,
                    count: r.matched,
                })
            })
            .collect())
    }

    async fn daily_usage_heatmap(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
        metric: HeatmapMetric,
        utc_offset: UtcOffset,
    ) -> StoreResult<Vec<HeatmapPoint>> {
        use entities::request_logs::Column;
        let mut points = Vec::new();
        let mut day = from.to_offset(utc_offset).date();
        // `to` is an exclusive bound: a `to` that lands exactly on midnight
        // must not pull in that day's (empty) bucket.
        let last_day = (to - TimeDuration::nanoseconds(1))
            .to_offset(utc_offset)
            .date();
        while day <= last_day {
            let (day_start, day_end) = day_bounds_utc(day, utc_offset);
            let value = match metric {
                HeatmapMetric::Requests => {
                    entities::RequestLogs::find()
                        .filter(Column::RequestTime.gte(day_start))
                        .filter(Column::RequestTime.lt(day_end))
                        .count(&self.db)
                        .await? as i64
                }
                HeatmapMetric::Tokens => {
                    #[derive(Debug, FromQueryResult)]
                    struct Row {
                        total: Option<i64>,
                    }
                    let row: Option<Row> = entities::RequestLogs::find()
                        .select_only()
                        .column_as(Column::TotalTokens.sum(), "total")
                        .filter(Column::RequestTime.gte(day_start))
                        .filter(Column::RequestTime.lt(day_end))
                        .into_model::<Row>()
                        .one(&self.db)
                        .await?;
                    row.and_then(|r| r.total).unwrap_or(0)
                }
            };
            points.push(HeatmapPoint { day, value });
            day = day.saturating_add(TimeDuration::days(1));
        }
        Ok(points)
    }

    async fn usage_trend(
        &self,
        unit: TrendUnit,
        offset: i64,
        num_periods: u32,
        utc_offset: UtcOffset,
    ) -> StoreResult<UsageTrend> {
        use entities::request_logs::Column;
        let anchor = period_anchor(unit, offset);

        let mut labels = Vec::with_capacity(num_periods as usize);
        let mut per_period: Vec<BTreeMap<String, i64>> = Vec::with_capacity(num_periods as usize);

        for i in 0..num_periods {
            let back = (num_periods - 1 - i) as i64;
            let period_start_day = period_shift(unit, anchor, -back);
            let period_end_day = period_shift(unit, period_start_day, 1);
            let (from, _) = day_bounds_utc(period_start_day, utc_offset);
            let (to, _) = day_bounds_utc(period_end_day, utc_offset);
            labels.push(period_label(unit, period_start_day));

            let rows: Vec<ModelCountRow> = entities::RequestLogs::find()
                .select_only()
                .column(Column::ModelName)
                .column_as(Column::Id.count(), "matched")
                .filter(Column::RequestTime.gte(from))
                .filter(Column::RequestTime.lt(to))
                .filter(Column::ModelName.is_not_null())
                .group_by(Column::ModelName)
                .into_model::<ModelCountRow>()
                .all(&self.db)
                .await?;

            let mut bucket = BTreeMap::new();
            for row in rows {
                if let Some(model) = row.model_name {
                    bucket.insert(model, row.matched);
                }
            }
            per_period.push(bucket);
        }

        let mut models: Vec<String> = per_period
            .iter()
            .flat_map(|bucket| bucket.keys().cloned())
            .collect();
        models.sort();
        models.dedup();

        let series = models
            .into_iter()
            .map(|model| {
                let data = per_period
                    .iter()
                    .map(|bucket| bucket.get(&model).copied().unwrap_or(0))
                    .collect();
                TrendSeries { label: model, data }
            })
            .collect();

        Ok(UsageTrend { labels, series })
    }

    async fn success_rate(
        &self,
        days: u32,
        hourly: bool,
        utc_offset: UtcOffset,
    ) -> StoreResult<Vec<SuccessRatePoint>> {
        use entities::request_logs::Column;
        let today = OffsetDateTime::now_utc().to_offset(utc_offset).date();
        let mut points = Vec::new();

        for back in 0..days {
            let day = today.saturating_sub(TimeDuration::days(back as i64));
            let (day_start, day_end) = day_bounds_utc(day, utc_offset);
            let hour_slots: Vec<Option<u8>> = if hourly { (0..24).map(Some).collect() } else { vec![None] };

            for slot in hour_slots {
                let (from, to) = match slot {
                    Some(hour) => {
                        let start = day_start + TimeDuration::hours(hour as i64);
                        (start, start + TimeDuration::hours(1))
                    }
                    None => (day_start, day_end),
                };

                let totals: Vec<ModelCountRow> = entities::RequestLogs::find()
                    .select_only()
                    .column(Column::ModelName)
                    .column_as(Column::Id.count(), "matched")
                    .filter(Column::RequestTime.gte(from))
                    .filter(Column::RequestTime.lt(to))
                    .filter(Column::ModelName.is_not_null())
                    .group_by(Column::ModelName)
                    .into_model::<ModelCountRow>()
                    .all(&self.db)
                    .await?;
                let successes: Vec<ModelCountRow> = entities::RequestLogs::find()
                    .select_only()
                    .column(Column::ModelName)
                    .column_as(Column::Id.count(), "matched")
                    .filter(Column::RequestTime.gte(from))
                    .filter(Column::RequestTime.lt(to))
                    .filter(Column::ModelName.is_not_null())
                    .filter(Column::IsSuccess.eq(true))
                    .group_by(Column::ModelName)
                    .into_model::<ModelCountRow>()
                    .all(&self.db)
                    .await?;
                let success_by_model: BTreeMap<String, i64> = successes
                    .into_iter()
                    .filter_map(|row| row.model_name.map(|m| (m, row.matched)))
                    .collect();

                for row in totals {
                    let Some(model_name) = row.model_name else { continue };
                    let success_count = success_by_model.get(&model_name).copied().unwrap_or(0);
                    let rate = if row.matched > 0 {
                        (success_count as f64 / row.matched as f64) * 100.0
                    } else {
                        0.0
                    };
                    points.push(SuccessRatePoint {
                        day,
                        model_name,
                        hour: slot,
                        success_rate: rate,
                    });
                }
            }
        }

        Ok(points)
    }
}

#[derive(Debug, FromQueryResult)]
struct TimeBoundsRow {
    min_time: Option<OffsetDateTime>,
    max_time: Option<OffsetDateTime>,
}

fn principal_from_model(m: entities::principals::Model) -> AuthPrincipal {
    AuthPrincipal {
        id: m.id,
        api_key: m.api_key,
        alias: m.alias,
        active: m.active,
        created_at: m.created_at,
    }
}

fn log_from_model(m: entities::request_logs::Model) -> RequestLog {
    RequestLog {
        request_id: m.request_id,
        request_time: m.request_time,
        principal_alias: m.principal_alias,
        key_identifier: m.key_identifier,
        key_brief: m.key_brief,
        model_name: m.model_name,
        prompt_tokens: m.prompt_tokens,
        completion_tokens: m.completion_tokens,
        total_tokens: m.total_tokens,
        is_success: m.is_success,
        error_kind: m.error_kind,
        dialect: m.dialect,
        streamed: m.streamed,
    }
}

/// `today`, shifted by `offset` whole periods — the bucket boundary the
/// trend query counts backwards from (`offset=0` means the period
/// containing "now").
fn period_anchor(unit: TrendUnit, offset: i64) -> Date {
    let today = OffsetDateTime::now_utc().date();
    period_shift(unit, period_floor(unit, today), offset)
}

fn period_floor(unit: TrendUnit, day: Date) -> Date {
    match unit {
        TrendUnit::Day => day,
        TrendUnit::Week => {
            let back = day.weekday().number_days_from_monday();
            day.saturating_sub(TimeDuration::days(back as i64))
        }
        TrendUnit::Month => Date::from_calendar_date(day.year(), day.month(), 1).unwrap_or(day),
    }
}

fn period_shift(unit: TrendUnit, day: Date, amount: i64) -> Date {
    match unit {
        TrendUnit::Day => day.saturating_add(TimeDuration::days(amount)),
        TrendUnit::Week => day.saturating_add(TimeDuration::days(amount * 7)),
        TrendUnit::Month => add_months(day, amount),
    }
}

fn period_label(unit: TrendUnit, day: Date) -> String {
    match unit {
        TrendUnit::Day => day.to_string(),
        TrendUnit::Week => {
            let (iso_year, iso_week, _) = day.to_iso_week_date();
            format!("{iso_year}-W{iso_week:02}")
        }
        TrendUnit::Month => format!("{}-{:02}", day.year(), day.month() as u8),
    }
}

fn add_months(day: Date, months: i64) -> Date {
    let total = day.year() as i64 * 12 + (day.month() as i64 - 1) + months;
    let year = total.div_euclid(12) as i32;
    let month0 = total.rem_euclid(12) as u8;
    let month = Month::try_from(month0 + 1).unwrap_or(Month::January);
    Date::from_calendar_date(year, month, 1).unwrap_or(day)
}

#[async_trait::async_trait]
impl KeyStore for SeaOrmStore {
    async fn load_all_keys(&self) -> Result<Vec<PersistedKey>, KeyStoreError> {
        let rows = entities::Keys::find().all(&self.db).await.map_err(box_err)?;
        rows.into_iter().map(key_from_model).collect()
    }

    async fn insert_key(&self, key: NewPersistedKey) -> Result<PersistedKey, KeyStoreError> {
        let now = OffsetDateTime::now_utc();
        let model = entities::keys::ActiveModel {
            id: ActiveValue::NotSet,
            identifier: ActiveValue::Set(key.identifier),
            secret: ActiveValue::Set(key.secret),
            brief: ActiveValue::Set(key.brief),
            state: ActiveValue::Set(state_to_str(KeyState::Active).to_string()),
            failure_count: ActiveValue::Set(0),
            cooldown_entry_count: ActiveValue::Set(0),
            current_cooldown_secs: ActiveValue::Set(0),
            cooldown_until: ActiveValue::Set(None),
            in_use_since: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        }
        .insert(&self.db)
        .await
        .map_err(box_err)?;
        key_from_model(model)
    }

    async fn upsert_key(&self, key: &PersistedKey) -> Result<(), KeyStoreError> {
        use entities::keys::Column;
        let existing = entities::Keys::find()
            .filter(Column::Id.eq(key.id))
            .one(&self.db)
            .await
            .map_err(box_err)?;
        let now = OffsetDateTime::now_utc();
        match existing {
            Some(row) => {
                let mut active: entities::keys::ActiveModel = row.into();
                active.state = ActiveValue::Set(state_to_str(key.state).to_string());
                active.failure_count = ActiveValue::Set(key.failure_count as i32);
                active.cooldown_entry_count = ActiveValue::Set(key.cooldown_entry_count as i32);
                active.current_cooldown_secs = ActiveValue::Set(key.current_cooldown_secs as i64);
                active.cooldown_until = ActiveValue::Set(key.cooldown_until);
                active.in_use_since = ActiveValue::Set(key.in_use_since);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await.map_err(box_err)?;
            }
            None => {
                entities::keys::ActiveModel {
                    id: ActiveValue::Set(key.id),
                    identifier: ActiveValue::Set(key.identifier.clone()),
                    secret: ActiveValue::Set(key.secret.clone()),
                    brief: ActiveValue::Set(key.brief.clone()),
                    state: ActiveValue::Set(state_to_str(key.state).to_string()),
                    failure_count: ActiveValue::Set(key.failure_count as i32),
                    cooldown_entry_count: ActiveValue::Set(key.cooldown_entry_count as i32),
                    current_cooldown_secs: ActiveValue::Set(key.current_cooldown_secs as i64),
                    cooldown_until: ActiveValue::Set(key.cooldown_until),
                    in_use_since: ActiveValue::Set(key.in_use_since),
                    created_at: ActiveValue::Set(now),
                    updated_at: ActiveValue::Set(now),
                }
                .insert(&self.db)
                .await
                .map_err(box_err)?;
            }
        }
        Ok(())
    }

    async fn delete_key(&self, id: i64) -> Result<(), KeyStoreError> {
        use entities::keys::Column;
        entities::Keys::delete_many()
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(box_err)?;
        Ok(())
    }
}

fn state_to_str(state: KeyState) -> &'static str {
    match state {
        KeyState::Active => "active",
        KeyState::Leased => "leased",
        KeyState::Cooling => "cooling",
    }
}

fn key_from_model(m: entities::keys::Model) -> Result<PersistedKey, KeyStoreError> {
    let state = match m.state.as_str() {
        "active" => KeyState::Active,
        "leased" => KeyState::Leased,
        "cooling" => KeyState::Cooling,
        other => return Err(format!("unknown persisted key state: {other}").into()),
    };
    Ok(PersistedKey {
        id: m.id,
        identifier: m.identifier,
        secret: m.secret,
        brief: m.brief,
        state,
        failure_count: m.failure_count as u32,
        cooldown_entry_count: m.cooldown_entry_count as u32,
        current_cooldown_secs: m.current_cooldown_secs as u64,
        cooldown_until: m.cooldown_until,
        in_use_since: m.in_use_since,
    })
}

fn box_err(err: sea_orm::DbErr) -> KeyStoreError {
    Box::new(err)
}
