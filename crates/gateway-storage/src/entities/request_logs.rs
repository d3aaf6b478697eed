use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One `RequestLog` row. Insert-only: the `Store` trait exposes no
/// `update_request_log`, matching the immutable-after-write invariant.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "request_logs_request_id")]
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

impl ActiveModelBehavior for ActiveModel {}
