use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// An `AuthPrincipal`. `api_key` is stored as an opaque string and is never
/// included in logs or admin responses — only `alias` is externalized.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "principals")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "principals_api_key")]
    pub api_key: String,
    pub alias: String,
    pub active: bool,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
