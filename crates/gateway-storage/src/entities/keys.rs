use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "keys_identifier")]
    pub identifier: String,
    pub secret: String,
    pub brief: String,
    pub state: String,
    pub failure_count: i32,
    pub cooldown_entry_count: i32,
    pub current_cooldown_secs: i64,
    pub cooldown_until: Option<OffsetDateTime>,
    pub in_use_since: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
