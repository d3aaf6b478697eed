use sea_orm::entity::prelude::*;

/// Single-row marker checked at bootstrap. The core does not migrate schema
/// (see Non-goals); it only refuses to start against a mismatched version.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "schema_meta")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub version: i32,
}

impl ActiveModelBehavior for ActiveModel {}

pub const CURRENT_SCHEMA_VERSION: i32 = 1;
