pub mod global_config;
pub mod keys;
pub mod principals;
pub mod request_logs;
pub mod schema_meta;

pub use global_config::Entity as GlobalConfig;
pub use keys::Entity as Keys;
pub use principals::Entity as Principals;
pub use request_logs::Entity as RequestLogs;
pub use schema_meta::Entity as SchemaMeta;
