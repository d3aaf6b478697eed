mod db;
mod entities;
mod seaorm;
mod store;

pub use db::connect_shared;
pub use seaorm::SeaOrmStore;
pub use store::{
    AuthPrincipal, HeatmapMetric, HeatmapPoint, LogFilter, LogQueryResult, NewAuthPrincipal,
    PrincipalCallCount, RequestLog, Store, StoreError, StoreResult, SuccessRatePoint, TrendSeries,
    TrendUnit, UsageTrend,
};
