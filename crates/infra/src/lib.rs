//! `davq-infra`: runtime and adapters for the work queue.
//!
//! - [`dispatch`]: polling loops that claim, coalesce, execute and commit work
//! - [`nodes`]: peer node registry and heartbeat
//! - [`postgres`]: Postgres database (sqlx) and schema installer
//! - [`redis_lock`]: Redis lock cache (feature `redis`)
//! - [`config`]: layered node configuration (TOML file + environment)

pub mod config;
pub mod dispatch;
pub mod nodes;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis_lock;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, ServerConfig, ServerConfigLayer, load_config};
pub use dispatch::{DispatchOutcome, DispatcherHandle, DispatcherStats, WorkDispatcher};
pub use nodes::{HeartbeatHandle, NodeRegistry};
pub use postgres::{PostgresDatabase, install_schema};
#[cfg(feature = "redis")]
pub use redis_lock::RedisLockCache;
