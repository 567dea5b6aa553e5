//! Postgres-backed database.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | QueueError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (undefined table) | `42P01` | `Schema` | Work kind whose table was never installed |
//! | Database (undefined column) | `42703` | `Schema` | Table out of date with the kind's columns |
//! | Database (other) | Any other | `Storage` | Constraint violations, serialization failures |
//! | PoolClosed / Io / Tls / other | N/A | `Storage` | Lost connection, shutdown |
//! | ColumnDecode / ColumnNotFound | N/A | `Decode` | Row does not map back to its kind |
//!
//! ## Claiming
//!
//! `claim_next` is a single statement:
//!
//! ```sql
//! DELETE FROM <table> WHERE work_id = (
//!     SELECT work_id FROM <table> WHERE not_before <= $1
//!     ORDER BY work_id LIMIT 1 FOR UPDATE SKIP LOCKED
//! ) RETURNING work_id, not_before, <columns>
//! ```
//!
//! The row lock is held until the transaction ends, so concurrent claimers
//! skip it, and an abort makes it claimable again.

mod schema;
mod store;

pub use schema::{install_schema, work_table_ddl};
pub use store::PostgresTransaction;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::instrument;

use davq_core::{QueueError, QueueResult};
use davq_queue::{Database, Transaction};

/// Database over a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: Arc<PgPool>,
}

impl PostgresDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(url), err)]
    pub async fn connect(url: &str, max_connections: u32) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    async fn begin(&self) -> QueueResult<Box<dyn Transaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(Box::new(PostgresTransaction::new(tx)))
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("42P01") | Some("42703") => QueueError::Schema(msg),
                _ => QueueError::storage(operation, db_err.message()),
            }
        }
        sqlx::Error::ColumnDecode { index, source } => {
            QueueError::decode(operation, format!("column {index}: {source}"))
        }
        sqlx::Error::ColumnNotFound(column) => {
            QueueError::decode(operation, format!("column {column} not found"))
        }
        sqlx::Error::PoolClosed => QueueError::storage(operation, "connection pool closed"),
        other => QueueError::storage(operation, other.to_string()),
    }
}
