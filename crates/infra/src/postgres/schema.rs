//! Schema installer.
//!
//! Every statement is idempotent (`IF NOT EXISTS`), so installing on each
//! node start is safe.

use sqlx::PgPool;
use tracing::{info, instrument};

use davq_core::{ColumnType, QueueResult, WorkTable};

use super::map_sqlx_error;

const SHARED_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS node_info (
        hostname  TEXT        NOT NULL,
        pid       BIGINT      NOT NULL,
        port      INTEGER     NOT NULL,
        last_seen TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (hostname, pid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS named_value (
        name     TEXT        PRIMARY KEY,
        value    TEXT        NOT NULL,
        modified TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_revision (
        resource_id BIGINT      NOT NULL,
        name        TEXT        NOT NULL,
        revision    BIGINT      NOT NULL,
        deleted     BOOLEAN     NOT NULL,
        modified    TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (resource_id, name)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS sync_revision_revision ON sync_revision (revision)",
];

fn sql_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Integer => "BIGINT",
        ColumnType::Text => "TEXT",
        ColumnType::Timestamp => "TIMESTAMPTZ",
    }
}

/// DDL for one work kind's table (and its group index, if grouped).
pub fn work_table_ddl(table: &WorkTable) -> Vec<String> {
    let mut columns = vec![
        "work_id BIGSERIAL PRIMARY KEY".to_string(),
        "not_before TIMESTAMPTZ NOT NULL DEFAULT now()".to_string(),
    ];
    columns.extend(
        table
            .columns()
            .iter()
            .map(|c| format!("{} {} NOT NULL", c.name, sql_type(c.ty))),
    );

    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table.name(),
        columns.join(", ")
    )];
    if let Some(group) = table.group_column() {
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {t}_{group} ON {t} ({group})",
            t = table.name()
        ));
    }
    statements
}

/// Create the shared tables and one table per work kind.
#[instrument(skip_all, fields(kinds = tables.len()), err)]
pub async fn install_schema(pool: &PgPool, tables: &[&'static WorkTable]) -> QueueResult<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| map_sqlx_error("install_schema", e))?;

    let statements = SHARED_TABLES
        .iter()
        .map(|s| s.to_string())
        .chain(tables.iter().flat_map(|t| work_table_ddl(t)));
    for statement in statements {
        sqlx::query(&statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("install_schema", e))?;
    }

    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("install_schema", e))?;
    info!(kinds = tables.len(), "schema installed");
    Ok(())
}
