//! Transaction over a pooled Postgres connection.
//!
//! Table and column names are never taken from caller data: they come from
//! the kinds' static `WorkTable` declarations, so interpolating them into
//! SQL is safe. Values are always bound.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use tracing::instrument;

use davq_core::{
    ColumnType, FieldValue, NodeInfo, QueueError, QueueResult, WorkFields, WorkId, WorkRecord,
    WorkTable,
};
use davq_queue::transaction::{FinishHook, is_valid_savepoint_name, run_finish_hooks};
use davq_queue::{SyncRevision, Transaction};

use super::map_sqlx_error;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// An open Postgres transaction. Dropping it rolls back.
pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    hooks: Vec<FinishHook>,
}

impl PostgresTransaction {
    pub(crate) fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self {
            tx,
            hooks: Vec::new(),
        }
    }

    async fn execute_raw(&mut self, operation: &str, sql: &str) -> QueueResult<u64> {
        sqlx::query(sql)
            .execute(&mut *self.tx)
            .await
            .map(|r| r.rows_affected())
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

fn bind_field<'q>(query: PgQuery<'q>, value: &FieldValue) -> PgQuery<'q> {
    match value {
        FieldValue::Integer(v) => query.bind(*v),
        FieldValue::Text(v) => query.bind(v.clone()),
        FieldValue::Timestamp(v) => query.bind(*v),
    }
}

fn select_list(table: &WorkTable) -> String {
    let mut list = String::from("work_id, not_before");
    for column in table.columns() {
        list.push_str(", ");
        list.push_str(column.name);
    }
    list
}

/// Siblings held by another claimer are skipped: that claimer coalesces
/// them itself, and waiting on its row locks would deadlock against it.
fn delete_group_sql(table: &WorkTable) -> QueueResult<String> {
    let column = table
        .group_column()
        .ok_or_else(|| QueueError::schema(format!("{} has no group column", table.name())))?;
    Ok(format!(
        r#"
        DELETE FROM {t}
        WHERE work_id IN (
            SELECT work_id FROM {t}
            WHERE {column} = $1
            FOR UPDATE SKIP LOCKED
        )
        "#,
        t = table.name(),
    ))
}

fn decode_record(table: &WorkTable, row: &PgRow) -> QueueResult<WorkRecord> {
    let op = table.name();
    let id: i64 = row.try_get("work_id").map_err(|e| map_sqlx_error(op, e))?;
    let not_before: DateTime<Utc> = row
        .try_get("not_before")
        .map_err(|e| map_sqlx_error(op, e))?;

    let mut fields = WorkFields::new();
    for column in table.columns() {
        let value = match column.ty {
            ColumnType::Integer => row.try_get::<i64, _>(column.name).map(FieldValue::Integer),
            ColumnType::Text => row.try_get::<String, _>(column.name).map(FieldValue::Text),
            ColumnType::Timestamp => row
                .try_get::<DateTime<Utc>, _>(column.name)
                .map(FieldValue::Timestamp),
        }
        .map_err(|e| map_sqlx_error(op, e))?;
        fields.insert(column.name, value);
    }

    Ok(WorkRecord::new(WorkId::new(id), not_before, fields))
}

fn decode_node(row: &PgRow) -> QueueResult<NodeInfo> {
    let pid: i64 = row.try_get("pid").map_err(|e| map_sqlx_error("node_info", e))?;
    let port: i32 = row.try_get("port").map_err(|e| map_sqlx_error("node_info", e))?;
    Ok(NodeInfo {
        hostname: row
            .try_get("hostname")
            .map_err(|e| map_sqlx_error("node_info", e))?,
        pid: u32::try_from(pid)
            .map_err(|_| QueueError::decode("node_info", format!("pid {pid} out of range")))?,
        port: u16::try_from(port)
            .map_err(|_| QueueError::decode("node_info", format!("port {port} out of range")))?,
        last_seen: row
            .try_get("last_seen")
            .map_err(|e| map_sqlx_error("node_info", e))?,
    })
}

#[async_trait]
impl Transaction for PostgresTransaction {
    #[instrument(skip_all, fields(table = table.name()), err)]
    async fn insert_work(
        &mut self,
        table: &'static WorkTable,
        not_before: DateTime<Utc>,
        fields: &WorkFields,
    ) -> QueueResult<WorkId> {
        let mut columns = vec!["not_before"];
        let mut placeholders = vec!["$1".to_string()];
        let mut values = Vec::with_capacity(table.columns().len());
        for (i, column) in table.columns().iter().enumerate() {
            let value = fields.get(column.name).ok_or_else(|| {
                QueueError::schema(format!("{} requires column {}", table.name(), column.name))
            })?;
            columns.push(column.name);
            placeholders.push(format!("${}", i + 2));
            values.push(value);
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING work_id",
            table.name(),
            columns.join(", "),
            placeholders.join(", ")
        );
        let mut query = sqlx::query(&sql).bind(not_before);
        for value in values {
            query = bind_field(query, value);
        }

        let row = query
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_work", e))?;
        let id: i64 = row
            .try_get("work_id")
            .map_err(|e| map_sqlx_error("insert_work", e))?;
        Ok(WorkId::new(id))
    }

    #[instrument(skip_all, fields(table = table.name()), err)]
    async fn claim_next(
        &mut self,
        table: &'static WorkTable,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<WorkRecord>> {
        let sql = format!(
            r#"
            DELETE FROM {t}
            WHERE work_id = (
                SELECT work_id FROM {t}
                WHERE not_before <= $1
                ORDER BY work_id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {cols}
            "#,
            t = table.name(),
            cols = select_list(table)
        );

        let row = sqlx::query(&sql)
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(|row| decode_record(table, &row)).transpose()
    }

    #[instrument(skip_all, fields(table = table.name(), key = %key), err)]
    async fn delete_group(
        &mut self,
        table: &'static WorkTable,
        key: &FieldValue,
    ) -> QueueResult<u64> {
        let sql = delete_group_sql(table)?;

        bind_field(sqlx::query(&sql), key)
            .execute(&mut *self.tx)
            .await
            .map(|r| r.rows_affected())
            .map_err(|e| map_sqlx_error("delete_group", e))
    }

    async fn delete_pending(&mut self, table: &'static WorkTable) -> QueueResult<u64> {
        self.execute_raw("delete_pending", &format!("DELETE FROM {}", table.name()))
            .await
    }

    async fn count_pending(&mut self, table: &'static WorkTable) -> QueueResult<u64> {
        let sql = format!("SELECT COUNT(*) AS pending FROM {}", table.name());
        let row = sqlx::query(&sql)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("count_pending", e))?;
        let count: i64 = row
            .try_get("pending")
            .map_err(|e| map_sqlx_error("count_pending", e))?;
        Ok(count.max(0) as u64)
    }

    async fn pending(&mut self, table: &'static WorkTable) -> QueueResult<Vec<WorkRecord>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY work_id",
            select_list(table),
            table.name()
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("pending", e))?;
        rows.iter().map(|row| decode_record(table, row)).collect()
    }

    async fn savepoint(&mut self, name: &str) -> QueueResult<()> {
        check_savepoint(name)?;
        self.execute_raw("savepoint", &format!("SAVEPOINT {name}"))
            .await
            .map(drop)
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> QueueResult<()> {
        check_savepoint(name)?;
        self.execute_raw("rollback_to_savepoint", &format!("ROLLBACK TO SAVEPOINT {name}"))
            .await?;
        self.execute_raw("rollback_to_savepoint", &format!("RELEASE SAVEPOINT {name}"))
            .await
            .map(drop)
    }

    async fn release_savepoint(&mut self, name: &str) -> QueueResult<()> {
        check_savepoint(name)?;
        self.execute_raw("release_savepoint", &format!("RELEASE SAVEPOINT {name}"))
            .await
            .map(drop)
    }

    #[instrument(skip_all, fields(node = %node), err)]
    async fn upsert_node(&mut self, node: &NodeInfo) -> QueueResult<()> {
        sqlx::query(
            r#"
            INSERT INTO node_info (hostname, pid, port, last_seen)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (hostname, pid)
            DO UPDATE SET port = EXCLUDED.port, last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(&node.hostname)
        .bind(i64::from(node.pid))
        .bind(i32::from(node.port))
        .bind(node.last_seen)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_node", e))?;
        Ok(())
    }

    async fn delete_node(&mut self, hostname: &str, pid: u32) -> QueueResult<()> {
        sqlx::query("DELETE FROM node_info WHERE hostname = $1 AND pid = $2")
            .bind(hostname)
            .bind(i64::from(pid))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_node", e))?;
        Ok(())
    }

    async fn list_nodes(&mut self) -> QueueResult<Vec<NodeInfo>> {
        let rows = sqlx::query(
            "SELECT hostname, pid, port, last_seen FROM node_info ORDER BY hostname, pid",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_nodes", e))?;
        rows.iter().map(decode_node).collect()
    }

    async fn named_value(&mut self, name: &str) -> QueueResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM named_value WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("named_value", e))?;
        row.map(|r| r.try_get("value"))
            .transpose()
            .map_err(|e| map_sqlx_error("named_value", e))
    }

    #[instrument(skip(self), err)]
    async fn set_named_value(&mut self, name: &str, value: &str) -> QueueResult<()> {
        sqlx::query(
            r#"
            INSERT INTO named_value (name, value, modified)
            VALUES ($1, $2, now())
            ON CONFLICT (name)
            DO UPDATE SET value = EXCLUDED.value, modified = EXCLUDED.modified
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("set_named_value", e))?;
        Ok(())
    }

    async fn record_revision(&mut self, revision: &SyncRevision) -> QueueResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_revision (resource_id, name, revision, deleted, modified)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (resource_id, name)
            DO UPDATE SET revision = EXCLUDED.revision,
                          deleted = EXCLUDED.deleted,
                          modified = EXCLUDED.modified
            "#,
        )
        .bind(revision.resource_id)
        .bind(&revision.name)
        .bind(revision.revision)
        .bind(revision.deleted)
        .bind(revision.modified)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("record_revision", e))?;
        Ok(())
    }

    async fn latest_revision_before(&mut self, before: DateTime<Utc>) -> QueueResult<Option<i64>> {
        let row = sqlx::query("SELECT MAX(revision) AS revision FROM sync_revision WHERE modified < $1")
            .bind(before)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("latest_revision_before", e))?;
        row.try_get::<Option<i64>, _>("revision")
            .map_err(|e| map_sqlx_error("latest_revision_before", e))
    }

    #[instrument(skip(self), err)]
    async fn delete_revisions_before(&mut self, below: i64, limit: u32) -> QueueResult<u64> {
        sqlx::query(
            r#"
            DELETE FROM sync_revision
            WHERE (resource_id, name) IN (
                SELECT resource_id, name FROM sync_revision
                WHERE deleted AND revision < $1
                ORDER BY revision
                LIMIT $2
            )
            "#,
        )
        .bind(below)
        .bind(i64::from(limit))
        .execute(&mut *self.tx)
        .await
        .map(|r| r.rows_affected())
        .map_err(|e| map_sqlx_error("delete_revisions_before", e))
    }

    async fn commit(self: Box<Self>) -> QueueResult<()> {
        let PostgresTransaction { tx, hooks } = *self;
        let result = tx.commit().await.map_err(|e| map_sqlx_error("commit", e));
        run_finish_hooks(hooks, result.is_ok()).await;
        result
    }

    async fn abort(self: Box<Self>) -> QueueResult<()> {
        let PostgresTransaction { tx, hooks } = *self;
        let result = tx.rollback().await.map_err(|e| map_sqlx_error("abort", e));
        run_finish_hooks(hooks, false).await;
        result
    }

    fn on_finish(&mut self, hook: FinishHook) {
        self.hooks.push(hook);
    }
}

fn check_savepoint(name: &str) -> QueueResult<()> {
    if is_valid_savepoint_name(name) {
        Ok(())
    } else {
        Err(QueueError::storage(
            "savepoint",
            format!("invalid savepoint name {name:?}"),
        ))
    }
}
