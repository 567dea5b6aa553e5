//! Transactional storage boundary.
//!
//! The queue's only coordination medium is the shared database: work is
//! visible to other nodes only once the enqueuing transaction commits, and
//! a record is consumed by deleting it inside the claiming transaction. This
//! module defines the operations the queue needs from that database without
//! assuming a particular driver.
//!
//! ## Claim semantics
//!
//! `claim_next` must behave like
//! `SELECT ... WHERE not_before <= now ORDER BY work_id LIMIT 1 FOR UPDATE SKIP LOCKED`
//! followed by a delete of the selected row in the same transaction:
//!
//! - two transactions racing for the same row never both receive it
//! - a row locked by another transaction is skipped, not waited on
//! - aborting the claiming transaction makes the row claimable again
//!
//! ## Savepoints
//!
//! `rollback_to_savepoint` undoes everything since the savepoint and then
//! discards it; `release_savepoint` keeps the effects and discards it.
//!
//! ## Dropping
//!
//! A transaction dropped without `commit` or `abort` is aborted. Its finish
//! hooks are dropped without running.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use davq_core::{FieldValue, NodeInfo, QueueResult, WorkFields, WorkId, WorkRecord, WorkTable};

/// One entry in the sync-revision history kept by the object store.
///
/// Tombstones (`deleted == true`) below the low-water-mark are what the
/// revision cleanup loop removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRevision {
    pub resource_id: i64,
    pub name: String,
    pub revision: i64,
    pub deleted: bool,
    pub modified: DateTime<Utc>,
}

/// Callback run after a transaction finishes; the flag is `true` when it
/// committed.
pub type FinishHook = Box<dyn FnOnce(bool) -> BoxFuture<'static, ()> + Send>;

/// Run `hooks` in registration order.
pub async fn run_finish_hooks(hooks: Vec<FinishHook>, committed: bool) {
    for hook in hooks {
        hook(committed).await;
    }
}

/// An open database transaction.
#[async_trait]
pub trait Transaction: Send {
    // -- work tables --------------------------------------------------------

    /// Insert a work record; the id is assigned by the database.
    async fn insert_work(
        &mut self,
        table: &'static WorkTable,
        not_before: DateTime<Utc>,
        fields: &WorkFields,
    ) -> QueueResult<WorkId>;

    /// Claim (select-for-update-skip-locked, then delete) the oldest record
    /// eligible at `now`. `Ok(None)` when nothing is eligible or every
    /// eligible row is locked by another transaction.
    async fn claim_next(
        &mut self,
        table: &'static WorkTable,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<WorkRecord>>;

    /// Delete every pending record of `table` whose group column equals
    /// `key`, skipping rows locked by another transaction. Returns the
    /// number of rows removed.
    async fn delete_group(&mut self, table: &'static WorkTable, key: &FieldValue)
    -> QueueResult<u64>;

    /// Delete every pending record of `table`.
    async fn delete_pending(&mut self, table: &'static WorkTable) -> QueueResult<u64>;

    /// Number of records of `table` visible to this transaction, eligible
    /// or not.
    async fn count_pending(&mut self, table: &'static WorkTable) -> QueueResult<u64>;

    /// Every record of `table` visible to this transaction, by id.
    async fn pending(&mut self, table: &'static WorkTable) -> QueueResult<Vec<WorkRecord>>;

    // -- nested transactions -----------------------------------------------

    async fn savepoint(&mut self, name: &str) -> QueueResult<()>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> QueueResult<()>;

    async fn release_savepoint(&mut self, name: &str) -> QueueResult<()>;

    // -- node registry ------------------------------------------------------

    /// Insert or refresh the row for `(node.hostname, node.pid)`.
    async fn upsert_node(&mut self, node: &NodeInfo) -> QueueResult<()>;

    async fn delete_node(&mut self, hostname: &str, pid: u32) -> QueueResult<()>;

    async fn list_nodes(&mut self) -> QueueResult<Vec<NodeInfo>>;

    // -- named values -------------------------------------------------------

    async fn named_value(&mut self, name: &str) -> QueueResult<Option<String>>;

    async fn set_named_value(&mut self, name: &str, value: &str) -> QueueResult<()>;

    // -- sync revision history ---------------------------------------------

    async fn record_revision(&mut self, revision: &SyncRevision) -> QueueResult<()>;

    /// Highest revision whose modification time is before `before`.
    async fn latest_revision_before(&mut self, before: DateTime<Utc>) -> QueueResult<Option<i64>>;

    /// Delete up to `limit` tombstone revisions with `revision < below`.
    async fn delete_revisions_before(&mut self, below: i64, limit: u32) -> QueueResult<u64>;

    // -- completion ---------------------------------------------------------

    async fn commit(self: Box<Self>) -> QueueResult<()>;

    async fn abort(self: Box<Self>) -> QueueResult<()>;

    /// Run `hook` once the outcome of this transaction is final: after a
    /// successful commit with `true`, after an abort or a failed commit with
    /// `false`. Savepoint rollbacks do not remove hooks.
    fn on_finish(&mut self, hook: FinishHook);
}

/// Factory for transactions against one shared database.
#[async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self) -> QueueResult<Box<dyn Transaction>>;
}

#[async_trait]
impl<D> Database for std::sync::Arc<D>
where
    D: Database + ?Sized,
{
    async fn begin(&self) -> QueueResult<Box<dyn Transaction>> {
        (**self).begin().await
    }
}

/// Savepoint names are interpolated into SQL; keep them to identifiers.
pub fn is_valid_savepoint_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
