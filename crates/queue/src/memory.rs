//! In-memory database.
//!
//! Implements the [`Database`] boundary with row-level claim locking so the
//! queue's concurrency behaviour can be exercised without Postgres:
//!
//! - work rows inserted by an open transaction are invisible to others
//! - a claimed row is locked by its claimer and skipped by everyone else
//!   until the claimer commits (row gone) or aborts (row back)
//! - each transaction keeps an undo log; savepoints are markers in it
//!
//! Node, named-value and revision writes are applied in place and undone on
//! abort, so other transactions may observe them before commit.
//!
//! Useful for:
//! - unit and integration tests
//! - single-process development setups

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use davq_core::{
    FieldValue, NodeInfo, QueueError, QueueResult, WorkFields, WorkId, WorkRecord, WorkTable,
};

use crate::transaction::{
    Database, FinishHook, SyncRevision, Transaction, is_valid_savepoint_name, run_finish_hooks,
};

type TxnId = u64;

#[derive(Debug, Clone)]
struct Row {
    record: WorkRecord,
    inserted_by: Option<TxnId>,
    deleted_by: Option<TxnId>,
}

impl Row {
    fn visible_to(&self, txn: TxnId) -> bool {
        self.inserted_by.is_none_or(|t| t == txn) && self.deleted_by != Some(txn)
    }

    fn claimable_by(&self, txn: TxnId) -> bool {
        self.inserted_by.is_none_or(|t| t == txn) && self.deleted_by.is_none()
    }
}

#[derive(Debug)]
enum Undo {
    Savepoint(String),
    Inserted {
        table: &'static str,
        id: WorkId,
    },
    Deleted {
        table: &'static str,
        id: WorkId,
    },
    NamedValue {
        name: String,
        previous: Option<String>,
    },
    Node {
        hostname: String,
        pid: u32,
        previous: Option<NodeInfo>,
    },
    RevisionRecorded {
        resource_id: i64,
        name: String,
        previous: Option<SyncRevision>,
    },
    RevisionsDeleted(Vec<SyncRevision>),
}

#[derive(Debug, Default)]
struct MemoryState {
    next_txn: TxnId,
    next_work_id: i64,
    tables: HashMap<&'static str, Vec<Row>>,
    nodes: Vec<NodeInfo>,
    named_values: HashMap<String, String>,
    revisions: Vec<SyncRevision>,
    unavailable: bool,
}

impl MemoryState {
    fn rows(&mut self, table: &WorkTable) -> QueueResult<&mut Vec<Row>> {
        self.tables
            .get_mut(table.name())
            .ok_or_else(|| QueueError::schema(format!("relation {} does not exist", table.name())))
    }

    fn revert(&mut self, txn: TxnId, entry: Undo) {
        match entry {
            Undo::Savepoint(_) => {}
            Undo::Inserted { table, id } => {
                if let Some(rows) = self.tables.get_mut(table) {
                    rows.retain(|r| r.record.id != id);
                }
            }
            Undo::Deleted { table, id } => {
                if let Some(row) = self
                    .tables
                    .get_mut(table)
                    .and_then(|rows| rows.iter_mut().find(|r| r.record.id == id))
                {
                    if row.deleted_by == Some(txn) {
                        row.deleted_by = None;
                    }
                }
            }
            Undo::NamedValue { name, previous } => match previous {
                Some(value) => {
                    self.named_values.insert(name, value);
                }
                None => {
                    self.named_values.remove(&name);
                }
            },
            Undo::Node {
                hostname,
                pid,
                previous,
            } => {
                self.nodes.retain(|n| !(n.hostname == hostname && n.pid == pid));
                if let Some(node) = previous {
                    self.nodes.push(node);
                }
            }
            Undo::RevisionRecorded {
                resource_id,
                name,
                previous,
            } => {
                self.revisions
                    .retain(|r| !(r.resource_id == resource_id && r.name == name));
                if let Some(revision) = previous {
                    self.revisions.push(revision);
                }
            }
            Undo::RevisionsDeleted(removed) => self.revisions.extend(removed),
        }
    }

    fn finalize(&mut self, txn: TxnId, entry: Undo) {
        match entry {
            Undo::Inserted { table, id } => {
                if let Some(row) = self
                    .tables
                    .get_mut(table)
                    .and_then(|rows| rows.iter_mut().find(|r| r.record.id == id))
                {
                    row.inserted_by = None;
                }
            }
            Undo::Deleted { table, id } => {
                if let Some(rows) = self.tables.get_mut(table) {
                    rows.retain(|r| !(r.record.id == id && r.deleted_by == Some(txn)));
                }
            }
            _ => {}
        }
    }
}

/// Shared in-memory database; clones refer to the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Database with the given work tables already created.
    pub fn with_tables(tables: impl IntoIterator<Item = &'static WorkTable>) -> Self {
        let db = Self::new();
        for table in tables {
            db.create_table(table);
        }
        db
    }

    /// Create the table for a work kind. Idempotent.
    pub fn create_table(&self, table: &'static WorkTable) {
        self.lock().tables.entry(table.name()).or_default();
    }

    /// Make `begin` fail with a storage error, simulating a lost connection.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Committed rows of `table`, including rows currently claimed by an
    /// open transaction.
    pub fn committed_work(&self, table: &WorkTable) -> Vec<WorkRecord> {
        self.lock()
            .tables
            .get(table.name())
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.inserted_by.is_none())
                    .map(|r| r.record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn current_value(&self, name: &str) -> Option<String> {
        self.lock().named_values.get(name).cloned()
    }

    pub fn current_revisions(&self) -> Vec<SyncRevision> {
        let mut revisions = self.lock().revisions.clone();
        revisions.sort_by_key(|r| r.revision);
        revisions
    }

    pub fn current_nodes(&self) -> Vec<NodeInfo> {
        self.lock().nodes.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn begin(&self) -> QueueResult<Box<dyn Transaction>> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(QueueError::storage("begin", "database unavailable"));
        }
        state.next_txn += 1;
        let txn = state.next_txn;
        drop(state);

        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            txn,
            undo: Vec::new(),
            hooks: Vec::new(),
            finished: false,
        }))
    }
}

/// Transaction over an [`InMemoryDatabase`].
pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    txn: TxnId,
    undo: Vec<Undo>,
    hooks: Vec<FinishHook>,
    finished: bool,
}

impl std::fmt::Debug for MemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransaction")
            .field("txn", &self.txn)
            .field("undo", &self.undo.len())
            .field("hooks", &self.hooks.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl MemoryTransaction {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rollback_all(&mut self) {
        let entries: Vec<Undo> = self.undo.drain(..).rev().collect();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for entry in entries {
            state.revert(self.txn, entry);
        }
        self.finished = true;
    }

    fn savepoint_position(&self, name: &str) -> QueueResult<usize> {
        self.undo
            .iter()
            .rposition(|e| matches!(e, Undo::Savepoint(n) if n == name))
            .ok_or_else(|| QueueError::storage("savepoint", format!("no such savepoint {name}")))
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn insert_work(
        &mut self,
        table: &'static WorkTable,
        not_before: DateTime<Utc>,
        fields: &WorkFields,
    ) -> QueueResult<WorkId> {
        let txn = self.txn;
        let id = {
            let mut state = self.lock();
            state.rows(table)?;
            state.next_work_id += 1;
            let id = WorkId::new(state.next_work_id);
            state.rows(table)?.push(Row {
                record: WorkRecord::new(id, not_before, fields.clone()),
                inserted_by: Some(txn),
                deleted_by: None,
            });
            id
        };
        self.undo.push(Undo::Inserted {
            table: table.name(),
            id,
        });
        Ok(id)
    }

    async fn claim_next(
        &mut self,
        table: &'static WorkTable,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<WorkRecord>> {
        let txn = self.txn;
        let claimed = {
            let mut state = self.lock();
            let rows = state.rows(table)?;
            rows.iter_mut()
                .filter(|r| r.claimable_by(txn) && r.record.is_eligible(now))
                .min_by_key(|r| r.record.id)
                .map(|row| {
                    row.deleted_by = Some(txn);
                    row.record.clone()
                })
        };
        if let Some(record) = &claimed {
            self.undo.push(Undo::Deleted {
                table: table.name(),
                id: record.id,
            });
        }
        Ok(claimed)
    }

    async fn delete_group(
        &mut self,
        table: &'static WorkTable,
        key: &FieldValue,
    ) -> QueueResult<u64> {
        let Some(column) = table.group_column() else {
            return Err(QueueError::schema(format!(
                "{} has no group column",
                table.name()
            )));
        };

        let txn = self.txn;
        let removed: Vec<WorkId> = {
            let mut state = self.lock();
            state
                .rows(table)?
                .iter_mut()
                .filter(|r| r.claimable_by(txn) && r.record.fields.get(column) == Some(key))
                .map(|row| {
                    row.deleted_by = Some(txn);
                    row.record.id
                })
                .collect()
        };

        let count = removed.len() as u64;
        self.undo.extend(removed.into_iter().map(|id| Undo::Deleted {
            table: table.name(),
            id,
        }));
        Ok(count)
    }

    async fn delete_pending(&mut self, table: &'static WorkTable) -> QueueResult<u64> {
        let txn = self.txn;
        let removed: Vec<WorkId> = {
            let mut state = self.lock();
            state
                .rows(table)?
                .iter_mut()
                .filter(|r| r.claimable_by(txn))
                .map(|row| {
                    row.deleted_by = Some(txn);
                    row.record.id
                })
                .collect()
        };

        let count = removed.len() as u64;
        self.undo.extend(removed.into_iter().map(|id| Undo::Deleted {
            table: table.name(),
            id,
        }));
        Ok(count)
    }

    async fn count_pending(&mut self, table: &'static WorkTable) -> QueueResult<u64> {
        let txn = self.txn;
        let mut state = self.lock();
        Ok(state.rows(table)?.iter().filter(|r| r.visible_to(txn)).count() as u64)
    }

    async fn pending(&mut self, table: &'static WorkTable) -> QueueResult<Vec<WorkRecord>> {
        let txn = self.txn;
        let mut state = self.lock();
        let mut records: Vec<WorkRecord> = state
            .rows(table)?
            .iter()
            .filter(|r| r.visible_to(txn))
            .map(|r| r.record.clone())
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn savepoint(&mut self, name: &str) -> QueueResult<()> {
        if !is_valid_savepoint_name(name) {
            return Err(QueueError::storage(
                "savepoint",
                format!("invalid savepoint name {name:?}"),
            ));
        }
        self.undo.push(Undo::Savepoint(name.to_string()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> QueueResult<()> {
        let position = self.savepoint_position(name)?;
        let entries: Vec<Undo> = self.undo.drain(position..).rev().collect();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for entry in entries {
            state.revert(self.txn, entry);
        }
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> QueueResult<()> {
        let position = self.savepoint_position(name)?;
        self.undo.remove(position);
        Ok(())
    }

    async fn upsert_node(&mut self, node: &NodeInfo) -> QueueResult<()> {
        let previous = {
            let mut state = self.lock();
            let position = state.nodes.iter().position(|n| n.same_process(node));
            let previous = position.map(|i| state.nodes.remove(i));
            state.nodes.push(node.clone());
            previous
        };
        self.undo.push(Undo::Node {
            hostname: node.hostname.clone(),
            pid: node.pid,
            previous,
        });
        Ok(())
    }

    async fn delete_node(&mut self, hostname: &str, pid: u32) -> QueueResult<()> {
        let previous = {
            let mut state = self.lock();
            let position = state
                .nodes
                .iter()
                .position(|n| n.hostname == hostname && n.pid == pid);
            position.map(|i| state.nodes.remove(i))
        };
        if previous.is_some() {
            self.undo.push(Undo::Node {
                hostname: hostname.to_string(),
                pid,
                previous,
            });
        }
        Ok(())
    }

    async fn list_nodes(&mut self) -> QueueResult<Vec<NodeInfo>> {
        Ok(self.lock().nodes.clone())
    }

    async fn named_value(&mut self, name: &str) -> QueueResult<Option<String>> {
        Ok(self.lock().named_values.get(name).cloned())
    }

    async fn set_named_value(&mut self, name: &str, value: &str) -> QueueResult<()> {
        let previous = self
            .lock()
            .named_values
            .insert(name.to_string(), value.to_string());
        self.undo.push(Undo::NamedValue {
            name: name.to_string(),
            previous,
        });
        Ok(())
    }

    async fn record_revision(&mut self, revision: &SyncRevision) -> QueueResult<()> {
        let previous = {
            let mut state = self.lock();
            let position = state
                .revisions
                .iter()
                .position(|r| r.resource_id == revision.resource_id && r.name == revision.name);
            let previous = position.map(|i| state.revisions.remove(i));
            state.revisions.push(revision.clone());
            previous
        };
        self.undo.push(Undo::RevisionRecorded {
            resource_id: revision.resource_id,
            name: revision.name.clone(),
            previous,
        });
        Ok(())
    }

    async fn latest_revision_before(&mut self, before: DateTime<Utc>) -> QueueResult<Option<i64>> {
        Ok(self
            .lock()
            .revisions
            .iter()
            .filter(|r| r.modified < before)
            .map(|r| r.revision)
            .max())
    }

    async fn delete_revisions_before(&mut self, below: i64, limit: u32) -> QueueResult<u64> {
        let removed = {
            let mut state = self.lock();
            let mut doomed: Vec<i64> = state
                .revisions
                .iter()
                .filter(|r| r.deleted && r.revision < below)
                .map(|r| r.revision)
                .collect();
            doomed.sort_unstable();
            doomed.truncate(limit as usize);

            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.revisions)
                .into_iter()
                .partition(|r| r.deleted && doomed.contains(&r.revision));
            state.revisions = kept;
            removed
        };

        let count = removed.len() as u64;
        if count > 0 {
            self.undo.push(Undo::RevisionsDeleted(removed));
        }
        Ok(count)
    }

    async fn commit(mut self: Box<Self>) -> QueueResult<()> {
        let entries: Vec<Undo> = self.undo.drain(..).collect();
        {
            let mut state = self.lock();
            for entry in entries {
                state.finalize(self.txn, entry);
            }
        }
        self.finished = true;
        run_finish_hooks(std::mem::take(&mut self.hooks), true).await;
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> QueueResult<()> {
        self.rollback_all();
        run_finish_hooks(std::mem::take(&mut self.hooks), false).await;
        Ok(())
    }

    fn on_finish(&mut self, hook: FinishHook) {
        self.hooks.push(hook);
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback_all();
        }
    }
}
