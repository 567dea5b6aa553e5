//! Enqueue side of the queue.
//!
//! Producers never write work tables directly; they go through a [`Queuer`]
//! inside their own transaction, so the work becomes visible to dispatchers
//! exactly when (and only if) that transaction commits.
//!
//! Offline tools that must not schedule real work are handed a
//! [`NonPerformingQueuer`] instead of a [`TransactionalQueuer`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::watch;
use tracing::debug;

use davq_core::{Clock, QueueError, QueueResult, WorkFields, WorkId, WorkTable};

use crate::item::WorkItem;
use crate::registry::WorkRegistry;
use crate::transaction::Transaction;

/// Handle returned to the producer of a work item.
#[derive(Debug, Clone)]
pub struct WorkProposal {
    pub table: &'static str,
    /// `None` when the queuer does not perform work.
    pub work_id: Option<WorkId>,
    pub not_before: DateTime<Utc>,
    committed: watch::Receiver<Option<bool>>,
}

impl WorkProposal {
    /// Proposal whose outcome follows `txn`.
    fn pending(
        txn: &mut dyn Transaction,
        table: &'static str,
        work_id: WorkId,
        not_before: DateTime<Utc>,
    ) -> Self {
        let (outcome, committed) = watch::channel(None);
        txn.on_finish(Box::new(move |done: bool| {
            async move {
                // The producer may have dropped the proposal already.
                let _ = outcome.send(Some(done));
            }
            .boxed()
        }));
        Self {
            table,
            work_id: Some(work_id),
            not_before,
            committed,
        }
    }

    /// Proposal for work that will never exist.
    fn unscheduled(table: &'static str, not_before: DateTime<Utc>) -> Self {
        let (_, committed) = watch::channel(Some(false));
        Self {
            table,
            work_id: None,
            not_before,
            committed,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.work_id.is_some()
    }

    /// `Some(true)` once the enqueuing transaction committed, `Some(false)`
    /// once it aborted, `None` while it is still open.
    pub fn outcome(&self) -> Option<bool> {
        *self.committed.borrow()
    }

    /// Wait for the enqueuing transaction to finish. `true` when the record
    /// was committed; `false` when it aborted, was dropped, or the queuer
    /// never schedules work.
    pub async fn when_committed(&self) -> bool {
        let mut committed = self.committed.clone();
        match committed.wait_for(Option::is_some).await {
            Ok(outcome) => *outcome == Some(true),
            Err(_) => false,
        }
    }
}

#[async_trait]
pub trait Queuer: Send + Sync {
    /// Insert a record of `table` with `fields` inside `txn`.
    /// `not_before = None` means "now".
    async fn enqueue_fields(
        &self,
        txn: &mut dyn Transaction,
        table: &'static WorkTable,
        fields: WorkFields,
        not_before: Option<DateTime<Utc>>,
    ) -> QueueResult<WorkProposal>;
}

#[async_trait]
impl<Q> Queuer for Arc<Q>
where
    Q: Queuer + ?Sized,
{
    async fn enqueue_fields(
        &self,
        txn: &mut dyn Transaction,
        table: &'static WorkTable,
        fields: WorkFields,
        not_before: Option<DateTime<Utc>>,
    ) -> QueueResult<WorkProposal> {
        (**self)
            .enqueue_fields(txn, table, fields, not_before)
            .await
    }
}

/// Typed enqueue for any [`Queuer`].
#[async_trait]
pub trait QueuerExt: Queuer {
    async fn enqueue<W: WorkItem>(
        &self,
        txn: &mut dyn Transaction,
        item: &W,
        not_before: Option<DateTime<Utc>>,
    ) -> QueueResult<WorkProposal> {
        self.enqueue_fields(txn, W::TABLE, item.to_fields(), not_before)
            .await
    }
}

impl<Q: Queuer + ?Sized> QueuerExt for Q {}

/// Queuer that writes work records into the caller's transaction.
#[derive(Clone)]
pub struct TransactionalQueuer {
    registry: Arc<WorkRegistry>,
    clock: Arc<dyn Clock>,
}

impl TransactionalQueuer {
    pub fn new(registry: Arc<WorkRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { registry, clock }
    }
}

#[async_trait]
impl Queuer for TransactionalQueuer {
    async fn enqueue_fields(
        &self,
        txn: &mut dyn Transaction,
        table: &'static WorkTable,
        fields: WorkFields,
        not_before: Option<DateTime<Utc>>,
    ) -> QueueResult<WorkProposal> {
        if !self.registry.contains(table) {
            return Err(QueueError::schema(format!(
                "unknown work kind {}",
                table.name()
            )));
        }
        table.validate(&fields)?;

        let not_before = not_before.unwrap_or_else(|| self.clock.now());
        let work_id = txn.insert_work(table, not_before, &fields).await?;

        debug!(
            table = table.name(),
            work_id = %work_id,
            not_before = %not_before,
            "work enqueued"
        );

        Ok(WorkProposal::pending(txn, table.name(), work_id, not_before))
    }
}

/// Queuer that records nothing.
#[derive(Clone)]
pub struct NonPerformingQueuer {
    clock: Arc<dyn Clock>,
}

impl NonPerformingQueuer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl std::fmt::Debug for NonPerformingQueuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonPerformingQueuer").finish_non_exhaustive()
    }
}

#[async_trait]
impl Queuer for NonPerformingQueuer {
    async fn enqueue_fields(
        &self,
        _txn: &mut dyn Transaction,
        table: &'static WorkTable,
        _fields: WorkFields,
        not_before: Option<DateTime<Utc>>,
    ) -> QueueResult<WorkProposal> {
        debug!(table = table.name(), "work not scheduled (non-performing queuer)");
        Ok(WorkProposal::unscheduled(
            table.name(),
            not_before.unwrap_or_else(|| self.clock.now()),
        ))
    }
}
