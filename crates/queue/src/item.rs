//! Work kinds.
//!
//! A work kind is a type implementing [`WorkItem`]: it names its table,
//! converts itself to and from the table's payload columns, and performs its
//! work inside the transaction that claimed the record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use davq_core::{Clock, QueueConfig, QueueResult, WorkFields, WorkId, WorkRecord, WorkTable};

use crate::queuer::{Queuer, WorkProposal};
use crate::services::Services;
use crate::transaction::Transaction;

#[async_trait]
pub trait WorkItem: Send + Sync + Sized + 'static {
    /// The table backing this kind.
    const TABLE: &'static WorkTable;

    /// Rebuild the item from a claimed record's payload.
    fn from_record(record: &WorkRecord) -> QueueResult<Self>;

    /// Payload columns to store when enqueuing.
    fn to_fields(&self) -> WorkFields;

    /// Perform the work. Returning an error aborts the claiming transaction
    /// and leaves the record in place for a later attempt.
    async fn do_work(&self, ctx: &mut WorkContext<'_>) -> QueueResult<()>;
}

/// Everything a work function can reach while it runs.
pub struct WorkContext<'a> {
    txn: &'a mut dyn Transaction,
    record: &'a WorkRecord,
    queuer: &'a dyn Queuer,
    clock: &'a dyn Clock,
    config: &'a QueueConfig,
    services: &'a Services,
}

impl<'a> WorkContext<'a> {
    pub fn new(
        txn: &'a mut dyn Transaction,
        record: &'a WorkRecord,
        queuer: &'a dyn Queuer,
        clock: &'a dyn Clock,
        config: &'a QueueConfig,
        services: &'a Services,
    ) -> Self {
        Self {
            txn,
            record,
            queuer,
            clock,
            config,
            services,
        }
    }

    /// The transaction that claimed the record.
    pub fn txn(&mut self) -> &mut dyn Transaction {
        &mut *self.txn
    }

    pub fn record(&self) -> &WorkRecord {
        self.record
    }

    pub fn work_id(&self) -> WorkId {
        self.record.id
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> &QueueConfig {
        self.config
    }

    pub fn services(&self) -> &Services {
        self.services
    }

    /// Look up a collaborator by its handle type.
    pub fn service<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.services.get::<T>()
    }

    /// Enqueue follow-up work in the same transaction.
    pub async fn enqueue<W: WorkItem>(
        &mut self,
        item: &W,
        not_before: Option<DateTime<Utc>>,
    ) -> QueueResult<WorkProposal> {
        self.queuer
            .enqueue_fields(&mut *self.txn, W::TABLE, item.to_fields(), not_before)
            .await
    }
}
