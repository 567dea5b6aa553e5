//! Work dispatcher.
//!
//! One dispatch cycle, per work kind:
//!
//! ```text
//! Idle ─▶ Claiming ─▶ Coalescing ─▶ Executing ─▶ Committing ─▶ Idle
//!             │                          │             │
//!             └─ nothing eligible        └── error ────┴─▶ Failed ─▶ Idle
//! ```
//!
//! - **Claiming** opens a transaction and claims the oldest eligible record
//!   (`not_before <= now`) that no other transaction holds.
//! - **Coalescing** deletes every other pending record of the kind sharing
//!   the claimed record's group value, in the same transaction.
//! - **Executing** runs the kind's work function against the open
//!   transaction.
//! - **Committing** commits. If the work function fails (or the commit does)
//!   the transaction is aborted: the claimed record and any coalesced
//!   siblings come back, so execution is at-least-once.
//!
//! Correctness across nodes relies only on the database's row locking.

mod runner;

pub use runner::DispatcherHandle;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};

use davq_core::{Clock, QueueConfig, QueueError, QueueResult, WorkId, WorkTable};
use davq_queue::{
    Database, Queuer, QueuerExt, Services, TransactionalQueuer, WorkContext, WorkItem,
    WorkProposal, WorkRegistry,
};

/// Result of one dispatch cycle.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Nothing eligible (or everything eligible is held by other nodes).
    Idle,
    Completed {
        table: &'static str,
        work_id: WorkId,
        /// Pending siblings discarded by coalescing.
        coalesced: u64,
    },
    /// The work function or the commit failed; the record survives.
    Failed {
        table: &'static str,
        work_id: WorkId,
        error: QueueError,
    },
}

impl DispatchOutcome {
    pub fn is_idle(&self) -> bool {
        matches!(self, DispatchOutcome::Idle)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DispatchOutcome::Completed { .. })
    }
}

/// Dispatcher runtime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub coalesced: u64,
    pub polling_errors: u64,
}

/// Claims and executes work for every registered kind.
pub struct WorkDispatcher {
    database: Arc<dyn Database>,
    registry: Arc<WorkRegistry>,
    queuer: Arc<dyn Queuer>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    services: Arc<Services>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl WorkDispatcher {
    pub fn new(
        database: Arc<dyn Database>,
        registry: Arc<WorkRegistry>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        let queuer = Arc::new(TransactionalQueuer::new(
            Arc::clone(&registry),
            Arc::clone(&clock),
        ));
        Self {
            database,
            registry,
            queuer,
            clock,
            config,
            services: Arc::new(Services::new()),
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        }
    }

    /// Collaborators made available to work functions.
    pub fn with_services(mut self, services: Services) -> Self {
        self.services = Arc::new(services);
        self
    }

    /// Queuer used for follow-up work enqueued by work functions.
    pub fn with_queuer(mut self, queuer: Arc<dyn Queuer>) -> Self {
        self.queuer = queuer;
        self
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    pub fn registry(&self) -> &Arc<WorkRegistry> {
        &self.registry
    }

    pub fn queuer(&self) -> Arc<dyn Queuer> {
        Arc::clone(&self.queuer)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Enqueue `item` in a transaction of its own.
    pub async fn enqueue<W: WorkItem>(
        &self,
        item: &W,
        not_before: Option<DateTime<Utc>>,
    ) -> QueueResult<WorkProposal> {
        let mut txn = self.database.begin().await?;
        let proposal = self.queuer.enqueue(&mut *txn, item, not_before).await?;
        txn.commit().await?;
        Ok(proposal)
    }

    /// Run one Claiming → Coalescing → Executing → Committing cycle for
    /// `table`.
    ///
    /// Work failures are reported as [`DispatchOutcome::Failed`]; `Err` means
    /// the claim itself could not be made (unknown kind, storage failure).
    pub async fn dispatch_one(&self, table: &'static WorkTable) -> QueueResult<DispatchOutcome> {
        let handler = self.registry.handler(table.name())?;

        let mut txn = self.database.begin().await?;
        let Some(record) = txn.claim_next(table, self.clock.now()).await? else {
            txn.abort().await?;
            return Ok(DispatchOutcome::Idle);
        };

        debug!(table = table.name(), work_id = %record.id, "claimed work");
        self.record(|s| s.claimed += 1);

        let coalesced = match record.group_key(table) {
            Some(key) => txn.delete_group(table, key).await?,
            None => 0,
        };
        if coalesced > 0 {
            debug!(
                table = table.name(),
                work_id = %record.id,
                coalesced,
                "discarded redundant work"
            );
        }

        let result = {
            let mut ctx = WorkContext::new(
                &mut *txn,
                &record,
                &*self.queuer,
                &*self.clock,
                &self.config,
                &self.services,
            );
            handler.perform(&mut ctx).await
        };

        let result = match result {
            Ok(()) => txn.commit().await,
            Err(error) => {
                if let Err(abort_error) = txn.abort().await {
                    warn!(
                        table = table.name(),
                        work_id = %record.id,
                        error = %abort_error,
                        "abort after failed work also failed"
                    );
                }
                Err(error)
            }
        };

        match result {
            Ok(()) => {
                debug!(table = table.name(), work_id = %record.id, "work completed");
                self.record(|s| {
                    s.succeeded += 1;
                    s.coalesced += coalesced;
                });
                Ok(DispatchOutcome::Completed {
                    table: table.name(),
                    work_id: record.id,
                    coalesced,
                })
            }
            Err(error) => {
                error!(
                    table = table.name(),
                    work_id = %record.id,
                    error = %error,
                    "work failed; record left for retry"
                );
                self.record(|s| s.failed += 1);
                Ok(DispatchOutcome::Failed {
                    table: table.name(),
                    work_id: record.id,
                    error,
                })
            }
        }
    }

    /// Dispatch every registered kind until a full pass completes nothing,
    /// or `max_passes` passes have run. Returns the non-idle outcomes.
    ///
    /// Records that keep failing do not keep the loop alive.
    pub async fn run_until_idle(&self, max_passes: usize) -> QueueResult<Vec<DispatchOutcome>> {
        let tables = self.registry.tables();
        let mut outcomes = Vec::new();

        for _ in 0..max_passes {
            let mut progressed = false;
            for &table in &tables {
                loop {
                    let outcome = self.dispatch_one(table).await?;
                    match outcome {
                        DispatchOutcome::Idle => break,
                        DispatchOutcome::Completed { .. } => {
                            progressed = true;
                            outcomes.push(outcome);
                        }
                        DispatchOutcome::Failed { .. } => {
                            outcomes.push(outcome);
                            break;
                        }
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        Ok(outcomes)
    }

    fn record(&self, update: impl FnOnce(&mut DispatcherStats)) {
        update(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

impl std::fmt::Debug for WorkDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkDispatcher")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}
