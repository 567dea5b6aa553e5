//! Sync-revision cleanup loop.
//!
//! Two kinds reschedule each other so the cycle survives restarts of every
//! node:
//!
//! ```text
//! Find ─▶ cutoff advanced ─▶ Cleanup (now)
//! Find ─▶ unchanged       ─▶ Find (now + cleanup period)
//! Cleanup ─▶ batch full   ─▶ Cleanup (now)
//! Cleanup ─▶ drained      ─▶ Find (now + cleanup period)
//! ```
//!
//! Sync tokens older than the configured lifetime are no longer honored, so
//! tombstone revisions below the newest revision that predates the lifetime
//! can be removed. The low-water-mark is kept in the `MIN-VALID-REVISION`
//! named value.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use davq_core::{MIN_VALID_REVISION, QueueError, QueueResult, WorkFields, WorkRecord, WorkTable};
use davq_queue::{
    Queuer, QueuerExt, Transaction, WorkContext, WorkItem, WorkProposal, subtransaction,
};

pub static FIND_MIN_VALID_REVISION_WORK: WorkTable =
    WorkTable::new("find_min_valid_revision_work", &[]);

pub static REVISION_CLEANUP_WORK: WorkTable = WorkTable::new("revision_cleanup_work", &[]);

/// Read the stored low-water-mark; zero when none was ever stored.
pub async fn min_valid_revision(txn: &mut dyn Transaction) -> QueueResult<i64> {
    match txn.named_value(MIN_VALID_REVISION).await? {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| {
            QueueError::decode(
                "named_value",
                format!("{MIN_VALID_REVISION} is not a revision: {raw}"),
            )
        }),
    }
}

/// When the next cutoff search is due.
fn next_find(ctx: &WorkContext<'_>) -> QueueResult<DateTime<Utc>> {
    let period = ctx.config().cleanup_period();
    ctx.now()
        .checked_add_signed(period)
        .ok_or_else(|| QueueError::Config(format!("cleanup period {period} overflows the clock")))
}

/// Computes the revision cutoff and starts a cleanup when it moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindMinValidRevisionWork;

#[async_trait]
impl WorkItem for FindMinValidRevisionWork {
    const TABLE: &'static WorkTable = &FIND_MIN_VALID_REVISION_WORK;

    fn from_record(_record: &WorkRecord) -> QueueResult<Self> {
        Ok(Self)
    }

    fn to_fields(&self) -> WorkFields {
        WorkFields::new()
    }

    async fn do_work(&self, ctx: &mut WorkContext<'_>) -> QueueResult<()> {
        // At most one pending instance.
        ctx.txn().delete_pending(&FIND_MIN_VALID_REVISION_WORK).await?;

        // A lifetime reaching past the start of the clock keeps everything.
        let lifetime = ctx.config().sync_token_lifetime();
        let candidate = match ctx.now().checked_sub_signed(lifetime) {
            Some(cutoff) => ctx.txn().latest_revision_before(cutoff).await?,
            None => None,
        };
        let retries = ctx.config().retry_count;

        let advanced = match candidate {
            None => None,
            Some(candidate) => {
                subtransaction(ctx.txn(), retries, move |sub| {
                    Box::pin(async move {
                        let stored = min_valid_revision(sub).await?;
                        if candidate <= stored {
                            return Ok(None);
                        }
                        sub.set_named_value(MIN_VALID_REVISION, &candidate.to_string())
                            .await?;
                        Ok(Some(candidate))
                    })
                })
                .await?
            }
        };

        match advanced {
            Some(revision) => {
                info!(revision, "min valid revision advanced; starting cleanup");
                ctx.enqueue(&RevisionCleanupWork, None).await?;
            }
            None => {
                let next = next_find(ctx)?;
                debug!(next = %next, "min valid revision unchanged");
                ctx.enqueue(&FindMinValidRevisionWork, Some(next)).await?;
            }
        }
        Ok(())
    }
}

/// Deletes tombstone revisions below the low-water-mark, one bounded batch
/// per execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevisionCleanupWork;

#[async_trait]
impl WorkItem for RevisionCleanupWork {
    const TABLE: &'static WorkTable = &REVISION_CLEANUP_WORK;

    fn from_record(_record: &WorkRecord) -> QueueResult<Self> {
        Ok(Self)
    }

    fn to_fields(&self) -> WorkFields {
        WorkFields::new()
    }

    async fn do_work(&self, ctx: &mut WorkContext<'_>) -> QueueResult<()> {
        ctx.txn().delete_pending(&REVISION_CLEANUP_WORK).await?;

        let below = min_valid_revision(ctx.txn()).await?;
        let batch = ctx.config().cleanup_batch_size;
        let deleted = ctx.txn().delete_revisions_before(below, batch).await?;
        info!(below, deleted, "revision cleanup pass");

        if deleted >= u64::from(batch) {
            ctx.enqueue(&RevisionCleanupWork, None).await?;
        } else {
            let next = next_find(ctx)?;
            ctx.enqueue(&FindMinValidRevisionWork, Some(next)).await?;
        }
        Ok(())
    }
}

/// Start the cleanup cycle unless one is already pending.
///
/// Returns `None` when either kind already has a pending record.
pub async fn schedule_revision_cleanup(
    queuer: &dyn Queuer,
    txn: &mut dyn Transaction,
) -> QueueResult<Option<WorkProposal>> {
    let pending = txn.count_pending(&FIND_MIN_VALID_REVISION_WORK).await?
        + txn.count_pending(&REVISION_CLEANUP_WORK).await?;
    if pending > 0 {
        debug!(pending, "revision cleanup already scheduled");
        return Ok(None);
    }

    let proposal = queuer.enqueue(txn, &FindMinValidRevisionWork, None).await?;
    Ok(Some(proposal))
}
