//! Periodic group membership cache refresh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use davq_core::{QueueError, QueueResult, WorkFields, WorkRecord, WorkTable};
use davq_queue::{
    DistributedLock, LockCache, Queuer, QueuerExt, Transaction, WorkContext, WorkItem,
    WorkProposal, subtransaction,
};

pub static GROUP_CACHER_POLLING_WORK: WorkTable = WorkTable::new("group_cacher_polling_work", &[]);

/// Interval used when no cacher is installed.
pub const UNCONFIGURED_INTERVAL: Duration = Duration::from_secs(10);

const LOCK_NAMESPACE: &str = "GroupCacher";

/// Refreshes cached group memberships.
///
/// Installed into the dispatcher's services as `Arc<dyn GroupCacher>`.
#[async_trait]
pub trait GroupCacher: Send + Sync {
    async fn update(&self, txn: &mut dyn Transaction) -> QueueResult<()>;
}

/// Self-rescheduling refresh of the group cacher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupCacherPollingWork;

impl GroupCacherPollingWork {
    /// Run the cacher in a savepoint so a failed update leaves nothing
    /// behind. A lock held by another node skips this round; a lock taken
    /// here is kept until the claiming transaction finishes.
    async fn refresh(cacher: Arc<dyn GroupCacher>, ctx: &mut WorkContext<'_>) -> QueueResult<()> {
        if let Some(cache) = ctx.service::<Arc<dyn LockCache>>() {
            let mut lock =
                DistributedLock::from_config(cache, LOCK_NAMESPACE, "update", ctx.config())
                    .timeout(Duration::ZERO);
            if !lock.acquire().await? {
                debug!(key = lock.key(), "group cacher busy elsewhere; skipping");
                return Ok(());
            }
            lock.clean_on_finish(ctx.txn());
        }

        subtransaction(ctx.txn(), 0, move |sub| {
            let cacher = Arc::clone(&cacher);
            Box::pin(async move { cacher.update(sub).await })
        })
        .await
    }
}

#[async_trait]
impl WorkItem for GroupCacherPollingWork {
    const TABLE: &'static WorkTable = &GROUP_CACHER_POLLING_WORK;

    fn from_record(_record: &WorkRecord) -> QueueResult<Self> {
        Ok(Self)
    }

    fn to_fields(&self) -> WorkFields {
        WorkFields::new()
    }

    async fn do_work(&self, ctx: &mut WorkContext<'_>) -> QueueResult<()> {
        ctx.txn().delete_pending(&GROUP_CACHER_POLLING_WORK).await?;

        let interval = match ctx.service::<Arc<dyn GroupCacher>>() {
            Some(cacher) => {
                if let Err(e) = Self::refresh(cacher, ctx).await {
                    error!(error = %e, "failed to update group membership cache");
                }
                ctx.config().group_cacher_update
            }
            None => UNCONFIGURED_INTERVAL,
        };

        let next = chrono::Duration::from_std(interval)
            .ok()
            .and_then(|interval| ctx.now().checked_add_signed(interval))
            .ok_or_else(|| {
                QueueError::Config(format!("group cacher interval {interval:?} overflows the clock"))
            })?;
        ctx.enqueue(&GroupCacherPollingWork, Some(next)).await?;
        Ok(())
    }
}

/// Start the polling cycle unless an instance is already pending.
pub async fn schedule_group_cacher(
    queuer: &dyn Queuer,
    txn: &mut dyn Transaction,
) -> QueueResult<Option<WorkProposal>> {
    if txn.count_pending(&GROUP_CACHER_POLLING_WORK).await? > 0 {
        return Ok(None);
    }
    let proposal = queuer.enqueue(txn, &GroupCacherPollingWork, None).await?;
    Ok(Some(proposal))
}
