//! Push notification work.
//!
//! Producers enqueue one record per changed resource, usually with a short
//! delay. Records share the `push_id` group column, so a burst of changes to
//! the same resource is delivered as a single notification.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::debug;

use davq_core::{Clock, Column, QueueError, QueueResult, WorkFields, WorkRecord, WorkTable};
use davq_queue::{Queuer, QueuerExt, Transaction, WorkContext, WorkItem, WorkProposal};

use crate::notifier::Notifier;

pub static PUSH_NOTIFICATION_WORK: WorkTable =
    WorkTable::new("push_notification_work", &[Column::text("push_id")]).grouped_by("push_id");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotificationWork {
    pub push_id: String,
}

impl PushNotificationWork {
    pub fn new(push_id: impl Into<String>) -> Self {
        Self {
            push_id: push_id.into(),
        }
    }
}

#[async_trait]
impl WorkItem for PushNotificationWork {
    const TABLE: &'static WorkTable = &PUSH_NOTIFICATION_WORK;

    fn from_record(record: &WorkRecord) -> QueueResult<Self> {
        Ok(Self::new(record.text(&PUSH_NOTIFICATION_WORK, "push_id")?))
    }

    fn to_fields(&self) -> WorkFields {
        WorkFields::new().with("push_id", self.push_id.as_str())
    }

    async fn do_work(&self, ctx: &mut WorkContext<'_>) -> QueueResult<()> {
        match ctx.service::<Arc<dyn Notifier>>() {
            Some(notifier) => notifier.enqueue(&self.push_id).await,
            None => {
                debug!(push_id = %self.push_id, "no notifier installed; dropping push");
                Ok(())
            }
        }
    }
}

/// Schedule a push for `push_id`, `delay` from now, inside `txn`.
pub async fn notify_changed(
    queuer: &dyn Queuer,
    clock: &dyn Clock,
    txn: &mut dyn Transaction,
    push_id: &str,
    delay: Duration,
) -> QueueResult<WorkProposal> {
    let not_before = if delay > Duration::zero() {
        let at = clock.now().checked_add_signed(delay).ok_or_else(|| {
            QueueError::work(format!("push delay {delay} overflows the clock"))
        })?;
        Some(at)
    } else {
        None
    };
    queuer
        .enqueue(txn, &PushNotificationWork::new(push_id), not_before)
        .await
}
