//! Maintenance and push work driven through the dispatcher over the
//! in-memory database, with time advanced by hand.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Duration;

use davq_core::{Clock, MIN_VALID_REVISION, ManualClock, QueueConfig, QueueError, QueueResult};
use davq_infra::{DispatchOutcome, WorkDispatcher};
use davq_queue::{
    Database, InMemoryDatabase, InMemoryLockCache, LockCache, Services, SyncRevision, Transaction,
    WorkContext, WorkItem,
};
use davq_work::group_cacher::{GROUP_CACHER_POLLING_WORK, GroupCacherPollingWork};
use davq_work::push::PUSH_NOTIFICATION_WORK;
use davq_work::revision_cleanup::{FIND_MIN_VALID_REVISION_WORK, REVISION_CLEANUP_WORK};
use davq_work::{
    GroupCacher, Notifier, RecordingNotifier, notify_changed, registry, schedule_group_cacher,
    schedule_revision_cleanup,
};

struct Node {
    db: InMemoryDatabase,
    clock: ManualClock,
    dispatcher: WorkDispatcher,
}

fn node(config: QueueConfig, services: Services) -> Node {
    let registry = registry();
    let db = InMemoryDatabase::with_tables(registry.tables());
    let clock = ManualClock::default();
    let dispatcher = WorkDispatcher::new(
        Arc::new(db.clone()),
        Arc::new(registry),
        Arc::new(clock.clone()),
        config,
    )
    .with_services(services);
    Node {
        db,
        clock,
        dispatcher,
    }
}

impl Node {
    async fn seed_revisions(&self, revisions: &[(i64, bool, i64)]) {
        let mut txn = self.db.begin().await.unwrap();
        for &(revision, deleted, age_days) in revisions {
            txn.record_revision(&SyncRevision {
                resource_id: 1,
                name: format!("event-{revision}.ics"),
                revision,
                deleted,
                modified: self.clock.now() - Duration::days(age_days),
            })
            .await
            .unwrap();
        }
        txn.commit().await.unwrap();
    }

    async fn schedule_cleanup(&self) {
        let mut txn = self.db.begin().await.unwrap();
        let queuer = self.dispatcher.queuer();
        schedule_revision_cleanup(&*queuer, &mut *txn).await.unwrap();
        txn.commit().await.unwrap();
    }

    fn pending(&self) -> (usize, usize) {
        (
            self.db.committed_work(&FIND_MIN_VALID_REVISION_WORK).len(),
            self.db.committed_work(&REVISION_CLEANUP_WORK).len(),
        )
    }

    fn revisions(&self) -> Vec<i64> {
        self.db
            .current_revisions()
            .iter()
            .map(|r| r.revision)
            .collect()
    }
}

#[tokio::test]
async fn cleanup_cycle_runs_once_and_resumes_finding() {
    let node = node(QueueConfig::default(), Services::new());
    // Tombstones 1..=4 and a live revision 5 past the 14 day lifetime;
    // revision 6 is recent.
    node.seed_revisions(&[
        (1, true, 30),
        (2, true, 30),
        (3, true, 20),
        (4, true, 20),
        (5, false, 15),
        (6, true, 1),
    ])
    .await;
    node.schedule_cleanup().await;
    assert_eq!(node.pending(), (1, 0));

    let outcomes = node.dispatcher.run_until_idle(10).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(node.db.current_value(MIN_VALID_REVISION).as_deref(), Some("5"));
    assert_eq!(node.revisions(), vec![5, 6]);

    // Next find is a cleanup period away.
    assert_eq!(node.pending(), (1, 0));
    let next = &node.db.committed_work(&FIND_MIN_VALID_REVISION_WORK)[0];
    assert_eq!(next.not_before, node.clock.now() + Duration::days(1));
    assert!(node.dispatcher.run_until_idle(10).await.unwrap().is_empty());

    // Nothing new aged out: find reschedules itself, no cleanup.
    node.clock.advance(Duration::days(1));
    let outcomes = node.dispatcher.run_until_idle(10).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(node.pending(), (1, 0));
    assert_eq!(node.db.current_value(MIN_VALID_REVISION).as_deref(), Some("5"));
}

#[tokio::test]
async fn full_batches_chain_cleanup_work() {
    let config = QueueConfig {
        cleanup_batch_size: 2,
        ..QueueConfig::default()
    };
    let node = node(config, Services::new());
    node.seed_revisions(&[
        (1, true, 30),
        (2, true, 30),
        (3, true, 30),
        (4, true, 30),
        (5, true, 30),
        (6, true, 30),
    ])
    .await;
    node.schedule_cleanup().await;

    let outcomes = node.dispatcher.run_until_idle(10).await.unwrap();
    let cleanups = outcomes
        .iter()
        .filter(|o| {
            matches!(
                o,
                DispatchOutcome::Completed {
                    table: "revision_cleanup_work",
                    ..
                }
            )
        })
        .count();

    // 5 tombstones below 6, two per pass: 2 + 2 + 1.
    assert_eq!(cleanups, 3);
    assert_eq!(node.revisions(), vec![6]);
    assert_eq!(node.pending(), (1, 0));
}

#[tokio::test]
async fn lifetime_past_the_start_of_the_clock_keeps_every_revision() {
    let config = QueueConfig {
        sync_token_lifetime_days: u32::MAX,
        ..QueueConfig::default()
    };
    let node = node(config, Services::new());
    node.seed_revisions(&[(1, true, 30), (2, true, 20)]).await;
    node.schedule_cleanup().await;

    let outcomes = node.dispatcher.run_until_idle(10).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_completed());
    assert_eq!(node.revisions(), vec![1, 2]);
    assert_eq!(node.db.current_value(MIN_VALID_REVISION), None);
    assert_eq!(node.pending(), (1, 0));
}

#[tokio::test]
async fn unrepresentable_cleanup_period_fails_the_record() {
    let config = QueueConfig {
        cleanup_period_days: u32::MAX,
        ..QueueConfig::default()
    };
    let node = node(config, Services::new());
    node.seed_revisions(&[(1, true, 1)]).await;
    node.schedule_cleanup().await;

    let outcome = node
        .dispatcher
        .dispatch_one(&FIND_MIN_VALID_REVISION_WORK)
        .await
        .unwrap();
    match outcome {
        DispatchOutcome::Failed {
            error: QueueError::Config(message),
            ..
        } => assert!(message.contains("cleanup period")),
        other => panic!("expected a config failure, got {other:?}"),
    }

    // The record survives for the next attempt.
    assert_eq!(node.pending(), (1, 0));
    assert_eq!(node.revisions(), vec![1]);
}

#[tokio::test]
async fn scheduling_twice_keeps_one_record() {
    let node = node(QueueConfig::default(), Services::new());
    node.schedule_cleanup().await;
    node.schedule_cleanup().await;
    assert_eq!(node.pending(), (1, 0));

    let mut txn = node.db.begin().await.unwrap();
    let queuer = node.dispatcher.queuer();
    assert!(
        schedule_revision_cleanup(&*queuer, &mut *txn)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn pushes_for_one_resource_are_coalesced() {
    let notifier = Arc::new(RecordingNotifier::new());
    let services = Services::new().with::<Arc<dyn Notifier>>(notifier.clone());
    let node = node(QueueConfig::default(), services);

    let mut txn = node.db.begin().await.unwrap();
    let queuer = node.dispatcher.queuer();
    for id in ["/calendars/a/", "/calendars/a/", "/calendars/b/", "/calendars/a/"] {
        notify_changed(&*queuer, &node.clock, &mut *txn, id, Duration::seconds(3))
            .await
            .unwrap();
    }
    txn.commit().await.unwrap();

    assert!(node.dispatcher.run_until_idle(10).await.unwrap().is_empty());
    assert!(notifier.notified().is_empty());

    node.clock.advance(Duration::seconds(3));
    node.dispatcher.run_until_idle(10).await.unwrap();

    assert_eq!(notifier.notified(), vec!["/calendars/a/", "/calendars/b/"]);
    assert!(node.db.committed_work(&PUSH_NOTIFICATION_WORK).is_empty());
    assert_eq!(node.dispatcher.stats().coalesced, 2);
}

#[tokio::test]
async fn failed_push_delivery_is_retried() {
    struct Flaky {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Notifier for Flaky {
        async fn enqueue(&self, _id: &str) -> QueueResult<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(QueueError::work("push service unavailable"));
            }
            Ok(())
        }
    }

    let flaky = Arc::new(Flaky {
        calls: AtomicU32::new(0),
    });
    let services = Services::new().with::<Arc<dyn Notifier>>(flaky.clone());
    let node = node(QueueConfig::default(), services);

    let mut txn = node.db.begin().await.unwrap();
    let queuer = node.dispatcher.queuer();
    notify_changed(&*queuer, &node.clock, &mut *txn, "a", Duration::zero())
        .await
        .unwrap();
    txn.commit().await.unwrap();

    let first = node.dispatcher.dispatch_one(&PUSH_NOTIFICATION_WORK).await.unwrap();
    assert!(!first.is_completed());
    assert_eq!(node.db.committed_work(&PUSH_NOTIFICATION_WORK).len(), 1);

    let second = node.dispatcher.dispatch_one(&PUSH_NOTIFICATION_WORK).await.unwrap();
    assert!(second.is_completed());
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
}

/// Writes a marker, then fails when told to.
struct MarkingCacher {
    updates: AtomicU32,
    fail: bool,
}

#[async_trait]
impl GroupCacher for MarkingCacher {
    async fn update(&self, txn: &mut dyn Transaction) -> QueueResult<()> {
        let n = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
        txn.set_named_value("group-cacher-marker", &n.to_string())
            .await?;
        if self.fail {
            return Err(QueueError::work("directory unreachable"));
        }
        Ok(())
    }
}

async fn schedule_cacher(node: &Node) {
    let mut txn = node.db.begin().await.unwrap();
    let queuer = node.dispatcher.queuer();
    schedule_group_cacher(&*queuer, &mut *txn).await.unwrap();
    txn.commit().await.unwrap();
}

#[tokio::test]
async fn group_cacher_polls_on_its_interval() {
    let cacher = Arc::new(MarkingCacher {
        updates: AtomicU32::new(0),
        fail: false,
    });
    let services = Services::new().with::<Arc<dyn GroupCacher>>(cacher.clone());
    let node = node(QueueConfig::default(), services);
    schedule_cacher(&node).await;

    node.dispatcher.run_until_idle(10).await.unwrap();
    assert_eq!(cacher.updates.load(Ordering::SeqCst), 1);
    assert_eq!(
        node.db.current_value("group-cacher-marker").as_deref(),
        Some("1")
    );

    let pending = node.db.committed_work(&GROUP_CACHER_POLLING_WORK);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].not_before, node.clock.now() + Duration::seconds(300));

    node.clock.advance(Duration::seconds(300));
    node.dispatcher.run_until_idle(10).await.unwrap();
    assert_eq!(cacher.updates.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failing_group_cacher_is_rolled_back_and_rescheduled() {
    let cacher = Arc::new(MarkingCacher {
        updates: AtomicU32::new(0),
        fail: true,
    });
    let services = Services::new().with::<Arc<dyn GroupCacher>>(cacher.clone());
    let node = node(QueueConfig::default(), services);
    schedule_cacher(&node).await;

    let outcomes = node.dispatcher.run_until_idle(10).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_completed());
    assert_eq!(cacher.updates.load(Ordering::SeqCst), 1);
    assert_eq!(node.db.current_value("group-cacher-marker"), None);
    assert_eq!(node.db.committed_work(&GROUP_CACHER_POLLING_WORK).len(), 1);
}

#[tokio::test]
async fn group_cacher_without_collaborator_polls_every_ten_seconds() {
    let node = node(QueueConfig::default(), Services::new());
    schedule_cacher(&node).await;
    schedule_cacher(&node).await;
    assert_eq!(node.db.committed_work(&GROUP_CACHER_POLLING_WORK).len(), 1);

    node.dispatcher.run_until_idle(10).await.unwrap();
    let pending = node.db.committed_work(&GROUP_CACHER_POLLING_WORK);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].not_before, node.clock.now() + Duration::seconds(10));
}

#[tokio::test]
async fn group_cacher_skips_while_another_node_holds_the_lock() {
    let cacher = Arc::new(MarkingCacher {
        updates: AtomicU32::new(0),
        fail: false,
    });
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let locks: Arc<dyn LockCache> = Arc::new(InMemoryLockCache::new(clock));
    assert!(locks.add("GroupCacher:update", None).await.unwrap());

    let services = Services::new()
        .with::<Arc<dyn GroupCacher>>(cacher.clone())
        .with(Arc::clone(&locks));
    let node = node(QueueConfig::default(), services);
    schedule_cacher(&node).await;

    node.dispatcher.run_until_idle(10).await.unwrap();
    assert_eq!(cacher.updates.load(Ordering::SeqCst), 0);
    assert_eq!(node.db.committed_work(&GROUP_CACHER_POLLING_WORK).len(), 1);

    locks.delete("GroupCacher:update").await.unwrap();
    node.clock.advance(Duration::seconds(300));
    node.dispatcher.run_until_idle(10).await.unwrap();
    assert_eq!(cacher.updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn group_cacher_lock_outlives_the_update_until_commit() {
    let cacher = Arc::new(MarkingCacher {
        updates: AtomicU32::new(0),
        fail: false,
    });
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let cache = Arc::new(InMemoryLockCache::new(clock));
    let locks: Arc<dyn LockCache> = cache.clone();
    let services = || {
        Services::new()
            .with::<Arc<dyn GroupCacher>>(cacher.clone())
            .with(Arc::clone(&locks))
    };
    let node = node(QueueConfig::default(), services());
    schedule_cacher(&node).await;

    let mut txn = node.db.begin().await.unwrap();
    let record = txn
        .claim_next(&GROUP_CACHER_POLLING_WORK, node.clock.now())
        .await
        .unwrap()
        .unwrap();
    let queuer = node.dispatcher.queuer();
    let config = QueueConfig::default();
    let ctx_services = services();
    {
        let mut ctx = WorkContext::new(
            &mut *txn,
            &record,
            &*queuer,
            &node.clock,
            &config,
            &ctx_services,
        );
        GroupCacherPollingWork.do_work(&mut ctx).await.unwrap();
    }

    // Another node cannot start an update while this one is uncommitted.
    assert_eq!(cacher.updates.load(Ordering::SeqCst), 1);
    assert!(cache.contains("GroupCacher:update"));
    assert!(!locks.add("GroupCacher:update", None).await.unwrap());

    txn.commit().await.unwrap();
    assert!(!cache.contains("GroupCacher:update"));
    assert_eq!(
        node.db.current_value("group-cacher-marker").as_deref(),
        Some("1")
    );
}
