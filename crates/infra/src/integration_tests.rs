//! Integration tests for the dispatch pipeline.
//!
//! Tests: enqueue → WorkDispatcher (claim, coalesce, execute, commit) → database
//!
//! Verifies:
//! - Failed work survives and is retried (at-least-once)
//! - A record is never claimed twice
//! - Redundant records sharing a group value are discarded
//! - `not_before` delays eligibility
//! - Background loops run work, back off on storage errors, and stop cleanly

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use davq_core::{
        Clock, Column, ManualClock, QueueConfig, QueueError, QueueResult, WorkFields, WorkRecord,
        WorkTable,
    };
    use davq_queue::{
        Database, InMemoryDatabase, NonPerformingQueuer, Services, WorkContext, WorkItem,
        WorkRegistry,
    };

    use crate::dispatch::{DispatchOutcome, WorkDispatcher};

    static TOUCH: WorkTable = WorkTable::new(
        "touch_work",
        &[Column::text("target"), Column::integer("seq")],
    )
    .grouped_by("target");

    static CHAIN: WorkTable = WorkTable::new("chain_work", &[Column::integer("remaining")]);

    static ORPHAN: WorkTable = WorkTable::new("orphan_work", &[]);

    /// Records executions and injects failures.
    #[derive(Default)]
    struct Journal {
        runs: Mutex<Vec<String>>,
        failures: Mutex<HashMap<String, u32>>,
    }

    impl Journal {
        fn fail_next(&self, target: &str, times: u32) {
            self.failures
                .lock()
                .unwrap()
                .insert(target.to_string(), times);
        }

        fn should_fail(&self, target: &str) -> bool {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(target) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        }

        fn record(&self, entry: String) {
            self.runs.lock().unwrap().push(entry);
        }

        fn runs(&self) -> Vec<String> {
            self.runs.lock().unwrap().clone()
        }
    }

    fn journal(ctx: &WorkContext<'_>) -> QueueResult<Arc<Journal>> {
        ctx.service::<Arc<Journal>>()
            .ok_or_else(|| QueueError::work("journal not installed"))
    }

    struct Touch {
        target: String,
        seq: i64,
    }

    impl Touch {
        fn new(target: &str, seq: i64) -> Self {
            Self {
                target: target.to_string(),
                seq,
            }
        }
    }

    #[async_trait]
    impl WorkItem for Touch {
        const TABLE: &'static WorkTable = &TOUCH;

        fn from_record(record: &WorkRecord) -> QueueResult<Self> {
            Ok(Self {
                target: record.text(&TOUCH, "target")?.to_string(),
                seq: record.integer(&TOUCH, "seq")?,
            })
        }

        fn to_fields(&self) -> WorkFields {
            WorkFields::new()
                .with("target", self.target.as_str())
                .with("seq", self.seq)
        }

        async fn do_work(&self, ctx: &mut WorkContext<'_>) -> QueueResult<()> {
            let journal = journal(ctx)?;
            if journal.should_fail(&self.target) {
                return Err(QueueError::work(format!("{} is flaky", self.target)));
            }
            journal.record(format!("{}#{}", self.target, self.seq));
            Ok(())
        }
    }

    struct Chain {
        remaining: i64,
    }

    #[async_trait]
    impl WorkItem for Chain {
        const TABLE: &'static WorkTable = &CHAIN;

        fn from_record(record: &WorkRecord) -> QueueResult<Self> {
            Ok(Self {
                remaining: record.integer(&CHAIN, "remaining")?,
            })
        }

        fn to_fields(&self) -> WorkFields {
            WorkFields::new().with("remaining", self.remaining)
        }

        async fn do_work(&self, ctx: &mut WorkContext<'_>) -> QueueResult<()> {
            journal(ctx)?.record(format!("chain {}", self.remaining));
            if self.remaining > 0 {
                let next = Chain {
                    remaining: self.remaining - 1,
                };
                ctx.enqueue(&next, None).await?;
            }
            Ok(())
        }
    }

    struct Harness {
        db: InMemoryDatabase,
        clock: ManualClock,
        journal: Arc<Journal>,
        dispatcher: Arc<WorkDispatcher>,
    }

    fn harness() -> Harness {
        harness_with(|d| d)
    }

    fn harness_with(customize: impl FnOnce(WorkDispatcher) -> WorkDispatcher) -> Harness {
        let db = InMemoryDatabase::with_tables([&TOUCH, &CHAIN, &ORPHAN]);
        let clock = ManualClock::default();
        let journal = Arc::new(Journal::default());
        let registry = Arc::new(WorkRegistry::new().with::<Touch>().with::<Chain>());

        let dispatcher = WorkDispatcher::new(
            Arc::new(db.clone()),
            registry,
            Arc::new(clock.clone()),
            QueueConfig::default(),
        )
        .with_services(Services::new().with(Arc::clone(&journal)));

        Harness {
            db,
            clock,
            journal,
            dispatcher: Arc::new(customize(dispatcher)),
        }
    }

    #[tokio::test]
    async fn failed_work_is_retried_until_it_succeeds() {
        let h = harness();
        h.journal.fail_next("a", 1);
        h.dispatcher.enqueue(&Touch::new("a", 1), None).await.unwrap();

        let first = h.dispatcher.dispatch_one(&TOUCH).await.unwrap();
        assert!(matches!(first, DispatchOutcome::Failed { .. }));
        assert_eq!(h.db.committed_work(&TOUCH).len(), 1);
        assert!(h.journal.runs().is_empty());

        let second = h.dispatcher.dispatch_one(&TOUCH).await.unwrap();
        assert!(second.is_completed());
        assert!(h.db.committed_work(&TOUCH).is_empty());
        assert_eq!(h.journal.runs(), vec!["a#1"]);

        let stats = h.dispatcher.stats();
        assert_eq!(stats.claimed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test]
    async fn redundant_work_is_coalesced() {
        let h = harness();
        for seq in 1..=3 {
            h.dispatcher.enqueue(&Touch::new("x", seq), None).await.unwrap();
        }
        h.dispatcher.enqueue(&Touch::new("y", 4), None).await.unwrap();

        match h.dispatcher.dispatch_one(&TOUCH).await.unwrap() {
            DispatchOutcome::Completed { coalesced, .. } => assert_eq!(coalesced, 2),
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(h.dispatcher.dispatch_one(&TOUCH).await.unwrap().is_completed());
        assert!(h.dispatcher.dispatch_one(&TOUCH).await.unwrap().is_idle());

        assert_eq!(h.journal.runs(), vec!["x#1", "y#4"]);
        assert!(h.db.committed_work(&TOUCH).is_empty());
        assert_eq!(h.dispatcher.stats().coalesced, 2);
    }

    #[tokio::test]
    async fn coalesced_siblings_return_when_work_fails() {
        let h = harness();
        h.journal.fail_next("x", 1);
        for seq in 1..=3 {
            h.dispatcher.enqueue(&Touch::new("x", seq), None).await.unwrap();
        }

        let outcome = h.dispatcher.dispatch_one(&TOUCH).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
        assert_eq!(h.db.committed_work(&TOUCH).len(), 3);

        let outcome = h.dispatcher.dispatch_one(&TOUCH).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(h.journal.runs(), vec!["x#1"]);
        assert!(h.db.committed_work(&TOUCH).is_empty());
    }

    #[tokio::test]
    async fn not_before_delays_eligibility() {
        let h = harness();
        let at = h.clock.now() + chrono::Duration::seconds(60);
        h.dispatcher
            .enqueue(&Touch::new("later", 1), Some(at))
            .await
            .unwrap();

        assert!(h.dispatcher.dispatch_one(&TOUCH).await.unwrap().is_idle());
        h.clock.advance(chrono::Duration::seconds(59));
        assert!(h.dispatcher.dispatch_one(&TOUCH).await.unwrap().is_idle());
        h.clock.advance(chrono::Duration::seconds(1));
        assert!(h.dispatcher.dispatch_one(&TOUCH).await.unwrap().is_completed());
    }

    #[tokio::test]
    async fn racing_transactions_claim_a_record_once() {
        let h = harness();
        h.dispatcher.enqueue(&Touch::new("solo", 1), None).await.unwrap();

        let mut txns = Vec::new();
        let mut claimed = 0;
        for _ in 0..8 {
            let mut txn = h.db.begin().await.unwrap();
            if txn.claim_next(&TOUCH, h.clock.now()).await.unwrap().is_some() {
                claimed += 1;
            }
            txns.push(txn);
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispatchers_execute_each_record_once() {
        let h = harness();
        for seq in 0..20 {
            h.dispatcher
                .enqueue(&Touch::new(&format!("t{seq}"), seq), None)
                .await
                .unwrap();
        }

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = Arc::clone(&h.dispatcher);
                tokio::spawn(async move {
                    let mut done = 0;
                    while dispatcher.dispatch_one(&TOUCH).await.unwrap().is_completed() {
                        done += 1;
                    }
                    done
                })
            })
            .collect();

        let mut total = 0;
        for worker in workers {
            total += worker.await.unwrap();
        }

        assert_eq!(total, 20);
        let mut runs = h.journal.runs();
        runs.sort();
        runs.dedup();
        assert_eq!(runs.len(), 20);
    }

    #[tokio::test]
    async fn work_can_enqueue_follow_up_work() {
        let h = harness();
        h.dispatcher.enqueue(&Chain { remaining: 2 }, None).await.unwrap();

        let outcomes = h.dispatcher.run_until_idle(10).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(h.journal.runs(), vec!["chain 2", "chain 1", "chain 0"]);
        assert!(h.db.committed_work(&CHAIN).is_empty());
    }

    #[tokio::test]
    async fn non_performing_queuer_suppresses_follow_up_work() {
        let h = harness_with(|d| {
            let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
            d.with_queuer(Arc::new(NonPerformingQueuer::new(clock)))
        });

        let mut txn = h.db.begin().await.unwrap();
        txn.insert_work(&CHAIN, h.clock.now(), &Chain { remaining: 3 }.to_fields())
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let outcomes = h.dispatcher.run_until_idle(10).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(h.journal.runs(), vec!["chain 3"]);
        assert!(h.db.committed_work(&CHAIN).is_empty());
    }

    #[tokio::test]
    async fn run_until_idle_stops_on_persistent_failure() {
        let h = harness();
        h.journal.fail_next("stuck", u32::MAX);
        h.dispatcher.enqueue(&Touch::new("stuck", 1), None).await.unwrap();

        let outcomes = h.dispatcher.run_until_idle(10).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], DispatchOutcome::Failed { .. }));
        assert_eq!(h.db.committed_work(&TOUCH).len(), 1);
    }

    #[tokio::test]
    async fn unregistered_kind_is_a_schema_error() {
        let h = harness();
        let err = h.dispatcher.dispatch_one(&ORPHAN).await.unwrap_err();
        assert!(err.is_schema());
    }

    #[tokio::test]
    async fn missing_collaborator_fails_the_work() {
        let db = InMemoryDatabase::with_tables([&TOUCH]);
        let clock = ManualClock::default();
        let dispatcher = WorkDispatcher::new(
            Arc::new(db.clone()),
            Arc::new(WorkRegistry::new().with::<Touch>()),
            Arc::new(clock),
            QueueConfig::default(),
        );
        dispatcher.enqueue(&Touch::new("a", 1), None).await.unwrap();

        match dispatcher.dispatch_one(&TOUCH).await.unwrap() {
            DispatchOutcome::Failed { error, .. } => {
                assert_eq!(error.to_string(), "work failed: journal not installed")
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(db.committed_work(&TOUCH).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loops_process_work_and_stop() {
        let h = harness();
        let handle = Arc::clone(&h.dispatcher).spawn();
        assert_eq!(handle.loops(), 2);

        h.dispatcher.enqueue(&Touch::new("a", 1), None).await.unwrap();
        h.dispatcher.enqueue(&Chain { remaining: 1 }, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stats = handle.stats();
        handle.shutdown().await;

        assert_eq!(stats.succeeded, 3);
        assert!(h.db.committed_work(&TOUCH).is_empty());
        assert!(h.db.committed_work(&CHAIN).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn storage_errors_back_off() {
        let h = harness();
        h.db.set_unavailable(true);

        let handle = Arc::clone(&h.dispatcher).spawn();
        tokio::time::sleep(Duration::from_secs(12)).await;
        let errors = handle.stats().polling_errors;
        handle.shutdown().await;

        // Two loops, each failing at t=0, 5 and 10.
        assert_eq!(errors, 6);
    }
}
