//! Background dispatch loops.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use davq_core::WorkTable;

use super::{DispatchOutcome, DispatcherStats, WorkDispatcher};

/// Handle to control running dispatch loops.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Stop every loop after its current cycle and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "dispatch loop panicked");
            }
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of running loops (one per work kind).
    pub fn loops(&self) -> usize {
        self.tasks.len()
    }
}

impl WorkDispatcher {
    /// Start one polling loop per registered work kind.
    pub fn spawn(self: Arc<Self>) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = self
            .registry
            .tables()
            .into_iter()
            .map(|table| {
                tokio::spawn(dispatch_loop(
                    Arc::clone(&self),
                    table,
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        DispatcherHandle {
            shutdown: shutdown_tx,
            tasks,
            stats: Arc::clone(&self.stats),
        }
    }
}

async fn dispatch_loop(
    dispatcher: Arc<WorkDispatcher>,
    table: &'static WorkTable,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(table = table.name(), "dispatch loop started");

    loop {
        let stopping = *shutdown.borrow();
        if stopping {
            break;
        }

        let pause = match dispatcher.dispatch_one(table).await {
            Ok(DispatchOutcome::Completed { .. }) => Duration::ZERO,
            Ok(DispatchOutcome::Idle) | Ok(DispatchOutcome::Failed { .. }) => {
                dispatcher.config.poll_interval
            }
            Err(e) => {
                error!(table = table.name(), error = %e, "failed to poll for work");
                dispatcher.record(|s| s.polling_errors += 1);
                dispatcher.config.error_backoff
            }
        };

        if pause.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }

    info!(table = table.name(), "dispatch loop stopped");
}
