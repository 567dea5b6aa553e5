//! Peer node registry.
//!
//! Each server process keeps a `node_info` row keyed by `(hostname, pid)`
//! and refreshes it on a heartbeat. The registry is advisory: work claiming
//! never reads it, and rows left behind by crashed processes are harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use davq_core::{Clock, NodeInfo, QueueResult};
use davq_queue::{Database, Transaction};

/// This process's entry in the node registry.
pub struct NodeRegistry {
    database: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    hostname: String,
    pid: u32,
    port: u16,
}

impl NodeRegistry {
    pub fn new(
        database: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        hostname: impl Into<String>,
        pid: u32,
        port: u16,
    ) -> Self {
        Self {
            database,
            clock,
            hostname: hostname.into(),
            pid,
            port,
        }
    }

    /// Registry entry for the current process.
    pub fn for_current_process(
        database: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        hostname: impl Into<String>,
        port: u16,
    ) -> Self {
        Self::new(database, clock, hostname, std::process::id(), port)
    }

    /// This node's row as of now.
    pub fn local(&self) -> NodeInfo {
        NodeInfo::new(self.hostname.clone(), self.pid, self.port, self.clock.now())
    }

    /// Insert or refresh this node's row.
    pub async fn register(&self) -> QueueResult<NodeInfo> {
        let node = self.upsert().await?;
        info!(node = %node, "node registered");
        Ok(node)
    }

    pub async fn heartbeat(&self) -> QueueResult<NodeInfo> {
        let node = self.upsert().await?;
        debug!(node = %node, "node heartbeat");
        Ok(node)
    }

    /// Remove this node's row. Only needed on graceful shutdown.
    pub async fn unregister(&self) -> QueueResult<()> {
        let mut txn = self.database.begin().await?;
        txn.delete_node(&self.hostname, self.pid).await?;
        txn.commit().await?;
        info!(hostname = %self.hostname, pid = self.pid, "node unregistered");
        Ok(())
    }

    /// Nodes seen within `freshness` of now, read through `txn`.
    pub async fn active_nodes(
        &self,
        txn: &mut dyn Transaction,
        freshness: Duration,
    ) -> QueueResult<Vec<NodeInfo>> {
        let threshold = chrono::Duration::from_std(freshness).unwrap_or(chrono::Duration::MAX);
        let now = self.clock.now();
        let mut nodes: Vec<NodeInfo> = txn
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.is_fresh(now, threshold))
            .collect();
        nodes.sort_by(|a, b| (&a.hostname, a.pid).cmp(&(&b.hostname, b.pid)));
        Ok(nodes)
    }

    /// Refresh this node's row every `interval` until the handle is stopped.
    pub fn spawn_heartbeat(self: Arc<Self>, interval: Duration) -> HeartbeatHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.heartbeat().await {
                            warn!(error = %e, "node heartbeat failed");
                        }
                    }
                }
            }
        });

        HeartbeatHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn upsert(&self) -> QueueResult<NodeInfo> {
        let node = self.local();
        let mut txn = self.database.begin().await?;
        txn.upsert_node(&node).await?;
        txn.commit().await?;
        Ok(node)
    }
}

/// Handle to a running heartbeat task.
#[derive(Debug)]
pub struct HeartbeatHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "heartbeat task panicked");
        }
    }
}
