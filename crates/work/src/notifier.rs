//! Push fan-out collaborator.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use davq_core::QueueResult;

/// Tells downstream observers that the resource behind `id` changed.
///
/// Installed into the dispatcher's services as `Arc<dyn Notifier>`.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn enqueue(&self, id: &str) -> QueueResult<()>;
}

/// Keeps every notification in memory, in delivery order.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notified: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notified(&self) -> Vec<String> {
        self.notified
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn enqueue(&self, id: &str) -> QueueResult<()> {
        self.notified
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id.to_string());
        Ok(())
    }
}

/// Logs each notification; used when no push transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn enqueue(&self, id: &str) -> QueueResult<()> {
        info!(push_id = id, "push notification");
        Ok(())
    }
}
