//! `davq-work`: the work kinds a server node runs.
//!
//! - [`push`]: coalesced push notifications, delivered through a [`Notifier`]
//! - [`revision_cleanup`]: the find-cutoff / cleanup maintenance cycle
//! - [`group_cacher`]: periodic group membership refresh
//!
//! Collaborators are looked up from the dispatcher's `Services` by handle
//! type (`Arc<dyn Notifier>`, `Arc<dyn GroupCacher>`, `Arc<dyn LockCache>`).

pub mod group_cacher;
pub mod notifier;
pub mod push;
pub mod revision_cleanup;

pub use group_cacher::{GroupCacher, GroupCacherPollingWork, schedule_group_cacher};
pub use notifier::{LoggingNotifier, Notifier, RecordingNotifier};
pub use push::{PushNotificationWork, notify_changed};
pub use revision_cleanup::{
    FindMinValidRevisionWork, RevisionCleanupWork, min_valid_revision, schedule_revision_cleanup,
};

use davq_queue::WorkRegistry;

/// Registry with every work kind in this crate.
pub fn registry() -> WorkRegistry {
    WorkRegistry::new()
        .with::<PushNotificationWork>()
        .with::<FindMinValidRevisionWork>()
        .with::<RevisionCleanupWork>()
        .with::<GroupCacherPollingWork>()
}
