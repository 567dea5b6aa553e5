//! `davq-core`: building blocks for the storage-coordinated work queue.
//!
//! This crate contains **pure** types (no IO): the work-record mapping,
//! identifiers, node identity, time sources, configuration and the error
//! taxonomy shared by every other crate.

pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod node;
pub mod schema;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{MAX_PERIOD_DAYS, MIN_VALID_REVISION, QueueConfig, QueueConfigLayer};
pub use error::{QueueError, QueueResult};
pub use id::WorkId;
pub use node::NodeInfo;
pub use schema::{
    Column, ColumnType, FieldValue, NOT_BEFORE_COLUMN, WORK_ID_COLUMN, WorkFields, WorkRecord,
    WorkTable,
};
