//! `davq-queue`: storage-agnostic queue mechanics.
//!
//! ## Overview
//!
//! - [`transaction`]: the `Database`/`Transaction` boundary every adapter implements
//! - [`memory`]: a transactional in-memory database with row-level claim locks
//! - [`item`]: the `WorkItem` trait and the `WorkContext` work functions run in
//! - [`registry`]: kind → implementation table
//! - [`queuer`]: enqueue inside the caller's transaction (or not at all)
//! - [`retry`]: savepoint-based retry helper
//! - [`lock`]: best-effort distributed lock over a shared cache
//!
//! Dispatch loops and concrete adapters live in `davq-infra`.

pub mod item;
pub mod lock;
pub mod memory;
pub mod queuer;
pub mod registry;
pub mod retry;
pub mod services;
pub mod transaction;

pub use item::{WorkContext, WorkItem};
pub use lock::{DistributedLock, InMemoryLockCache, LockCache};
pub use memory::InMemoryDatabase;
pub use queuer::{NonPerformingQueuer, Queuer, QueuerExt, TransactionalQueuer, WorkProposal};
pub use registry::{WorkHandler, WorkRegistry};
pub use retry::subtransaction;
pub use services::Services;
pub use transaction::{Database, FinishHook, SyncRevision, Transaction};
