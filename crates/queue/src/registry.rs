//! Kind → implementation table, built once at startup.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use davq_core::{QueueError, QueueResult, WorkTable};

use crate::item::{WorkContext, WorkItem};

/// Type-erased work kind.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    fn table(&self) -> &'static WorkTable;

    /// Decode the context's record and run the kind's work function.
    async fn perform(&self, ctx: &mut WorkContext<'_>) -> QueueResult<()>;
}

struct TypedHandler<W>(PhantomData<fn() -> W>);

#[async_trait]
impl<W: WorkItem> WorkHandler for TypedHandler<W> {
    fn table(&self) -> &'static WorkTable {
        W::TABLE
    }

    async fn perform(&self, ctx: &mut WorkContext<'_>) -> QueueResult<()> {
        let item = W::from_record(ctx.record())?;
        item.do_work(ctx).await
    }
}

/// Registered work kinds, keyed by table name.
#[derive(Clone, Default)]
pub struct WorkRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn WorkHandler>>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register kind `W`. Re-registering a table replaces the previous kind.
    pub fn register<W: WorkItem>(&mut self) -> &mut Self {
        self.handlers
            .insert(W::TABLE.name(), Arc::new(TypedHandler::<W>(PhantomData)));
        self
    }

    pub fn with<W: WorkItem>(mut self) -> Self {
        self.register::<W>();
        self
    }

    pub fn handler(&self, table: &str) -> QueueResult<Arc<dyn WorkHandler>> {
        self.handlers
            .get(table)
            .cloned()
            .ok_or_else(|| QueueError::schema(format!("unknown work kind {table}")))
    }

    pub fn contains(&self, table: &WorkTable) -> bool {
        self.handlers.contains_key(table.name())
    }

    /// Tables of every registered kind, ordered by name.
    pub fn tables(&self) -> Vec<&'static WorkTable> {
        self.handlers.values().map(|h| h.table()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for WorkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use davq_core::{Column, WorkFields, WorkRecord};

    static NOOP: WorkTable = WorkTable::new("noop_work", &[Column::integer("n")]);

    struct Noop;

    #[async_trait]
    impl WorkItem for Noop {
        const TABLE: &'static WorkTable = &NOOP;

        fn from_record(_record: &WorkRecord) -> QueueResult<Self> {
            Ok(Noop)
        }

        fn to_fields(&self) -> WorkFields {
            WorkFields::new().with("n", 0)
        }

        async fn do_work(&self, _ctx: &mut WorkContext<'_>) -> QueueResult<()> {
            Ok(())
        }
    }

    #[test]
    fn lookup_by_table_name() {
        let registry = WorkRegistry::new().with::<Noop>();

        assert!(registry.contains(&NOOP));
        assert_eq!(registry.handler("noop_work").unwrap().table(), &NOOP);
        assert_eq!(registry.tables(), vec![&NOOP]);

        let err = registry.handler("missing_work").err().unwrap();
        assert!(err.is_schema());
    }
}
