//! Typed collaborator map handed to work functions.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;

/// Collaborators (notifiers, caches, ...) keyed by their type.
///
/// Trait objects are stored by their handle type, e.g.
/// `services.insert::<Arc<dyn Notifier>>(notifier)`.
#[derive(Default)]
pub struct Services {
    entries: HashMap<TypeId, (&'static str, Box<dyn Any + Send + Sync>)>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T>(&mut self, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.entries
            .insert(TypeId::of::<T>(), (type_name::<T>(), Box::new(value)));
    }

    pub fn with<T>(mut self, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.insert(value);
        self
    }

    pub fn get<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|(_, value)| value.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.entries.values().map(|(name, _)| name))
            .finish()
    }
}
