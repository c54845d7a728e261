//! A small type-indexed bag used to thread opaque, typed side-channel data
//! through the resolver/LB/subchannel boundaries without widening their
//! public types for every new piece of metadata a policy might want.
//!
//! `Attributes` is intentionally cheap to clone (values are `Arc`-wrapped) and
//! is not optimized for large numbers of entries -- a handful of entries per
//! `Address`/`Endpoint`/`ResolverData` is the expected shape.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Attributes {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new `Attributes` with `value` set, replacing any existing
    /// value of the same type.
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.map.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    pub fn set<T: Send + Sync + 'static>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.map.get(&TypeId::of::<T>()).and_then(|v| v.downcast_ref())
    }

    pub fn remove<T: 'static>(&mut self) -> bool {
        self.map.remove(&TypeId::of::<T>()).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes")
            .field("len", &self.map.len())
            .finish()
    }
}
