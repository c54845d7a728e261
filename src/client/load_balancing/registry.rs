//! A registry of [`LbPolicyBuilder`]s, indexed by policy name, mirroring the
//! shape of the name-resolver and transport registries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use super::LbPolicyBuilder;

#[derive(Clone)]
pub struct SharedLbPolicyBuilder {
    b: Arc<dyn LbPolicyBuilder>,
}

impl SharedLbPolicyBuilder {
    pub fn new(b: impl LbPolicyBuilder + 'static) -> Self {
        Self { b: Arc::new(b) }
    }
}

impl std::ops::Deref for SharedLbPolicyBuilder {
    type Target = dyn LbPolicyBuilder;

    fn deref(&self) -> &Self::Target {
        self.b.as_ref()
    }
}

pub struct LbPolicyRegistry {
    m: Mutex<HashMap<&'static str, SharedLbPolicyBuilder>>,
}

impl Default for LbPolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LbPolicyRegistry {
    pub fn new() -> Self {
        Self { m: Mutex::new(HashMap::new()) }
    }

    pub fn add_builder(&self, builder: impl LbPolicyBuilder + 'static) {
        let shared = SharedLbPolicyBuilder::new(builder);
        self.m.lock().unwrap().insert(shared.name(), shared);
    }

    pub fn get_policy(&self, name: &str) -> Option<SharedLbPolicyBuilder> {
        self.m.lock().unwrap().get(name).cloned()
    }
}

/// The registry consulted if a channel is not configured with its own
/// private LB policy registry (`lb_policy_registry` channel arg).
pub static GLOBAL_LB_REGISTRY: Lazy<LbPolicyRegistry> = Lazy::new(|| {
    let registry = LbPolicyRegistry::new();
    registry.add_builder(super::pick_first::Builder);
    registry.add_builder(super::round_robin::Builder);
    registry
});
