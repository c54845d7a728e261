use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use super::Transport;

/// A registry of [`Transport`] implementations, indexed by the address-type
/// string a resolved [`Address`](crate::client::name_resolution::Address)
/// carries. Mirrors the shape of the LB-policy and resolver registries.
pub struct TransportRegistry {
    m: Mutex<HashMap<&'static str, Arc<dyn Transport>>>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self { m: Mutex::new(HashMap::new()) }
    }

    pub fn add_transport(&self, transport: impl Transport + 'static) {
        let transport = Arc::new(transport);
        self.m.lock().unwrap().insert(transport.scheme(), transport);
    }

    pub fn get_transport(&self, address_type: &str) -> Option<Arc<dyn Transport>> {
        self.m.lock().unwrap().get(address_type).cloned()
    }
}

/// The registry consulted if a channel is not configured with its own
/// private transport registry (`transport_registry` channel arg).
pub static GLOBAL_TRANSPORT_REGISTRY: Lazy<TransportRegistry> = Lazy::new(TransportRegistry::new);
