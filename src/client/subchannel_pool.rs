//! Subchannel pooling: sharing a single [`Subchannel`] across
//! channels (or within one channel) that resolve to the same address, so
//! multiple channels dialing the same backend reuse one connection instead
//! of each opening their own.
//!
//! The pool holds only weak references -- a pooled entry survives exactly as
//! long as some LB policy still references it through a strong `Arc`
//! ("drop the last reference and the connection goes away").

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::Lazy;

use crate::client::name_resolution::Address;
use crate::client::subchannel::{InternalSubchannel, SubchannelKey};
use crate::client::transport::Transport;
use crate::rt::Runtime;

/// A source of (possibly shared) [`Subchannel`]s for a resolved address.
pub trait SubchannelPool: Send + Sync {
    /// Returns the existing subchannel for `address` if one is live, or
    /// creates and registers a new one.
    fn new_subchannel(&self, address: &Address, transport: Arc<dyn Transport>, runtime: Arc<dyn Runtime>) -> Arc<InternalSubchannel>;
}

#[derive(Default)]
struct Registry {
    m: Mutex<HashMap<SubchannelKey, Weak<InternalSubchannel>>>,
}

impl Registry {
    fn get_or_create(&self, address: &Address, transport: Arc<dyn Transport>, runtime: Arc<dyn Runtime>) -> Arc<InternalSubchannel> {
        let key = SubchannelKey::new(address);
        let mut m = self.m.lock().unwrap();
        if let Some(existing) = m.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let sc = InternalSubchannel::new(key.clone(), transport, runtime);
        m.insert(key, Arc::downgrade(&sc));
        sc
    }
}

/// A pool shared by every channel in the process, used unless a channel is
/// configured with its own [`LocalSubchannelPool`].
pub struct GlobalSubchannelPool {
    registry: Registry,
}

impl GlobalSubchannelPool {
    fn new() -> Self {
        Self { registry: Registry::default() }
    }
}

impl SubchannelPool for GlobalSubchannelPool {
    fn new_subchannel(&self, address: &Address, transport: Arc<dyn Transport>, runtime: Arc<dyn Runtime>) -> Arc<InternalSubchannel> {
        self.registry.get_or_create(address, transport, runtime)
    }
}

pub static GLOBAL_SUBCHANNEL_POOL: Lazy<GlobalSubchannelPool> = Lazy::new(GlobalSubchannelPool::new);

/// A pool private to a single channel: addresses are still deduplicated
/// within that channel (e.g. the same backend appearing in two endpoints)
/// but never shared with other channels.
#[derive(Default)]
pub struct LocalSubchannelPool {
    registry: Registry,
}

impl LocalSubchannelPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubchannelPool for LocalSubchannelPool {
    fn new_subchannel(&self, address: &Address, transport: Arc<dyn Transport>, runtime: Arc<dyn Runtime>) -> Arc<InternalSubchannel> {
        self.registry.get_or_create(address, transport, runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::Connected;
    use crate::rt::TokioRuntime;
    use crate::status::Status;
    use tonic::async_trait;

    struct NeverConnects;

    #[async_trait]
    impl Transport for NeverConnects {
        async fn connect(&self, _address: String, _keepalive_ms: u64) -> Result<Connected, Status> {
            std::future::pending().await
        }

        fn scheme(&self) -> &'static str {
            "test"
        }
    }

    fn addr(a: &str) -> Address {
        Address { address_type: "tcp".into(), address: a.into(), attributes: Default::default() }
    }

    #[test]
    fn local_pool_dedupes_same_address() {
        let pool = LocalSubchannelPool::new();
        let transport: Arc<dyn Transport> = Arc::new(NeverConnects);
        let runtime: Arc<dyn Runtime> = Arc::new(TokioRuntime);
        let a = pool.new_subchannel(&addr("10.0.0.1:80"), transport.clone(), runtime.clone());
        let b = pool.new_subchannel(&addr("10.0.0.1:80"), transport, runtime);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn local_pool_distinguishes_addresses() {
        let pool = LocalSubchannelPool::new();
        let transport: Arc<dyn Transport> = Arc::new(NeverConnects);
        let runtime: Arc<dyn Runtime> = Arc::new(TokioRuntime);
        let a = pool.new_subchannel(&addr("10.0.0.1:80"), transport.clone(), runtime.clone());
        let b = pool.new_subchannel(&addr("10.0.0.2:80"), transport, runtime);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn pool_drops_entry_once_all_strong_refs_are_gone() {
        let pool = LocalSubchannelPool::new();
        let transport: Arc<dyn Transport> = Arc::new(NeverConnects);
        let runtime: Arc<dyn Runtime> = Arc::new(TokioRuntime);
        let key = SubchannelKey::new(&addr("10.0.0.1:80"));
        {
            let _a = pool.new_subchannel(&addr("10.0.0.1:80"), transport.clone(), runtime.clone());
            assert!(pool.registry.m.lock().unwrap().get(&key).and_then(Weak::upgrade).is_some());
        }
        assert!(pool.registry.m.lock().unwrap().get(&key).and_then(Weak::upgrade).is_none());
    }
}
