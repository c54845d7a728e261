//! A minimal `dns:///host:port` resolver: the only concrete resolvers
//! elsewhere in this crate are the `ResolverBuilder`/`Resolver` contract
//! itself and the in-memory test double, so this fills in an actual
//! network-backed one. One-shot + periodic re-resolution via
//! `resolve_now`, using the pluggable [`crate::rt::DnsResolver`] rather than
//! hard-coding `tokio::net::lookup_host` so it stays swappable in tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tonic::async_trait;
use url::Url;

use crate::rt::{DnsResolver, Runtime, TokioDnsResolver, TokioRuntime};

use super::{Address, ChannelController, Endpoint, ResolverData, ResolverOptions, ResolverUpdate, TCP_IP_ADDRESS_TYPE};
use super::{Resolver, ResolverBuilder};

pub static SCHEME: &str = "dns";

/// Re-resolves periodically in addition to on-demand via `resolve_now`,
/// matching the standard gRPC DNS resolver's behavior of not relying solely
/// on external re-resolution requests.
const MIN_RESOLUTION_INTERVAL: Duration = Duration::from_secs(30);

pub struct DnsResolverBuilder {
    dns: Arc<dyn DnsResolver>,
    runtime: Arc<dyn Runtime>,
}

impl Default for DnsResolverBuilder {
    fn default() -> Self {
        Self {
            dns: Arc::new(TokioDnsResolver),
            runtime: Arc::new(TokioRuntime),
        }
    }
}

impl DnsResolverBuilder {
    pub fn new(dns: Arc<dyn DnsResolver>, runtime: Arc<dyn Runtime>) -> Self {
        Self { dns, runtime }
    }
}

impl ResolverBuilder for DnsResolverBuilder {
    fn build(&self, target: Url, resolve_now: Arc<Notify>, _options: ResolverOptions) -> Box<dyn Resolver> {
        Box::new(DnsNameResolver {
            host: target.host_str().unwrap_or_default().to_string(),
            port: target.port().unwrap_or(443),
            dns: self.dns.clone(),
            runtime: self.runtime.clone(),
            resolve_now,
        })
    }

    fn scheme(&self) -> &'static str {
        SCHEME
    }
}

struct DnsNameResolver {
    host: String,
    port: u16,
    dns: Arc<dyn DnsResolver>,
    runtime: Arc<dyn Runtime>,
    resolve_now: Arc<Notify>,
}

impl DnsNameResolver {
    async fn resolve_once(&self, channel_controller: &dyn ChannelController) {
        match self.dns.lookup_host(&self.host).await {
            Ok(ips) => {
                let endpoints = ips
                    .into_iter()
                    .map(|ip| Endpoint {
                        addresses: vec![Address {
                            address_type: TCP_IP_ADDRESS_TYPE.to_string(),
                            address: format!("{ip}:{}", self.port),
                            attributes: Default::default(),
                        }],
                        attributes: Default::default(),
                    })
                    .collect();
                let _ = channel_controller
                    .update(ResolverUpdate::Data(ResolverData {
                        endpoints,
                        ..Default::default()
                    }))
                    .await;
            }
            Err(e) => {
                let _ = channel_controller.update(ResolverUpdate::Err(e.into())).await;
            }
        }
    }
}

#[async_trait]
impl Resolver for DnsNameResolver {
    async fn start(&mut self, channel_controller: Box<dyn ChannelController>) {
        loop {
            self.resolve_once(channel_controller.as_ref()).await;
            tokio::select! {
                _ = self.resolve_now.notified() => {}
                _ = self.runtime.sleep(MIN_RESOLUTION_INTERVAL) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeDns(Vec<IpAddr>);

    #[async_trait]
    impl DnsResolver for FakeDns {
        async fn lookup_host(&self, _name: &str) -> Result<Vec<IpAddr>, String> {
            Ok(self.0.clone())
        }
    }

    struct RecordingController {
        updates: AsyncMutex<Vec<String>>,
        notify_once: Mutex<bool>,
        done: Arc<Notify>,
    }

    #[async_trait]
    impl ChannelController for RecordingController {
        async fn update(&self, update: ResolverUpdate) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            if let ResolverUpdate::Data(data) = update {
                let mut updates = self.updates.lock().await;
                updates.push(data.endpoints.len().to_string());
            }
            let mut fired = self.notify_once.lock().unwrap();
            if !*fired {
                *fired = true;
                self.done.notify_one();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn resolves_addresses_from_dns() {
        let dns = Arc::new(FakeDns(vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]));
        let builder = DnsResolverBuilder::new(dns, Arc::new(TokioRuntime));
        let resolve_now = Arc::new(Notify::new());
        let mut resolver = DnsNameResolver {
            host: "example.com".to_string(),
            port: 443,
            dns: builder.dns.clone(),
            runtime: builder.runtime.clone(),
            resolve_now: resolve_now.clone(),
        };
        let done = Arc::new(Notify::new());
        let controller = Box::new(RecordingController {
            updates: AsyncMutex::new(Vec::new()),
            notify_once: Mutex::new(false),
            done: done.clone(),
        });
        let handle = tokio::spawn(async move { resolver.start(controller).await });
        done.notified().await;
        handle.abort();
    }
}
