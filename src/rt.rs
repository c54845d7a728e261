//! A small runtime abstraction so the channel core does not hard-code
//! `tokio::spawn`/`tokio::time::sleep` everywhere, mirroring the pattern the
//! sibling `transport`/`name_resolution` boundaries use for pluggable
//! collaborators: default to `tokio`, but let an embedder swap it.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tonic::async_trait;

pub trait TaskHandle: Send + Sync {
    /// Aborts the associated task. A no-op if the task already finished.
    fn abort(&self);
}

pub trait Runtime: Send + Sync {
    /// Spawns `task` to run in the background, detached from the caller.
    fn spawn(&self, task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>) -> Box<dyn TaskHandle>;

    /// Returns a future that completes after `duration` elapses.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// A DNS resolver abstraction consumed by the supplemented `dns:///` name
/// resolver (see `client::name_resolution::dns`). Kept separate from
/// `Runtime` so a caller can override DNS behavior (e.g. in tests) without
/// replacing the whole async runtime.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn lookup_host(&self, name: &str) -> Result<Vec<std::net::IpAddr>, String>;
}

/// The default runtime, backed directly by `tokio`.
#[derive(Clone, Copy, Default)]
pub struct TokioRuntime;

struct TokioTaskHandle(tokio::task::JoinHandle<()>);

impl TaskHandle for TokioTaskHandle {
    fn abort(&self) {
        self.0.abort();
    }
}

impl Runtime for TokioRuntime {
    fn spawn(&self, task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>) -> Box<dyn TaskHandle> {
        Box::new(TokioTaskHandle(tokio::spawn(task)))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

pub struct TokioDnsResolver;

#[async_trait]
impl DnsResolver for TokioDnsResolver {
    async fn lookup_host(&self, name: &str) -> Result<Vec<std::net::IpAddr>, String> {
        // `lookup_host` needs a `host:port` pair; the port is discarded by
        // callers that only want addresses, so a placeholder is fine here.
        tokio::net::lookup_host((name, 0))
            .await
            .map(|iter| iter.map(|addr| addr.ip()).collect())
            .map_err(|e| e.to_string())
    }
}
