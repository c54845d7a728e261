//! An in-memory client/server transport and name resolver: backs this
//! crate's own tests with a loopback channel that never opens a socket, a
//! [`Listener`] keyed by a small integer id standing in for a real network
//! address.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tokio::sync::{mpsc, oneshot, Notify};
use tonic::async_trait;
use url::Url;

use crate::client::name_resolution::{
    Address, ChannelController, Endpoint, Resolver, ResolverBuilder, ResolverData,
    ResolverOptions, ResolverUpdate, SharedResolverBuilder, GLOBAL_RESOLVER_REGISTRY,
};
use crate::client::transport::{Connected, Transport, GLOBAL_TRANSPORT_REGISTRY};
use crate::server;
use crate::service::{Request, Response, Service};
use crate::status::Status;

/// Both the transport's `Address::address_type` and the resolver's URI
/// scheme: an in-memory target always looks like `inmemory:///<id>`.
pub static ADDRESS_TYPE: &str = "inmemory";

static NEXT_ID: AtomicU32 = AtomicU32::new(0);
static LISTENERS: Lazy<Mutex<HashMap<u32, Arc<Listener>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// The server side of an in-memory connection: registers itself under a
/// fresh id for the lifetime of the `Listener`, so a client `Channel`
/// targeting `inmemory:///<id>` can find it.
pub struct Listener {
    id: u32,
    sender: mpsc::Sender<server::Call>,
    receiver: Mutex<Option<mpsc::Receiver<server::Call>>>,
}

impl Listener {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(16);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let listener = Arc::new(Self {
            id,
            sender,
            receiver: Mutex::new(Some(receiver)),
        });
        LISTENERS.lock().unwrap().insert(id, listener.clone());
        listener
    }

    /// The target string a `Channel` should be constructed with to reach
    /// this listener.
    pub fn target(&self) -> String {
        format!("inmemory:///{}", self.id)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        LISTENERS.lock().unwrap().remove(&self.id);
    }
}

#[async_trait]
impl server::Listener for Listener {
    async fn accept(&self) -> Option<server::Call> {
        let mut rx = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .expect("concurrent calls to accept are not supported");
        let call = rx.recv().await;
        *self.receiver.lock().unwrap() = Some(rx);
        call
    }
}

/// A `Listener` is also the `Service` a connected client talks to directly:
/// placing a call just forwards it to whatever `Server::serve` loop is
/// calling `accept` on the other end.
#[async_trait]
impl Service for Listener {
    async fn call(&self, request: Request) -> Response {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.sender.send((request, reply_tx)).await.is_err() {
            return Response::fail(Status::unavailable("inmemory listener is no longer accepting calls"));
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Response::fail(Status::unavailable("inmemory listener dropped the call")))
    }
}

pub struct ClientTransport;

#[async_trait]
impl Transport for ClientTransport {
    async fn connect(&self, address: String, _keepalive_ms: u64) -> Result<Connected, Status> {
        let id: u32 = address
            .parse()
            .map_err(|_| Status::unavailable(format!("invalid inmemory address {address:?}")))?;
        let listener = LISTENERS
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Status::unavailable(format!("no inmemory listener registered for {id}")))?;
        // The in-memory transport has no real connection to drop; leaking
        // the sender half means `disconnected` simply never resolves, which
        // for a test transport is indistinguishable from "still connected".
        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        std::mem::forget(disconnect_tx);
        Ok(Connected {
            service: listener,
            disconnected: disconnect_rx,
        })
    }

    fn scheme(&self) -> &'static str {
        ADDRESS_TYPE
    }
}

struct InMemoryResolverBuilder;

impl ResolverBuilder for InMemoryResolverBuilder {
    fn build(&self, target: Url, _resolve_now: Arc<Notify>, _options: ResolverOptions) -> Box<dyn Resolver> {
        Box::new(InMemoryResolver { target })
    }

    fn scheme(&self) -> &'static str {
        ADDRESS_TYPE
    }
}

/// Resolves once, to the single address named by the target's path, and
/// never produces a second update -- there is no real name to re-resolve.
struct InMemoryResolver {
    target: Url,
}

#[async_trait]
impl Resolver for InMemoryResolver {
    async fn start(&mut self, channel_controller: Box<dyn ChannelController>) {
        let path = self.target.path();
        let id = path.strip_prefix('/').unwrap_or(path).to_string();
        let address = Address {
            address_type: ADDRESS_TYPE.to_string(),
            address: id,
            attributes: Default::default(),
        };
        let update = ResolverUpdate::Data(ResolverData {
            endpoints: vec![Endpoint { addresses: vec![address], ..Default::default() }],
            ..Default::default()
        });
        let _ = channel_controller.update(update).await;
    }
}

/// Registers the in-memory transport and name resolver with the global
/// registries. Tests that want isolation from other tests' registrations
/// should build a `Channel` with its own `ChannelOptions::transport_registry`
/// / `resolver_registry` instead of relying on this.
pub fn register() {
    GLOBAL_TRANSPORT_REGISTRY.add_transport(ClientTransport);
    GLOBAL_RESOLVER_REGISTRY.add_builder(SharedResolverBuilder::new(InMemoryResolverBuilder));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Channel, ChannelOptions};
    use tokio::sync::mpsc;

    fn unary_request(method: &str) -> Request {
        Request::unary(method, bytes::Bytes::new())
    }

    #[tokio::test]
    async fn round_trips_a_call_through_the_listener() {
        register();
        let listener = Listener::new();
        let target = listener.target();

        let server_task = tokio::spawn(async move {
            let (request, reply_to) = listener.accept().await.unwrap();
            assert_eq!(request.method(), "/echo.Svc/Echo");
            let (_tx, rx) = mpsc::channel(1);
            let _ = reply_to.send(Response::ok(rx));
        });

        let channel = Channel::new(&target, ChannelOptions::default()).unwrap();
        let response = channel.call(unary_request("/echo.Svc/Echo")).await;
        assert_eq!(response.status().code(), crate::status::Code::Ok);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn connecting_to_an_unregistered_listener_fails() {
        register();
        let channel = Channel::new("inmemory:///999999", ChannelOptions::default()).unwrap();
        let response = channel.call(unary_request("/echo.Svc/Echo")).await;
        assert_eq!(response.status().code(), crate::status::Code::Unavailable);
    }
}
