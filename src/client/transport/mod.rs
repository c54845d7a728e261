//! The transport boundary: the wire protocol and byte framing below
//! a subchannel are an external collaborator, so this module only specifies
//! the contract a concrete transport (HTTP/2, in-memory, ...) must satisfy.

use std::sync::Arc;

use tokio::sync::oneshot;
use tonic::async_trait;

use crate::service::Service;
use crate::status::Status;

mod registry;

pub use registry::{TransportRegistry, GLOBAL_TRANSPORT_REGISTRY};

/// The result of a successful [`Transport::connect`]: a connected service
/// plus a one-shot signal the subchannel awaits to learn the connection was
/// lost, mirroring the "ConnectionTerminated" event a real HTTP/2 transport
/// reports on GOAWAY or socket close.
pub struct Connected {
    pub service: Arc<dyn Service>,
    pub disconnected: oneshot::Receiver<()>,
}

/// A pluggable connector from a resolved address to a live [`Service`].
/// Concrete transports (HTTP/2 over TLS, the in-memory test transport, ...)
/// implement this; the channel core only ever calls through it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects to `address`, yielding a [`Connected`] handle on success.
    /// Callers (the subchannel state machine) race this against their own
    /// connect timeout, so this future is expected to run until it succeeds,
    /// fails, or is dropped -- it must not block indefinitely on its own.
    ///
    /// `keepalive_ms` is the subchannel's current keepalive interval at the
    /// time of the connect attempt; a transport that speaks a keepalive-aware
    /// protocol should use it to configure the new connection's ping timer.
    /// Transports with no such concept (e.g. the in-memory test transport)
    /// are free to ignore it.
    async fn connect(&self, address: String, keepalive_ms: u64) -> Result<Connected, Status>;

    /// The URI scheme(s) this transport handles, e.g. `"dns"`'s resolved
    /// addresses are typically `"tcp"`; the in-memory transport uses
    /// `"inmemory"`. Used to select a transport for a resolved address's
    /// `address_type`.
    fn scheme(&self) -> &'static str;
}
