//! The name resolution contract: a pluggable producer of backend
//! addresses and service config, reported to the channel through a
//! `ChannelController` callback interface rather than a return value, so a
//! resolver can push updates at any time (not just once at startup).

use core::fmt;

use std::{
    error::Error,
    fmt::{Display, Formatter},
    hash::Hash,
    sync::Arc,
};
use tokio::sync::Notify;

use tonic::async_trait;
use url::Url;

use crate::attributes::Attributes;
use crate::service_config::ServiceConfig;

mod registry;
pub use registry::{ResolverRegistry, SharedResolverBuilder, GLOBAL_RESOLVER_REGISTRY};

pub mod dns;

/// Selects per-call configuration (method config overrides, LB pick
/// attributes) based on the outgoing call, as a resolver may want to
/// override the static service config on a per-RPC basis (e.g. xDS route
/// matching). Grounded on `config_selector.h`'s `ConfigSelector`.
pub trait ConfigSelector: Send + Sync {
    /// Returns the method config that applies to `path`, and any call
    /// attributes the LB policy picker should see, falling back to the
    /// resolver's static service config when this returns `None`.
    fn select(&self, path: &str) -> Option<CallConfig>;
}

pub struct CallConfig {
    pub method_config: crate::service_config::MethodConfig,
    pub call_attributes: Attributes,
}

/// A name resolver factory.
pub trait ResolverBuilder: Send + Sync {
    /// Builds a name resolver instance, or returns an error.
    fn build(
        &self,
        target: Url,
        resolve_now: Arc<Notify>,
        options: ResolverOptions,
    ) -> Box<dyn Resolver>;
    /// Reports the URI scheme handled by this name resolver.
    fn scheme(&self) -> &'static str;
    /// Returns the default authority for a channel using this name resolver and
    /// target.
    fn default_authority(&self, target: &Url) -> String {
        let path = target.path();
        path.strip_prefix("/").unwrap_or(path).to_string()
    }
}

/// The channel-side callback interface a `Resolver` reports through. Kept
/// separate from the LB policy's `ChannelController` (in
/// `client::load_balancing`) since a resolver never touches subchannels.
#[async_trait]
pub trait ChannelController: Send + Sync {
    /// Parses a raw JSON service config string, returning an error the
    /// resolver can surface if parsing fails (a bad config does not replace
    /// the last-known-good one).
    fn parse_service_config(&self, config: &str) -> Result<ServiceConfig, Box<dyn Error + Send + Sync>> {
        ServiceConfig::parse(config).map_err(|e| e.into())
    }

    async fn update(&self, update: ResolverUpdate) -> Result<(), Box<dyn Error + Send + Sync>>;
}

pub enum ResolverUpdate {
    /// The name resolver encountered an error ("On resolver error").
    Err(Box<dyn Error + Send + Sync>),
    /// The name resolver produced a result.
    Data(ResolverData),
}

#[derive(Debug, Default, Clone)]
#[non_exhaustive]
pub struct ResolverOptions {
    pub authority: String,
}

/// Data provided by the name resolver.
#[non_exhaustive]
pub struct ResolverData {
    pub endpoints: Vec<Endpoint>,
    pub service_config: Option<ServiceConfig>,
    pub config_selector: Option<Arc<dyn ConfigSelector>>,
    /// Optional data which can be used by the LB Policy or channel.
    pub attributes: Attributes,
}

impl Default for ResolverData {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            service_config: None,
            config_selector: None,
            attributes: Attributes::new(),
        }
    }
}

impl fmt::Debug for ResolverData {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverData")
            .field("endpoints", &self.endpoints)
            .field("has_service_config", &self.service_config.is_some())
            .field("has_config_selector", &self.config_selector.is_some())
            .finish()
    }
}

#[derive(Debug, Default, Clone)]
#[non_exhaustive]
pub struct Endpoint {
    pub addresses: Vec<Address>,
    /// Optional data which can be used by the LB Policy.
    pub attributes: Attributes,
}

impl Eq for Endpoint {}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.addresses == other.addresses
    }
}

impl Hash for Endpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addresses.hash(state);
    }
}

#[derive(Debug, Default, Clone)]
#[non_exhaustive]
pub struct Address {
    /// A string describing the address's type, e.g. `"tcp"`.
    pub address_type: String,
    pub address: String,
    /// Optional data which can be used by the Subchannel or transport.
    pub attributes: Attributes,
}

impl Eq for Address {}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.address_type == other.address_type && self.address == other.address
    }
}

impl Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address_type.hash(state);
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address_type, self.address)
    }
}

pub static TCP_IP_ADDRESS_TYPE: &str = "tcp";

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn start(&mut self, channel_controller: Box<dyn ChannelController>);
}
