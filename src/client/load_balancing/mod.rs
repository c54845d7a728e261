//! The load-balancing policy contract: a pluggable component that
//! turns resolver output into subchannels and a data-plane `Picker`, and
//! reacts to subchannel connectivity changes.
//!
//! Earlier drafts of this module sketched three child-manager authoring
//! styles for multi-child policies (a plain-trait version, a
//! callback-based version, and a batched-update version). Only the
//! plain-trait one (`child_manager_single`) was ever wired against a real
//! `LbPolicy` implementation; the other two referenced trait names that
//! were never defined anywhere in the crate and could not compile, so they
//! were dropped rather than carried as dead weight. `round_robin` builds on
//! `child_manager_single`.

use std::{
    any::Any,
    error::Error,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};
use tonic::metadata::MetadataMap;

use crate::service::{Request, Response};

use super::connectivity::ConnectivityState;
use super::name_resolution::{Address, ResolverUpdate};
use super::subchannel::InternalSubchannel;

pub mod child_manager_single;
pub mod pick_first;
pub mod registry;
pub mod round_robin;

pub use registry::{LbPolicyRegistry, SharedLbPolicyBuilder, GLOBAL_LB_REGISTRY};

/// A handle to a subchannel, as seen by an LB policy. Cheap to clone (wraps
/// an `Arc`); equality and hashing are by identity so a policy can use it as
/// a `HashMap` key (`child_manager_single`'s `subchannel_child_map`).
#[derive(Clone)]
pub struct Subchannel(pub(super) Arc<InternalSubchannel>);

impl Subchannel {
    pub fn connect(&self) {
        self.0.request_connection();
    }

    pub fn address(&self) -> Address {
        self.0.address()
    }

    /// The currently connected transport, if this subchannel is `READY`.
    /// Consulted by the data plane (`load_balanced_call`) once a picker
    /// hands out a `Complete` pick.
    pub fn connected_service(&self) -> Option<Arc<dyn crate::service::Service>> {
        self.0.connected_transport()
    }

    /// Registers a watcher for this subchannel's connectivity transitions.
    /// Used by the channel to forward transitions into `LbPolicy::subchannel_update`.
    pub(crate) fn watch_connectivity_state(&self, watcher: Arc<dyn super::subchannel::ConnectivityWatcher>) {
        self.0.watch_connectivity_state(watcher);
    }
}

impl PartialEq for Subchannel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Subchannel {}

impl Hash for Subchannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Debug for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subchannel({})", self.0.address())
    }
}

/// A subchannel's reported connectivity, handed to `LbPolicy::subchannel_update`.
#[derive(Clone)]
pub struct SubchannelState {
    pub connectivity_state: ConnectivityState,
    pub last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

/// Parsed, policy-specific LB config, as produced from the
/// `loadBalancingConfig` JSON block. A marker trait:
/// each policy downcasts via `Any` to its own config type.
pub trait LbConfig: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Data-plane picking function produced by an LB policy. Each call
/// to `pick` returns one of three outcomes: `Complete` hands
/// the call a subchannel to attempt, `Queue` asks the caller to park and
/// retry once a new picker is published, and `Fail` terminates the call
/// unless it is wait-for-ready, in which case the caller treats it like
/// `Queue`.
pub trait Picker: Send + Sync {
    fn pick(&self, request: &Request) -> PickResult;
}

pub enum PickResult {
    Complete(Pick),
    Queue,
    Fail(crate::status::Status),
}

pub struct Pick {
    pub subchannel: Subchannel,
    /// Fired with a reference to the finished response so an LB policy can
    /// extract per-call backend metrics from trailing metadata before the
    /// caller sees it.
    pub on_complete: Option<Box<dyn FnOnce(&Response) + Send + Sync>>,
    /// Additional outgoing metadata the picker wants attached to this call.
    pub metadata: Option<MetadataMap>,
}

/// The aggregate state an LB policy reports back to the channel: its
/// overall connectivity plus a fresh picker.
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// The state a freshly constructed child reports before its first real
    /// update: connecting, with a picker that queues every pick.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker),
        }
    }
}

/// A picker that queues every call, used while no subchannel is ready yet.
pub struct QueuingPicker;

impl Picker for QueuingPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Queue
    }
}

/// A picker that terminally fails every call with the same status, used
/// once an LB policy gives up on the current resolution (e.g. pick_first
/// exhausting its address list, or an empty resolver result) until the next
/// resolver or subchannel update produces something better.
pub struct FailingPicker(crate::status::Status);

impl FailingPicker {
    pub fn new(status: crate::status::Status) -> Self {
        Self(status)
    }
}

impl Picker for FailingPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Fail(self.0.clone())
    }
}

/// The channel-side operations an LB policy may invoke.
pub trait ChannelController: Send + Sync {
    /// Creates (or looks up, via the subchannel pool) a subchannel for
    /// `address`, in `IDLE` state.
    fn new_subchannel(&mut self, address: &Address) -> Subchannel;
    /// Publishes a new aggregate connectivity state and picker.
    fn update_picker(&mut self, update: LbState);
    /// Asks the channel to trigger a fresh name resolution ("re-resolve").
    fn request_resolution(&mut self);
}

/// Lets an LB policy schedule itself to be called back on `LbPolicy::work`
/// from within the `WorkSerializer`, for work that isn't a direct reaction
/// to a resolver or subchannel update (e.g. round_robin's periodic
/// re-shuffle, or a timer-driven re-pick).
pub trait WorkScheduler: Send + Sync {
    fn schedule_work(&self);
}

pub struct NopWorkScheduler;

impl WorkScheduler for NopWorkScheduler {
    fn schedule_work(&self) {}
}

pub struct LbPolicyOptions {
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

/// An LB policy instance. One instance exists per channel (or, for a
/// policy like `grpclb`/`xds_cluster_manager` that manages children, one per
/// child as well, via `child_manager_single::ChildManager`).
pub trait LbPolicy: Send {
    fn resolver_update(
        &mut self,
        resolver_update: ResolverUpdate,
        config: Option<&dyn LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    fn subchannel_update(&mut self, subchannel: &Subchannel, state: &SubchannelState, channel_controller: &mut dyn ChannelController);

    /// Called when this policy (or one of its descendants) called
    /// `WorkScheduler::schedule_work` and the work serializer is now giving
    /// it a turn.
    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let _ = channel_controller;
    }
}

/// An LB policy factory, registered under `name()` in the LB policy
/// registry.
pub trait LbPolicyBuilder: Send + Sync {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;
    fn name(&self) -> &'static str;

    /// Parses this policy's config block (the value under its name in
    /// `loadBalancingConfig`) into an `LbConfig`. The default rejects any
    /// config, which is correct for policies that take none (e.g.
    /// `pick_first`).
    fn parse_config(&self, _config: &serde_json::Value) -> Result<Box<dyn LbConfig>, Box<dyn Error + Send + Sync>> {
        Err("this policy does not accept configuration".into())
    }
}

