//! The client channel root: owns name resolution, the LB policy, the
//! subchannel pool, and the connectivity state a channel publishes to
//! external watchers, all mutated only from inside a single
//! [`WorkSerializer`] so the control plane never needs its own locking
//! discipline beyond that one queue.
//!
//! Generalizes a `Channel`/`PersistentChannel`/`ActiveChannel`/`LbWrapper`
//! quartet into one `Channel { inner: Arc<ChannelData> }`, with the ad hoc
//! `Watcher<T>` pair promoted out into
//! [`connectivity::ConnectivityStateTracker`](super::connectivity).

use std::error::Error;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tokio::sync::{watch, Notify};
use tonic::async_trait;
use tracing::{debug, trace, warn};
use url::Url;

use super::connectivity::{ConnectivityState, ConnectivityStateTracker, StateWatcher};
use super::load_balancing::registry::GLOBAL_LB_REGISTRY;
use super::load_balancing::{
    self as lb, ChannelController as LbChannelController, FailingPicker, LbConfig, LbPolicy,
    LbPolicyOptions, LbPolicyRegistry, LbState, Picker, QueuingPicker, Subchannel,
    SubchannelState, WorkScheduler,
};
use super::name_resolution::registry::GLOBAL_RESOLVER_REGISTRY;
use super::name_resolution::{
    Address, ChannelController as ResolverChannelController, ConfigSelector, Resolver,
    ResolverOptions, ResolverRegistry, ResolverUpdate,
};
use super::subchannel::ConnectivityWatcher as SubchannelConnectivityWatcher;
use super::subchannel_pool::{LocalSubchannelPool, SubchannelPool, GLOBAL_SUBCHANNEL_POOL};
use super::transport::{TransportRegistry, GLOBAL_TRANSPORT_REGISTRY};
use super::work_serializer::WorkSerializer;
use crate::credentials::{Credentials, Insecure};
use crate::rt::{Runtime, TaskHandle, TokioRuntime};
use crate::service::{Request, Response, Service};
use crate::service_config::ServiceConfig;
use crate::status::Status;

/// Embedder-tunable knobs for constructing a [`Channel`]. Every
/// registry field defaults to the process-wide global registry when left
/// `None`; a caller that wants full isolation (e.g. a test that registers a
/// fake transport) can supply its own instead.
pub struct ChannelOptions {
    /// The LB policy selected when neither the service config's
    /// `loadBalancingConfig` nor `loadBalancingPolicy` names one this
    /// channel's registry recognizes.
    pub default_lb_policy: String,
    pub default_service_config: Option<ServiceConfig>,
    pub credentials: Arc<dyn Credentials>,
    pub runtime: Arc<dyn Runtime>,
    pub transport_registry: Option<Arc<TransportRegistry>>,
    pub resolver_registry: Option<Arc<ResolverRegistry>>,
    pub lb_registry: Option<Arc<LbPolicyRegistry>>,
    /// `None` uses the global (process-wide) subchannel pool; `Some` of a
    /// fresh [`LocalSubchannelPool`] gives this channel its own, private
    /// dedup scope.
    pub subchannel_pool: Option<Arc<dyn SubchannelPool>>,
    /// How long the channel waits with no outstanding calls before
    /// re-entering `IDLE` and tearing down its resolver and LB policy.
    pub idle_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            default_lb_policy: lb::pick_first::POLICY_NAME.to_string(),
            default_service_config: None,
            credentials: Arc::new(Insecure::default()),
            runtime: Arc::new(TokioRuntime),
            transport_registry: None,
            resolver_registry: None,
            lb_registry: None,
            subchannel_pool: None,
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl ChannelOptions {
    /// A private subchannel pool scoped to one channel, rather than sharing
    /// the process-wide global pool.
    pub fn with_local_subchannel_pool(mut self) -> Self {
        self.subchannel_pool = Some(Arc::new(LocalSubchannelPool::new()));
        self
    }
}

struct MutableState {
    resolving: bool,
    resolver_task: Option<Box<dyn TaskHandle>>,
    lb_policy: Option<Box<dyn LbPolicy>>,
    lb_policy_name: Option<String>,
    lb_config: Option<Box<dyn LbConfig>>,
    service_config: ServiceConfig,
}

pub(crate) struct ChannelData {
    target: Url,
    authority: String,
    default_lb_policy: String,
    default_service_config: ServiceConfig,
    #[allow(dead_code)]
    credentials: Arc<dyn Credentials>,
    pub(crate) runtime: Arc<dyn Runtime>,
    transport_registry: Option<Arc<TransportRegistry>>,
    resolver_registry: Option<Arc<ResolverRegistry>>,
    lb_registry: Option<Arc<LbPolicyRegistry>>,
    subchannel_pool: Option<Arc<dyn SubchannelPool>>,
    idle_timeout: Duration,

    work_serializer: WorkSerializer,
    state_tracker: ConnectivityStateTracker,
    resolve_now: Arc<Notify>,
    mutable: Mutex<MutableState>,

    /// The data-plane picker, published lock-free for every call to read.
    picker_tx: watch::Sender<Arc<dyn Picker>>,
    /// Flips to `true` once the first resolver result (success or error) is
    /// processed, so calls queued behind name resolution know when to stop
    /// waiting (the "resolution gate").
    resolved_tx: watch::Sender<bool>,
    /// The channel-wide disconnect signal ("atomic word"): `Some`
    /// means every call should fail (or, if [`Status::is_idle_reentry`],
    /// trigger `exit_idle` and retry) instead of consulting the picker.
    disconnect_error: ArcSwapOption<Status>,
    config_selector: ArcSwapOption<dyn ConfigSelector>,

    last_activity: Mutex<Instant>,
}

/// A client-side gRPC channel: one logical connection to a
/// named target, load balanced across however many backends the name
/// resolver reports.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelData>,
}

impl Channel {
    /// Constructs a channel for `target`. The channel starts `IDLE`: name
    /// resolution does not begin until the first call (or an explicit
    /// [`Channel::exit_idle`]) needs it ("Entering IDLE").
    pub fn new(target: &str, options: ChannelOptions) -> Result<Self, Status> {
        let target = Url::parse(target)
            .map_err(|e| Status::unavailable(format!("invalid target {target:?}: {e}")))?;

        let (picker_tx, _) = watch::channel(Arc::new(QueuingPicker) as Arc<dyn Picker>);
        let (resolved_tx, _) = watch::channel(false);
        let authority = default_authority(&target, options.resolver_registry.as_deref());

        let data = Arc::new(ChannelData {
            target,
            authority,
            default_lb_policy: options.default_lb_policy,
            default_service_config: options.default_service_config.unwrap_or_else(ServiceConfig::empty),
            credentials: options.credentials,
            runtime: options.runtime,
            transport_registry: options.transport_registry,
            resolver_registry: options.resolver_registry,
            lb_registry: options.lb_registry,
            subchannel_pool: options.subchannel_pool,
            idle_timeout: options.idle_timeout,
            work_serializer: WorkSerializer::new(),
            state_tracker: ConnectivityStateTracker::new(ConnectivityState::Idle),
            resolve_now: Arc::new(Notify::new()),
            mutable: Mutex::new(MutableState {
                resolving: false,
                resolver_task: None,
                lb_policy: None,
                lb_policy_name: None,
                lb_config: None,
                service_config: ServiceConfig::empty(),
            }),
            picker_tx,
            resolved_tx,
            disconnect_error: ArcSwapOption::const_empty(),
            config_selector: ArcSwapOption::const_empty(),
            last_activity: Mutex::new(Instant::now()),
        });

        data.clone().spawn_idle_timer();

        Ok(Self { inner: data })
    }

    pub fn target(&self) -> &Url {
        &self.inner.target
    }

    /// Returns the current connectivity state (`CheckConnectivityState`).
    pub fn check_connectivity_state(&self) -> ConnectivityState {
        self.inner.state_tracker.current()
    }

    /// Returns a watcher observing connectivity transitions
    /// (`WatchConnectivityState`/`AddConnectivityWatcher`; dropping the
    /// returned watcher is `RemoveConnectivityWatcher`).
    pub fn watch_connectivity_state(&self) -> StateWatcher {
        self.inner.state_tracker.subscribe()
    }

    /// Leaves `IDLE` immediately rather than waiting for the first call
    /// ("Entering IDLE" / exit-idle).
    pub fn exit_idle(&self) {
        self.inner.clone().exit_idle();
    }

    /// Places a call, waiting for name resolution and a ready pick as
    /// needed.
    pub async fn call(&self, request: Request) -> Response {
        *self.inner.last_activity.lock().unwrap() = Instant::now();
        super::call::CallData::new(self.inner.clone()).start(request).await
    }

    /// Shuts the channel down: aborts the resolver, drops the LB policy,
    /// and fails every future call until the channel is dropped. There is
    /// no re-entering `READY` after this; a shut-down
    /// channel, unlike an idle one, does not `exit_idle` again.
    pub fn shutdown(&self) {
        let data = self.inner.clone();
        data.work_serializer.submit(move || {
            data.shutdown_locked();
        });
    }
}

fn default_authority(target: &Url, registry: Option<&ResolverRegistry>) -> String {
    let scheme = target.scheme();
    let builder = registry
        .and_then(|r| r.get_scheme(scheme))
        .or_else(|| GLOBAL_RESOLVER_REGISTRY.get_scheme(scheme));
    match builder {
        Some(b) => b.default_authority(target),
        None => {
            let path = target.path();
            path.strip_prefix('/').unwrap_or(path).to_string()
        }
    }
}

impl ChannelData {
    fn transport_registry(&self) -> &TransportRegistry {
        self.transport_registry.as_deref().unwrap_or(&GLOBAL_TRANSPORT_REGISTRY)
    }

    fn resolver_registry(&self) -> &ResolverRegistry {
        self.resolver_registry.as_deref().unwrap_or(&GLOBAL_RESOLVER_REGISTRY)
    }

    fn lb_registry(&self) -> &LbPolicyRegistry {
        self.lb_registry.as_deref().unwrap_or(&GLOBAL_LB_REGISTRY)
    }

    fn subchannel_pool(&self) -> &dyn SubchannelPool {
        match &self.subchannel_pool {
            Some(p) => p.as_ref(),
            None => &*GLOBAL_SUBCHANNEL_POOL as &dyn SubchannelPool,
        }
    }

    pub(crate) fn subscribe_picker(&self) -> watch::Receiver<Arc<dyn Picker>> {
        self.picker_tx.subscribe()
    }

    pub(crate) fn subscribe_resolved(&self) -> watch::Receiver<bool> {
        self.resolved_tx.subscribe()
    }

    pub(crate) fn disconnect_error(&self) -> Option<Arc<Status>> {
        self.disconnect_error.load_full()
    }

    pub(crate) fn config_selector(&self) -> Option<Arc<dyn ConfigSelector>> {
        self.config_selector.load_full()
    }

    pub(crate) fn current_service_config(&self) -> ServiceConfig {
        self.mutable.lock().unwrap().service_config.clone()
    }

    fn publish_picker(&self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        self.state_tracker.set(state);
        let _ = self.picker_tx.send(picker);
    }

    /// Leaves `IDLE`: builds and starts the name resolver, a no-op if
    /// resolution is already underway.
    pub(crate) fn exit_idle(self: Arc<Self>) {
        let mut state = self.mutable.lock().unwrap();
        if state.resolving {
            return;
        }
        let builder = match self.resolver_registry().get_scheme(self.target.scheme()) {
            Some(b) => b,
            None => {
                drop(state);
                self.publish_picker(
                    ConnectivityState::TransientFailure,
                    Arc::new(FailingPicker::new(Status::unavailable(format!(
                        "no resolver registered for scheme {:?}",
                        self.target.scheme()
                    )))),
                );
                // No resolver will ever run for this scheme, so any call
                // parked in `CallData::wait_for_resolution` must be woken
                // now rather than hanging until its deadline.
                self.resolved_tx.send_replace(true);
                return;
            }
        };
        state.resolving = true;
        self.disconnect_error.store(None);
        self.state_tracker.set(ConnectivityState::Connecting);
        drop(state);

        let mut resolver = builder.build(
            self.target.clone(),
            self.resolve_now.clone(),
            ResolverOptions { authority: self.authority.clone() },
        );
        let controller: Box<dyn ResolverChannelController> =
            Box::new(ResolverControllerImpl { data: self.clone() });
        let data = self.clone();
        let handle = self.runtime.spawn(Box::pin(async move {
            resolver.start(controller).await;
        }));
        data.mutable.lock().unwrap().resolver_task = Some(handle);
    }

    /// Re-enters `IDLE`: tears down the resolver and LB policy and resets
    /// the picker to queue every call, until the next call re-triggers
    /// `exit_idle`.
    fn enter_idle(self: &Arc<Self>) {
        let mut state = self.mutable.lock().unwrap();
        if !state.resolving {
            return;
        }
        debug!(target = %self.target, "channel entering IDLE after inactivity");
        if let Some(task) = state.resolver_task.take() {
            task.abort();
        }
        state.resolving = false;
        state.lb_policy = None;
        state.lb_policy_name = None;
        state.lb_config = None;
        drop(state);
        self.resolved_tx.send_replace(false);
        self.disconnect_error
            .store(Some(Arc::new(Status::unavailable("channel entered IDLE").with_idle_reentry())));
        self.publish_picker(ConnectivityState::Idle, Arc::new(QueuingPicker));
    }

    fn shutdown_locked(self: &Arc<Self>) {
        let mut state = self.mutable.lock().unwrap();
        if let Some(task) = state.resolver_task.take() {
            task.abort();
        }
        state.lb_policy = None;
        state.lb_policy_name = None;
        state.lb_config = None;
        drop(state);
        self.disconnect_error.store(Some(Arc::new(Status::unavailable("channel shut down"))));
        // Wake any call still parked in the resolution gate so shutdown
        // fails it instead of leaving it queued forever ("Shutdown races
        // cancel").
        self.resolved_tx.send_replace(true);
        self.publish_picker(
            ConnectivityState::Shutdown,
            Arc::new(FailingPicker::new(Status::unavailable("channel shut down"))),
        );
    }

    fn spawn_idle_timer(self: Arc<Self>) {
        let runtime = self.runtime.clone();
        let check_interval = (self.idle_timeout / 2).max(Duration::from_secs(1));
        self.runtime.clone().spawn(Box::pin(async move {
            loop {
                runtime.sleep(check_interval).await;
                let idle_for = self.last_activity.lock().unwrap().elapsed();
                if idle_for >= self.idle_timeout {
                    let data = self.clone();
                    self.work_serializer.submit(move || data.enter_idle());
                }
            }
        }));
    }

    /// Chooses the LB policy and its parsed config for `service_config`,
    /// preferring `loadBalancingConfig`, then the legacy
    /// `loadBalancingPolicy` name, then this channel's configured default.
    fn select_lb_policy(&self, service_config: &ServiceConfig) -> (String, Option<Box<dyn LbConfig>>) {
        if let Some(serde_json::Value::Array(entries)) = &service_config.load_balancing_config {
            if let Some(serde_json::Value::Object(map)) = entries.first() {
                if let Some((name, cfg)) = map.iter().next() {
                    if let Some(builder) = self.lb_registry().get_policy(name) {
                        match builder.parse_config(cfg) {
                            Ok(parsed) => return (name.clone(), Some(parsed)),
                            Err(e) => {
                                warn!(policy = %name, error = %e, "ignoring invalid loadBalancingConfig entry");
                            }
                        }
                    } else {
                        warn!(policy = %name, "loadBalancingConfig names an unregistered LB policy");
                    }
                }
            }
        }
        if let Some(name) = &service_config.load_balancing_policy {
            if self.lb_registry().get_policy(name).is_some() {
                return (name.clone(), None);
            }
        }
        (self.default_lb_policy.clone(), None)
    }

    fn create_subchannel(self: &Arc<Self>, address: &Address) -> Subchannel {
        // `ChannelController::new_subchannel` has no fallible return -- an LB
        // policy cannot recover from a missing transport mid-pick, so a
        // resolver producing an address type this channel has no transport
        // for is a configuration error, not a runtime condition to retry.
        let transport = self
            .transport_registry()
            .get_transport(&address.address_type)
            .unwrap_or_else(|| panic!("no transport registered for address type {:?}", address.address_type));
        let internal = self.subchannel_pool().new_subchannel(address, transport, self.runtime.clone());
        let subchannel = lb::Subchannel(internal);
        subchannel.watch_connectivity_state(Arc::new(SubchannelForwarder {
            data: self.clone(),
            subchannel: subchannel.clone(),
        }));
        subchannel
    }

    /// Applies a resolver update to the LB policy, lazily constructing (or
    /// swapping) it first if the selected policy name changed ("On every
    /// resolver result").
    fn handle_resolver_update(
        self: &Arc<Self>,
        update: ResolverUpdate,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut state = self.mutable.lock().unwrap();
        match update {
            ResolverUpdate::Err(e) => {
                debug!(target = %self.target, error = %e, "name resolution reported an error");
                if state.lb_policy.is_none() {
                    drop(state);
                    self.publish_picker(
                        ConnectivityState::TransientFailure,
                        Arc::new(FailingPicker::new(Status::unavailable(format!(
                            "name resolution failed: {e}"
                        )))),
                    );
                    self.resolved_tx.send_replace(true);
                    return Ok(());
                }
                let config = state.lb_config.as_deref();
                let policy = state.lb_policy.as_mut().unwrap();
                let mut controller = LbControllerImpl { data: self };
                let result = policy.resolver_update(ResolverUpdate::Err(e), config, &mut controller);
                drop(state);
                self.resolved_tx.send_replace(true);
                result
            }
            ResolverUpdate::Data(data_update) => {
                trace!(target = %self.target, endpoints = data_update.endpoints.len(), "resolver produced data");
                let service_config = data_update
                    .service_config
                    .clone()
                    .unwrap_or_else(|| self.default_service_config.clone());
                self.config_selector.store(data_update.config_selector.clone());

                let (policy_name, parsed_config) = self.select_lb_policy(&service_config);
                state.service_config = service_config;

                if state.lb_policy_name.as_deref() != Some(policy_name.as_str()) {
                    let builder = self
                        .lb_registry()
                        .get_policy(&policy_name)
                        .ok_or_else(|| format!("no LB policy registered under {policy_name:?}"))?;
                    let scheduler: Arc<dyn WorkScheduler> =
                        Arc::new(ChannelWorkScheduler { data: Arc::downgrade(self) });
                    state.lb_policy = Some(builder.build(LbPolicyOptions { work_scheduler: scheduler }));
                    state.lb_policy_name = Some(policy_name);
                }
                state.lb_config = parsed_config;

                let config = state.lb_config.as_deref();
                let policy = state.lb_policy.as_mut().unwrap();
                let mut controller = LbControllerImpl { data: self };
                let result = policy.resolver_update(ResolverUpdate::Data(data_update), config, &mut controller);
                drop(state);
                self.resolved_tx.send_replace(true);
                result
            }
        }
    }

    fn handle_subchannel_update(self: &Arc<Self>, subchannel: Subchannel, state: ConnectivityState, error: Option<Status>) {
        let mut mstate = self.mutable.lock().unwrap();
        let Some(policy) = mstate.lb_policy.as_mut() else {
            return;
        };
        let sc_state = SubchannelState {
            connectivity_state: state,
            last_connection_error: error.map(|e| Arc::new(e) as Arc<dyn Error + Send + Sync>),
        };
        let mut controller = LbControllerImpl { data: self };
        policy.subchannel_update(&subchannel, &sc_state, &mut controller);
    }
}

struct LbControllerImpl<'a> {
    data: &'a Arc<ChannelData>,
}

impl<'a> LbChannelController for LbControllerImpl<'a> {
    fn new_subchannel(&mut self, address: &Address) -> Subchannel {
        self.data.create_subchannel(address)
    }

    fn update_picker(&mut self, update: LbState) {
        self.data.publish_picker(update.connectivity_state, update.picker);
    }

    fn request_resolution(&mut self) {
        self.data.resolve_now.notify_one();
    }
}

struct ChannelWorkScheduler {
    data: Weak<ChannelData>,
}

impl WorkScheduler for ChannelWorkScheduler {
    fn schedule_work(&self) {
        let Some(data) = self.data.upgrade() else {
            return;
        };
        data.work_serializer.submit(move || {
            let mut state = data.mutable.lock().unwrap();
            if let Some(policy) = state.lb_policy.as_mut() {
                let mut controller = LbControllerImpl { data: &data };
                policy.work(&mut controller);
            }
        });
    }
}

struct SubchannelForwarder {
    data: Arc<ChannelData>,
    subchannel: Subchannel,
}

impl SubchannelConnectivityWatcher for SubchannelForwarder {
    fn on_state_change(&self, state: ConnectivityState, status: Option<Status>, _transport: Option<Arc<dyn Service>>) {
        let data = self.data.clone();
        let subchannel = self.subchannel.clone();
        self.data.work_serializer.submit(move || {
            data.handle_subchannel_update(subchannel, state, status);
        });
    }
}

struct ResolverControllerImpl {
    data: Arc<ChannelData>,
}

#[async_trait]
impl ResolverChannelController for ResolverControllerImpl {
    async fn update(&self, update: ResolverUpdate) -> Result<(), Box<dyn Error + Send + Sync>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let data = self.data.clone();
        data.work_serializer.submit(move || {
            let result = data.handle_resolver_update(update);
            let _ = tx.send(result);
        });
        rx.await
            .map_err(|_| -> Box<dyn Error + Send + Sync> { "channel shut down before resolver update was processed".into() })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `Channel::new` spawns a background idle timer via the configured
    // `Runtime`, which needs a live Tokio reactor even though construction
    // itself never awaits anything.
    #[tokio::test]
    async fn new_channel_starts_idle() {
        let channel = Channel::new("inmemory:///test-service", ChannelOptions::default()).unwrap();
        assert_eq!(channel.check_connectivity_state(), ConnectivityState::Idle);
    }

    #[tokio::test]
    async fn rejects_unparseable_targets() {
        let result = Channel::new("not a url", ChannelOptions::default());
        assert!(result.is_err());
    }

    /// A later resolver update's config is observable to subsequent reads,
    /// but a call that
    /// already captured an earlier config's snapshot (the way `call.rs`'s
    /// `apply_service_config` does, once, at call start) is unaffected by
    /// the later `handle_resolver_update` that happens after it captured
    /// that snapshot.
    #[tokio::test]
    async fn later_resolver_update_does_not_retroactively_change_an_already_captured_config() {
        let channel = Channel::new("inmemory:///svc", ChannelOptions::default()).unwrap();
        let data = channel.inner.clone();

        let config_a = ServiceConfig::parse(
            r#"{"methodConfig": [{"name": [{"service": "svc"}], "timeout": "5s"}]}"#,
        )
        .unwrap();
        data.handle_resolver_update(ResolverUpdate::Data(super::super::name_resolution::ResolverData {
            service_config: Some(config_a),
            ..Default::default()
        }))
        .unwrap();

        // A call starting "now" captures this snapshot, the way `call.rs`
        // does via `current_service_config()`.
        let captured = data.current_service_config().method_config("/svc/M").unwrap().timeout;
        assert_eq!(captured, Some(std::time::Duration::from_secs(5)));

        let config_b = ServiceConfig::parse(
            r#"{"methodConfig": [{"name": [{"service": "svc"}], "timeout": "1s"}]}"#,
        )
        .unwrap();
        data.handle_resolver_update(ResolverUpdate::Data(super::super::name_resolution::ResolverData {
            service_config: Some(config_b),
            ..Default::default()
        }))
        .unwrap();

        // The already-captured value is untouched...
        assert_eq!(captured, Some(std::time::Duration::from_secs(5)));
        // ...while a fresh read (a new call) sees the new config.
        let fresh = data.current_service_config().method_config("/svc/M").unwrap().timeout;
        assert_eq!(fresh, Some(std::time::Duration::from_secs(1)));
    }
}
