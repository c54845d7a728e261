//! End-to-end exercises of the call pipeline: resolution → LB pick →
//! subchannel dispatch, driven entirely through the
//! public `Channel` API against the crate's own in-memory transport/resolver
//! fixture plus a couple of purpose-built test doubles for scenarios the
//! fixture alone can't produce (a resolver error, a flaky transport).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};
use tonic::async_trait;
use url::Url;

use grpc::client::load_balancing::{
    ChannelController as LbChannelController, FailingPicker, LbConfig, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbPolicyRegistry, LbState, SubchannelState,
};
use grpc::client::name_resolution::{
    Address, ChannelController as ResolverChannelController, Endpoint, Resolver, ResolverBuilder,
    ResolverData, ResolverOptions, ResolverRegistry, ResolverUpdate, SharedResolverBuilder,
};
use grpc::client::transport::{Connected, Transport, TransportRegistry};
use grpc::client::{Channel, ChannelOptions, ConnectivityState};
use grpc::inmemory;
use grpc::server::Listener as ServerListener;
use grpc::service::{Request, Response, Service};
use grpc::status::Code;

fn unary(method: &str) -> Request {
    Request::unary(method, Bytes::new())
}

/// Happy path: one address, default `pick_first`, a call with only
/// `send_initial_metadata` drives the whole pipeline end to end.
#[tokio::test]
async fn happy_path_reaches_ready_and_completes_call() {
    inmemory::register();
    let listener = inmemory::Listener::new();
    let target = listener.target();

    let server = tokio::spawn(async move {
        let (request, reply_to) = listener.accept().await.unwrap();
        assert_eq!(request.method(), "/svc.Greeter/SayHello");
        let (_tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = reply_to.send(Response::ok(rx));
    });

    let channel = Channel::new(&target, ChannelOptions::default()).unwrap();
    assert_eq!(channel.check_connectivity_state(), ConnectivityState::Idle);

    let response = channel.call(unary("/svc.Greeter/SayHello")).await;
    assert_eq!(response.status().code(), Code::Ok);
    assert_eq!(channel.check_connectivity_state(), ConnectivityState::Ready);

    server.await.unwrap();
}

struct FailResolverBuilder;

impl ResolverBuilder for FailResolverBuilder {
    fn build(&self, _target: Url, _resolve_now: Arc<Notify>, _options: ResolverOptions) -> Box<dyn Resolver> {
        Box::new(FailResolver)
    }

    fn scheme(&self) -> &'static str {
        "failres"
    }
}

struct FailResolver;

#[async_trait]
impl Resolver for FailResolver {
    async fn start(&mut self, channel_controller: Box<dyn ResolverChannelController>) {
        let _ = channel_controller.update(ResolverUpdate::Err("synthetic resolver failure".into())).await;
    }
}

/// Fail-fast on transient failure: a resolver that only ever reports an
/// error and a call without `WAIT_FOR_READY` fails immediately with
/// `UNAVAILABLE` instead of queueing.
#[tokio::test]
async fn fail_fast_on_resolver_error_without_wait_for_ready() {
    let registry = ResolverRegistry::new();
    registry.add_builder(SharedResolverBuilder::new(FailResolverBuilder));
    let options = ChannelOptions {
        resolver_registry: Some(Arc::new(registry)),
        ..ChannelOptions::default()
    };

    let channel = Channel::new("failres:///x", options).unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), channel.call(unary("/svc.Greeter/SayHello")))
        .await
        .expect("non-wait-for-ready call must not hang on a resolver error");
    assert_eq!(response.status().code(), Code::Unavailable);
}

struct FlakyResolverBuilder;

impl ResolverBuilder for FlakyResolverBuilder {
    fn build(&self, _target: Url, _resolve_now: Arc<Notify>, _options: ResolverOptions) -> Box<dyn Resolver> {
        Box::new(FlakyResolver)
    }

    fn scheme(&self) -> &'static str {
        "flaky"
    }
}

struct FlakyResolver;

#[async_trait]
impl Resolver for FlakyResolver {
    async fn start(&mut self, channel_controller: Box<dyn ResolverChannelController>) {
        let address = Address { address_type: "flaky".into(), address: "x".into(), ..Default::default() };
        let update = ResolverUpdate::Data(ResolverData {
            endpoints: vec![Endpoint { addresses: vec![address], ..Default::default() }],
            ..Default::default()
        });
        let _ = channel_controller.update(update).await;
    }
}

struct EchoService;

#[async_trait]
impl Service for EchoService {
    async fn call(&self, _request: Request) -> Response {
        let (_tx, rx) = tokio::sync::mpsc::channel(1);
        Response::ok(rx)
    }
}

/// A transport that fails its first `failures_left` connection attempts,
/// then succeeds and stays connected, to drive a subchannel through
/// `CONNECTING -> TRANSIENT_FAILURE -> ... -> READY` the way a real backend
/// recovering from an outage would.
struct FlakyTransport {
    failures_left: AtomicUsize,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn connect(&self, _address: String, _keepalive_ms: u64) -> Result<Connected, grpc::status::Status> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(grpc::status::Status::unavailable("connection refused"));
        }
        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        std::mem::forget(disconnect_tx);
        Ok(Connected { service: Arc::new(EchoService), disconnected: disconnect_rx })
    }

    fn scheme(&self) -> &'static str {
        "flaky"
    }
}

/// Wait-for-ready queueing: the call is issued before the subchannel is
/// usable, survives multiple connection failures without completing, and
/// proceeds once the backend recovers -- for a wait-for-ready call, any
/// finite sequence of picker failures followed by one `Complete` pick
/// eventually lets the call proceed.
#[tokio::test]
async fn wait_for_ready_queues_through_failures_then_succeeds() {
    let resolver_registry = ResolverRegistry::new();
    resolver_registry.add_builder(SharedResolverBuilder::new(FlakyResolverBuilder));

    let transport_registry = TransportRegistry::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    transport_registry.add_transport(FlakyTransport {
        failures_left: AtomicUsize::new(2),
        attempts: attempts.clone(),
    });

    let options = ChannelOptions {
        resolver_registry: Some(Arc::new(resolver_registry)),
        transport_registry: Some(Arc::new(transport_registry)),
        ..ChannelOptions::default()
    };
    let channel = Channel::new("flaky:///x", options).unwrap();

    let request = unary("/svc.Greeter/SayHello").with_wait_for_ready(true);
    let response = tokio::time::timeout(Duration::from_secs(15), channel.call(request))
        .await
        .expect("wait-for-ready call must eventually proceed once the backend recovers");
    assert_eq!(response.status().code(), Code::Ok);
    assert!(attempts.load(Ordering::SeqCst) >= 3, "expected at least 2 failed attempts before the successful one");
}

/// Shutdown races cancel, simplified to the resolver-less half: a call
/// parked on the pick-waiting queue because no resolver is registered for
/// its scheme completes exactly once, with the disconnect error, once the
/// channel shuts down -- it must not hang forever.
#[tokio::test]
async fn shutdown_fails_a_call_queued_with_no_usable_resolver() {
    let channel = Channel::new("no-such-scheme:///x", ChannelOptions::default()).unwrap();

    let call_channel = channel.clone();
    let call_task = tokio::spawn(async move {
        call_channel.call(unary("/svc.Greeter/SayHello").with_wait_for_ready(true)).await
    });

    // Give the call a moment to reach TRANSIENT_FAILURE and park on the
    // pick-waiting queue before shutting the channel down underneath it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    channel.shutdown();

    let response = tokio::time::timeout(Duration::from_secs(5), call_task)
        .await
        .expect("shutdown must wake a queued call instead of leaving it parked forever")
        .unwrap();
    assert_eq!(response.status().code(), Code::Unavailable);

    // And a call placed after shutdown fails immediately too.
    let after_shutdown = channel.call(unary("/svc.Greeter/SayHello")).await;
    assert_eq!(after_shutdown.status().code(), Code::Unavailable);
}

struct DropAllBuilder;

impl LbPolicyBuilder for DropAllBuilder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(DropAllPolicy)
    }

    fn name(&self) -> &'static str {
        "drop_all"
    }
}

/// An LB policy that drops every call without ever creating a subchannel,
/// exercising the same "deliberate drop, distinct from connection failure"
/// outcome a real weighted or ring-hash policy can report.
struct DropAllPolicy;

impl LbPolicy for DropAllPolicy {
    fn resolver_update(
        &mut self,
        _resolver_update: ResolverUpdate,
        _config: Option<&dyn LbConfig>,
        channel_controller: &mut dyn LbChannelController,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(FailingPicker::new(
                grpc::status::Status::unavailable("dropped by policy").with_lb_drop(),
            )),
        });
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        _subchannel: &grpc::client::load_balancing::Subchannel,
        _state: &SubchannelState,
        _channel_controller: &mut dyn LbChannelController,
    ) {
    }
}

/// LB drop: the LB policy's picker fails every call tagged
/// `LB_POLICY_DROP` without any subchannel ever being created or
/// connected.
#[tokio::test]
async fn lb_policy_drop_fails_the_call_without_a_subchannel_attempt() {
    let resolver_registry = ResolverRegistry::new();
    resolver_registry.add_builder(SharedResolverBuilder::new(FlakyResolverBuilder));

    let lb_registry = LbPolicyRegistry::new();
    lb_registry.add_builder(DropAllBuilder);

    let options = ChannelOptions {
        resolver_registry: Some(Arc::new(resolver_registry)),
        lb_registry: Some(Arc::new(lb_registry)),
        default_lb_policy: "drop_all".to_string(),
        ..ChannelOptions::default()
    };
    let channel = Channel::new("flaky:///x", options).unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), channel.call(unary("/svc.Greeter/SayHello")))
        .await
        .expect("an LB drop must fail the call promptly, not hang");
    assert_eq!(response.status().code(), Code::Unavailable);
    assert!(response.status().is_lb_drop(), "a dropped call's status must be tagged LB_POLICY_DROP");
}
