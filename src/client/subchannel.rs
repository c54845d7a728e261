//! The `Subchannel` state machine: one logical connection to one
//! resolved address, owning its own reconnect backoff and a set of
//! connectivity-state watchers.
//!
//! Grounded on the event-driven design in the sibling `hyperium-tonic` repo's
//! `client::subchannel` (a later, more complete draft of this same
//! subsystem): a dedicated task owns the state machine and processes events
//! from an unbounded channel, so every state transition happens on one task
//! with no lock held across an `.await`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::client::backoff::{BackoffConfig, ExponentialBackoff};
use crate::client::connectivity::ConnectivityState;
use crate::client::name_resolution::Address;
use crate::client::transport::Transport;
use crate::rt::Runtime;
use crate::service::Service;
use crate::status::Status;

/// Identifies a subchannel within a pool: the resolved address plus whatever
/// subset of channel args is relevant to connection identity. This crate
/// does not yet have channel args that affect transport identity beyond the
/// address itself, so the "relevant subset" is empty today; the field exists
/// so a future arg (e.g. a per-address TLS override) has somewhere to live
/// without changing the pool's key type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubchannelKey {
    pub address_type: String,
    pub address: String,
}

impl SubchannelKey {
    pub fn new(address: &Address) -> Self {
        Self {
            address_type: address.address_type.clone(),
            address: address.address.clone(),
        }
    }
}

impl fmt::Display for SubchannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address_type, self.address)
    }
}

/// Notified once per connectivity transition (`WatchConnectivityState`).
pub trait ConnectivityWatcher: Send + Sync {
    fn on_state_change(&self, state: ConnectivityState, status: Option<Status>, transport: Option<Arc<dyn Service>>);
}

enum Event {
    ConnectRequested,
    ConnectSucceeded(Arc<dyn Service>, oneshot::Receiver<()>),
    ConnectFailed(Status),
    Disconnected,
    BackoffExpired,
    ResetBackoff,
}

struct Inner {
    state: ConnectivityState,
    last_error: Option<Status>,
    transport: Option<Arc<dyn Service>>,
    watchers: Vec<Arc<dyn ConnectivityWatcher>>,
}

/// One logical connection to one endpoint. Weakly held by the
/// [`SubchannelPool`](super::subchannel_pool::SubchannelPool); strongly held
/// by each LB-facing wrapper that references it, so the state machine's task
/// (and any connection it holds open) is torn down only once the last
/// wrapper drops.
pub struct InternalSubchannel {
    key: SubchannelKey,
    transport: Arc<dyn Transport>,
    runtime: Arc<dyn Runtime>,
    backoff: ExponentialBackoff,
    keepalive_ms: AtomicU64,
    events: mpsc::UnboundedSender<Event>,
    inner: Mutex<Inner>,
}

impl InternalSubchannel {
    pub(crate) fn new(key: SubchannelKey, transport: Arc<dyn Transport>, runtime: Arc<dyn Runtime>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sc = Arc::new(Self {
            key,
            transport,
            runtime: runtime.clone(),
            backoff: ExponentialBackoff::new(BackoffConfig::default()).expect("default backoff config is valid"),
            keepalive_ms: AtomicU64::new(u64::MAX),
            events: tx,
            inner: Mutex::new(Inner {
                state: ConnectivityState::Idle,
                last_error: None,
                transport: None,
                watchers: Vec::new(),
            }),
        });
        runtime.spawn(Box::pin(Self::run(sc.clone(), rx)));
        sc
    }

    pub fn key(&self) -> &SubchannelKey {
        &self.key
    }

    pub fn address(&self) -> Address {
        Address {
            address_type: self.key.address_type.clone(),
            address: self.key.address.clone(),
            attributes: Default::default(),
        }
    }

    pub fn current_state(&self) -> ConnectivityState {
        self.inner.lock().unwrap().state
    }

    pub fn connected_transport(&self) -> Option<Arc<dyn Service>> {
        self.inner.lock().unwrap().transport.clone()
    }

    /// Registers `watcher`, immediately delivering the current state -- the
    /// initial delivery counts as the first transition a fresh watcher
    /// observes.
    pub fn watch_connectivity_state(&self, watcher: Arc<dyn ConnectivityWatcher>) {
        let mut inner = self.inner.lock().unwrap();
        watcher.on_state_change(inner.state, inner.last_error.clone(), inner.transport.clone());
        inner.watchers.push(watcher);
    }

    pub fn cancel_connectivity_state_watch(&self, watcher: &Arc<dyn ConnectivityWatcher>) {
        self.inner.lock().unwrap().watchers.retain(|w| !Arc::ptr_eq(w, watcher));
    }

    /// A no-op unless the subchannel is `IDLE`.
    pub fn request_connection(&self) {
        let _ = self.events.send(Event::ConnectRequested);
    }

    /// Forces any pending backoff timer to fire immediately and resets the
    /// backoff formula.
    pub fn reset_backoff(&self) {
        let _ = self.events.send(Event::ResetBackoff);
    }

    /// Monotonically raises the keepalive interval used by *future*
    /// transports this subchannel creates, e.g. in response to a
    /// GOAWAY-style "ENHANCE_YOUR_CALM" hint from the peer asking for less
    /// frequent pings.
    pub fn throttle_keepalive_time(&self, new_ms: u64) {
        self.keepalive_ms.fetch_max(new_ms, Ordering::Relaxed);
    }

    fn notify(&self, state: ConnectivityState, status: Option<Status>, transport: Option<Arc<dyn Service>>) {
        let watchers = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = state;
            inner.last_error = status.clone();
            inner.transport = transport.clone();
            inner.watchers.clone()
        };
        for w in watchers {
            w.on_state_change(state, status.clone(), transport.clone());
        }
    }

    fn spawn_connect(self: &Arc<Self>) {
        let transport = self.transport.clone();
        let address = self.key.address.clone();
        let keepalive_ms = self.keepalive_ms.load(Ordering::Relaxed);
        let tx = self.events.clone();
        self.runtime.spawn(Box::pin(async move {
            match transport.connect(address, keepalive_ms).await {
                Ok(connected) => {
                    let _ = tx.send(Event::ConnectSucceeded(connected.service, connected.disconnected));
                }
                Err(status) => {
                    let _ = tx.send(Event::ConnectFailed(status));
                }
            }
        }));
    }

    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            match event {
                Event::ConnectRequested => {
                    if self.current_state() != ConnectivityState::Idle {
                        continue;
                    }
                    self.notify(ConnectivityState::Connecting, None, None);
                    self.spawn_connect();
                }
                Event::ConnectSucceeded(service, disconnected) => {
                    self.backoff.reset();
                    self.notify(ConnectivityState::Ready, None, Some(service));
                    let tx = self.events.clone();
                    self.runtime.spawn(Box::pin(async move {
                        let _ = disconnected.await;
                        let _ = tx.send(Event::Disconnected);
                    }));
                }
                Event::ConnectFailed(status) => {
                    self.notify(ConnectivityState::TransientFailure, Some(status), None);
                    let delay = self.backoff.next_backoff();
                    let tx = self.events.clone();
                    let runtime = self.runtime.clone();
                    self.runtime.spawn(Box::pin(async move {
                        runtime.sleep(delay).await;
                        let _ = tx.send(Event::BackoffExpired);
                    }));
                }
                Event::Disconnected => {
                    self.notify(ConnectivityState::Idle, None, None);
                }
                Event::BackoffExpired => {
                    // Re-enter CONNECTING directly rather than IDLE: a
                    // subchannel that just failed keeps retrying on its own
                    // schedule until the LB policy stops asking for it.
                    self.notify(ConnectivityState::Connecting, None, None);
                    self.spawn_connect();
                }
                Event::ResetBackoff => {
                    self.backoff.reset();
                    if self.current_state() == ConnectivityState::TransientFailure {
                        let _ = self.events.send(Event::BackoffExpired);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for InternalSubchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subchannel({})", self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::Connected;
    use crate::rt::TokioRuntime;
    use std::sync::atomic::AtomicUsize;
    use tonic::async_trait;

    struct AlwaysFails;

    #[async_trait]
    impl Transport for AlwaysFails {
        async fn connect(&self, _address: String, _keepalive_ms: u64) -> Result<Connected, Status> {
            Err(Status::unavailable("refused"))
        }

        fn scheme(&self) -> &'static str {
            "test"
        }
    }

    struct Recorder(Mutex<Vec<ConnectivityState>>);

    impl ConnectivityWatcher for Recorder {
        fn on_state_change(&self, state: ConnectivityState, _status: Option<Status>, _transport: Option<Arc<dyn Service>>) {
            self.0.lock().unwrap().push(state);
        }
    }

    struct Counter(Arc<AtomicUsize>);

    impl ConnectivityWatcher for Counter {
        fn on_state_change(&self, _state: ConnectivityState, _status: Option<Status>, _transport: Option<Arc<dyn Service>>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn starts_idle() {
        let key = SubchannelKey { address_type: "tcp".into(), address: "10.0.0.1:80".into() };
        let sc = InternalSubchannel::new(key, Arc::new(AlwaysFails), Arc::new(TokioRuntime));
        assert_eq!(sc.current_state(), ConnectivityState::Idle);
    }

    #[tokio::test]
    async fn request_connection_is_noop_unless_idle() {
        let key = SubchannelKey { address_type: "tcp".into(), address: "10.0.0.1:80".into() };
        let sc = InternalSubchannel::new(key, Arc::new(AlwaysFails), Arc::new(TokioRuntime));
        let count = Arc::new(AtomicUsize::new(0));
        sc.watch_connectivity_state(Arc::new(Counter(count.clone())));
        sc.request_connection();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(count.load(Ordering::SeqCst) >= 2); // initial delivery + CONNECTING
    }

    #[tokio::test]
    async fn failed_connect_reaches_transient_failure() {
        let key = SubchannelKey { address_type: "tcp".into(), address: "10.0.0.1:80".into() };
        let sc = InternalSubchannel::new(key, Arc::new(AlwaysFails), Arc::new(TokioRuntime));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        sc.watch_connectivity_state(recorder.clone());
        sc.request_connection();
        for _ in 0..50 {
            if recorder.0.lock().unwrap().contains(&ConnectivityState::TransientFailure) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(recorder.0.lock().unwrap().contains(&ConnectivityState::TransientFailure));
    }

    #[tokio::test]
    async fn throttle_keepalive_time_only_raises() {
        let key = SubchannelKey { address_type: "tcp".into(), address: "10.0.0.1:80".into() };
        let sc = InternalSubchannel::new(key, Arc::new(AlwaysFails), Arc::new(TokioRuntime));
        assert_eq!(sc.keepalive_ms.load(Ordering::Relaxed), u64::MAX);

        sc.throttle_keepalive_time(30_000);
        assert_eq!(sc.keepalive_ms.load(Ordering::Relaxed), 30_000);

        sc.throttle_keepalive_time(10_000);
        assert_eq!(sc.keepalive_ms.load(Ordering::Relaxed), 30_000, "a lower hint must not lower an already-raised value");

        sc.throttle_keepalive_time(60_000);
        assert_eq!(sc.keepalive_ms.load(Ordering::Relaxed), 60_000);
    }
}
