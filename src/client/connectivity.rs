//! Connectivity-state tracking and the watcher mechanism external callers
//! (and the channel's own LB policy / idle timer) use to observe it.
//!
//! Generalizes the ad hoc `Watcher<T>`/`WatcherIter<T>` pair that used to
//! live inline in `channel.rs` into a reusable broadcast-style watcher keyed
//! on `ConnectivityState` specifically, since state values are small `Copy`
//! enums rather than arbitrary `T` and don't need `Arc` wrapping.

use tokio::sync::watch;

/// The channel (or subchannel) connectivity states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// Publishes connectivity-state transitions and lets any number of
/// observers wait for a change away from a given state, matching the
/// `wait_for_state_change(source, deadline)` shape external callers expect.
pub struct ConnectivityStateTracker {
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityStateTracker {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    /// Publishes a new state. Only ever called from within the channel's
    /// `WorkSerializer` so transitions are strictly ordered.
    pub fn set(&self, state: ConnectivityState) {
        // `send_replace` rather than `send` since a tracker with no
        // subscribers left (e.g. brand new, before any watcher is
        // registered) is still a valid place to publish state.
        self.tx.send_replace(state);
    }

    pub fn subscribe(&self) -> StateWatcher {
        StateWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

/// A single observer's view onto a [`ConnectivityStateTracker`].
pub struct StateWatcher {
    rx: watch::Receiver<ConnectivityState>,
}

impl StateWatcher {
    pub fn current(&self) -> ConnectivityState {
        *self.rx.borrow()
    }

    /// Waits until the tracked state differs from `source`, returning the
    /// new state. Returns `None` if the tracker was dropped (channel
    /// shutdown with no further transitions coming).
    pub async fn wait_for_state_change(&mut self, source: ConnectivityState) -> Option<ConnectivityState> {
        loop {
            if *self.rx.borrow() != source {
                return Some(*self.rx.borrow());
            }
            self.rx.changed().await.ok()?;
        }
    }
}
