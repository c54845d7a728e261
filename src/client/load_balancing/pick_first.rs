//! `pick_first`: connects to addresses from the
//! resolver in order, advancing to the next address on failure and
//! re-requesting resolution once the whole list is exhausted. Publishes a
//! picker that routes every call to whichever address most recently reached
//! `READY`.

use std::error::Error;
use std::sync::Arc;

use crate::client::connectivity::ConnectivityState;
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::service::Request;
use crate::status::Status;

use super::{
    ChannelController, FailingPicker, LbConfig, LbPolicy, LbPolicyBuilder, LbPolicyOptions,
    LbState, Pick, PickResult, Picker, Subchannel, SubchannelState, WorkScheduler,
};

pub static POLICY_NAME: &str = "pick_first";

#[derive(Default)]
pub struct Builder;

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(Policy {
            work_scheduler: options.work_scheduler,
            addresses: Vec::new(),
            index: 0,
            current: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

struct Policy {
    #[allow(dead_code)]
    work_scheduler: Arc<dyn WorkScheduler>,
    addresses: Vec<Address>,
    /// Index into `addresses` of the address `current` is trying (or is
    /// connected to).
    index: usize,
    current: Option<Subchannel>,
}

impl Policy {
    fn connect_to(&mut self, idx: usize, channel_controller: &mut dyn ChannelController) {
        self.index = idx;
        let sc = channel_controller.new_subchannel(&self.addresses[idx]);
        sc.connect();
        self.current = Some(sc);
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(super::QueuingPicker),
        });
    }

    fn exhausted(&mut self, channel_controller: &mut dyn ChannelController) {
        channel_controller.request_resolution();
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(FailingPicker::new(Status::unavailable(
                "pick_first: all addresses failed",
            ))),
        });
        // Start over at the top of the list for the next resolver update or
        // manual reconnect, matching the standard pick_first retry shape.
        self.index = 0;
    }
}

impl LbPolicy for Policy {
    fn resolver_update(
        &mut self,
        resolver_update: ResolverUpdate,
        _config: Option<&dyn LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let ResolverUpdate::Data(data) = resolver_update else {
            return Err("pick_first requires resolver data, not an error".into());
        };
        let addresses: Vec<Address> = data.endpoints.into_iter().flat_map(|e| e.addresses).collect();
        if addresses.is_empty() {
            self.addresses.clear();
            self.current = None;
            channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::TransientFailure,
                picker: Arc::new(FailingPicker::new(Status::unavailable(
                    "pick_first: resolver produced an empty address list",
                ))),
            });
            return Ok(());
        }
        self.addresses = addresses;
        self.connect_to(0, channel_controller);
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if self.current.as_ref() != Some(subchannel) {
            // Stale report from an address we've already moved past.
            return;
        }
        match state.connectivity_state {
            ConnectivityState::Ready => {
                channel_controller.update_picker(LbState {
                    connectivity_state: ConnectivityState::Ready,
                    picker: Arc::new(OneSubchannelPicker { sc: subchannel.clone() }),
                });
            }
            ConnectivityState::TransientFailure => {
                let next = self.index + 1;
                if next < self.addresses.len() {
                    self.connect_to(next, channel_controller);
                } else {
                    self.exhausted(channel_controller);
                }
            }
            ConnectivityState::Idle | ConnectivityState::Connecting => {
                channel_controller.update_picker(LbState {
                    connectivity_state: ConnectivityState::Connecting,
                    picker: Arc::new(super::QueuingPicker),
                });
            }
            ConnectivityState::Shutdown => {}
        }
    }
}

struct OneSubchannelPicker {
    sc: Subchannel,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Complete(Pick {
            subchannel: self.sc.clone(),
            on_complete: None,
            metadata: None,
        })
    }
}
