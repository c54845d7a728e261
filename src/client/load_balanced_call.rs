//! `LoadBalancedCall`: the data-plane loop that turns one outgoing
//! [`Request`] into a pick, dispatches it to the picked subchannel's
//! transport, and retries the pick (but never the call itself -- that is
//! `call.rs`'s and the yet-unbuilt retry filter's job) while the channel is
//! queuing or recovering.

use tonic::async_trait;

use super::channel::ChannelData;
use super::load_balancing::PickResult;
use crate::service::{Request, Response};
use crate::status::Status;

use super::filters::Terminal;

/// The terminal stage of a call's filter stack: picks a subchannel from the
/// channel's current picker and dispatches the call to it, re-picking as the
/// channel's connectivity changes (the picker's queued/failed outcomes).
pub struct LoadBalancedCall {
    channel: std::sync::Arc<ChannelData>,
}

impl LoadBalancedCall {
    pub fn new(channel: std::sync::Arc<ChannelData>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Terminal for LoadBalancedCall {
    async fn call(&self, request: Request) -> Response {
        let mut request = request;
        let mut picker_rx = self.channel.subscribe_picker();
        loop {
            if let Some(status) = self.channel.disconnect_error() {
                if status.is_idle_reentry() {
                    self.channel.clone().exit_idle();
                    if picker_rx.changed().await.is_err() {
                        return Response::fail(Status::unavailable("channel shut down"));
                    }
                    continue;
                }
                return Response::fail((*status).clone());
            }

            let picker = picker_rx.borrow_and_update().clone();
            match picker.pick(&request) {
                PickResult::Complete(pick) => {
                    let Some(service) = pick.subchannel.connected_service() else {
                        // The subchannel went down between when the picker was
                        // built and now; wait for a fresh picker and retry.
                        if picker_rx.changed().await.is_err() {
                            return Response::fail(Status::unavailable("channel shut down mid-pick"));
                        }
                        continue;
                    };
                    let response = service.call(request).await;
                    if let Some(on_complete) = pick.on_complete {
                        on_complete(&response);
                    }
                    return response;
                }
                PickResult::Queue => {
                    if picker_rx.changed().await.is_err() {
                        return Response::fail(Status::unavailable("channel shut down while queued"));
                    }
                }
                PickResult::Fail(status) => {
                    if request.wait_for_ready() && status.is_retriable_for_wait_for_ready() {
                        if picker_rx.changed().await.is_err() {
                            return Response::fail(status);
                        }
                        continue;
                    }
                    return Response::fail(status);
                }
            }
        }
    }
}
