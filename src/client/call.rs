//! `CallData`: what happens to one application-initiated call before
//! it becomes a [`LoadBalancedCall`](super::load_balanced_call::LoadBalancedCall)
//! pick loop -- waiting out the "resolution gate" so a call placed the
//! instant a channel leaves `IDLE` doesn't race the first resolver result,
//! then applying whatever per-method config (timeout, wait-for-ready) the
//! resolver's `ConfigSelector` or static service config assigns to this
//! method.

use std::time::Instant;

use crate::rt::Runtime;
use crate::service::{Request, Response};
use crate::status::Status;

use super::channel::ChannelData;
use super::filters;
use super::load_balanced_call::LoadBalancedCall;

pub(crate) struct CallData {
    channel: std::sync::Arc<ChannelData>,
}

impl CallData {
    pub(crate) fn new(channel: std::sync::Arc<ChannelData>) -> Self {
        Self { channel }
    }

    pub(crate) async fn start(self, request: Request) -> Response {
        self.channel.clone().exit_idle();

        if let Err(status) = self.wait_for_resolution(&request).await {
            return Response::fail(status);
        }

        let request = self.apply_service_config(request);
        let terminal = LoadBalancedCall::new(self.channel.clone());
        filters::run(&[], request, &terminal).await
    }

    /// Blocks the call until the channel's first resolver result (success or
    /// error) has been processed, so a call placed right after `exit_idle`
    /// does not race ahead of the picker it needs.
    async fn wait_for_resolution(&self, request: &Request) -> Result<(), Status> {
        let mut resolved_rx = self.channel.subscribe_resolved();
        if *resolved_rx.borrow() {
            return Ok(());
        }
        let wait = async {
            while !*resolved_rx.borrow() {
                if resolved_rx.changed().await.is_err() {
                    return;
                }
            }
        };
        match request.deadline() {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::select! {
                    _ = wait => {}
                    _ = self.channel.runtime.sleep(remaining) => {
                        return Err(Status::deadline_exceeded("name resolution did not complete before the call's deadline"));
                    }
                }
            }
            None => wait.await,
        }
        if *resolved_rx.borrow() {
            Ok(())
        } else {
            Err(Status::unavailable("channel shut down before name resolution completed"))
        }
    }

    /// Applies the resolver's per-method overrides, if any, to `request`:
    /// first a `ConfigSelector`'s dynamic choice, then the static service
    /// config's `methodConfig` table.
    fn apply_service_config(&self, mut request: Request) -> Request {
        let method_config = match self.channel.config_selector() {
            Some(selector) => selector.select(request.method()).map(|cc| cc.method_config),
            None => None,
        }
        .or_else(|| self.channel.current_service_config().method_config(request.method()).cloned());

        if let Some(mc) = method_config {
            // The effective deadline is min(app deadline, start+method
            // timeout): the method config may only shorten an
            // application-supplied deadline, never lengthen it.
            if let Some(timeout) = mc.timeout {
                let method_deadline = Instant::now() + timeout;
                let shorter = match request.deadline() {
                    Some(app_deadline) => method_deadline.min(app_deadline),
                    None => method_deadline,
                };
                request = request.with_deadline(shorter);
            }
            // Only fill in the method config's wait-for-ready if the
            // application left it unset; an explicit app choice always wins.
            if request.wait_for_ready_set_by_app().is_none() {
                if let Some(wait_for_ready) = mc.wait_for_ready {
                    request = request.with_wait_for_ready(wait_for_ready);
                }
            }
        }
        request
    }
}
