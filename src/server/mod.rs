//! A minimal server skeleton: pairs a [`Listener`] of incoming calls
//! with a single [`Service`] handler. The server side of the wire protocol
//! is an external collaborator same as the client transport; this crate only
//! needs enough of a server to drive the in-memory transport used by its own
//! tests.

use std::sync::Arc;

use tokio::sync::oneshot;
use tonic::async_trait;

use crate::service::{Request, Response, Service};

pub type Call = (Request, oneshot::Sender<Response>);

#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Option<Call>;
}

pub struct Server {
    handler: Option<Arc<dyn Service>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self { handler: None }
    }

    pub fn set_handler(&mut self, handler: impl Service + 'static) {
        self.handler = Some(Arc::new(handler));
    }

    /// Accepts calls from `listener` until it returns `None`, dispatching
    /// each to the configured handler. Panics (debug-only expectation) if no
    /// handler was set; a server with nothing to serve is a setup bug, not a
    /// runtime condition to recover from.
    pub async fn serve(&self, listener: &impl Listener) {
        let handler = self.handler.as_ref().expect("server handler not set");
        while let Some((request, reply_to)) = listener.accept().await {
            let response = handler.call(request).await;
            let _ = reply_to.send(response);
        }
    }
}
