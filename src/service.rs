//! The data-plane call contract, simplified: a [`Service`] turns
//! a [`Request`] into a [`Response`], the shape every transport, subchannel,
//! and filter in this crate calls through.
//!
//! The full wire protocol models a handful of op-codes (headers, message,
//! half-close, trailers, ...) exchanged over a duplex stream; this crate's
//! data plane is concerned with routing and load balancing that protocol's
//! *start* (which subchannel a call lands on), not framing it, so
//! `Request`/`Response` each carry a message channel rather than the
//! op-code sequence itself. A concrete transport is free to multiplex many
//! calls worth of messages over one underlying connection however it likes.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tonic::{async_trait, metadata::MetadataMap};

use crate::status::{Code, Status};

/// A single, already-decompressed gRPC message. Framing (length-prefix,
/// compression) is a transport concern this crate never sees.
pub type Message = Bytes;

/// Something that can service a [`Request`], producing a [`Response`].
/// Implemented by subchannels' connected transports and by filters that wrap
/// another `Service` (interceptors/filters are a generalized stack of
/// `Service` decorators).
#[async_trait]
pub trait Service: Send + Sync {
    async fn call(&self, request: Request) -> Response;
}

/// An outgoing call: method name, metadata, optional deadline, and the
/// stream of request messages the application is sending.
pub struct Request {
    method: String,
    metadata: MetadataMap,
    deadline: Option<Instant>,
    wait_for_ready: Option<bool>,
    messages: mpsc::Receiver<Message>,
}

impl Request {
    pub fn new(method: impl Into<String>, messages: mpsc::Receiver<Message>) -> Self {
        Self {
            method: method.into(),
            metadata: MetadataMap::new(),
            deadline: None,
            wait_for_ready: None,
            messages,
        }
    }

    /// Builds a request carrying a single message, for the common unary
    /// case, paired with the sender half the caller uses to close the
    /// stream after the first (and only) message.
    pub fn unary(method: impl Into<String>, message: Message) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(message);
        Self::new(method, rx)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn wait_for_ready(&self) -> bool {
        self.wait_for_ready.unwrap_or(false)
    }

    /// `Some` once the application has called [`Self::with_wait_for_ready`]
    /// itself, distinguishing that from a method config filling in the
    /// default. Only the method-config filter (`client::call`) needs this;
    /// everything else should call `wait_for_ready()`.
    pub(crate) fn wait_for_ready_set_by_app(&self) -> Option<bool> {
        self.wait_for_ready
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_wait_for_ready(mut self, wait: bool) -> Self {
        self.wait_for_ready = Some(wait);
        self
    }

    pub async fn next_message(&mut self) -> Option<Message> {
        self.messages.recv().await
    }
}

/// The result of a call: a status (OK with a message stream, or a non-OK
/// status if the call never produced one -- a pick failure, an LB drop, a
/// transport error) and whatever trailing metadata the server attached.
pub struct Response {
    status: Status,
    metadata: MetadataMap,
    messages: Option<mpsc::Receiver<Message>>,
}

impl Response {
    /// A successful response streaming `messages`.
    pub fn ok(messages: mpsc::Receiver<Message>) -> Self {
        Self {
            status: Status::new(Code::Ok, ""),
            metadata: MetadataMap::new(),
            messages: Some(messages),
        }
    }

    /// A response that never reached a transport: a pick
    /// failure, an LB drop, or a resolver error with no subchannel to try.
    pub fn fail(status: Status) -> Self {
        Self {
            status,
            metadata: MetadataMap::new(),
            messages: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub async fn next_message(&mut self) -> Option<Message> {
        match self.messages.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unary_request_yields_its_single_message() {
        let mut req = Request::unary("/foo.Bar/Baz", Bytes::from_static(b"hello"));
        assert_eq!(req.next_message().await, Some(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn failed_response_has_no_messages() {
        let mut resp = Response::fail(Status::unavailable("no transport"));
        assert!(resp.next_message().await.is_none());
        assert_eq!(resp.status().code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn wait_for_ready_defaults_to_unset() {
        let req = Request::unary("/foo.Bar/Baz", Bytes::new());
        assert_eq!(req.wait_for_ready(), false);
        assert_eq!(req.wait_for_ready_set_by_app(), None);
    }

    #[tokio::test]
    async fn with_wait_for_ready_marks_it_explicit() {
        let req = Request::unary("/foo.Bar/Baz", Bytes::new()).with_wait_for_ready(true);
        assert_eq!(req.wait_for_ready(), true);
        assert_eq!(req.wait_for_ready_set_by_app(), Some(true));

        let req = Request::unary("/foo.Bar/Baz", Bytes::new()).with_wait_for_ready(false);
        assert_eq!(req.wait_for_ready(), false);
        assert_eq!(req.wait_for_ready_set_by_app(), Some(false));
    }
}
