//! The dynamic filter stack: interceptors/filters as a generalized stack of
//! `Service` decorators, supplemented from the batch-oriented
//! `Filter`/`start_batch` design. Each filter gets a chance to rewrite an
//! outgoing [`Request`] before it reaches the transport, and to rewrite the
//! [`Response`] on the way back, in the opposite order.
//!
//! The original batch-oriented design models a filter as `fn
//! start_batch(&self, batch: Batch, next: &dyn Fn(Batch))`, a
//! continuation-passing interface suited to a protocol with distinct
//! header/message/half-close/trailer batches. This crate's data plane
//! already collapsed that batch model down to a single
//! [`Request`]/[`Response`] pair (see `service.rs`), so a filter here is just
//! two ordinary pre/post hooks rather than a continuation a filter must
//! remember to invoke -- there is no batch sequencing left to get wrong.

use tonic::async_trait;

use crate::service::{Request, Response};

/// One stage in the filter stack. Both hooks default to a pass-through, so a
/// filter that only cares about one side (e.g. a header-stamping filter that
/// never looks at the response) only implements that one method.
#[async_trait]
pub trait Filter: Send + Sync {
    fn on_request(&self, request: Request) -> Request {
        request
    }

    async fn on_response(&self, response: Response) -> Response {
        response
    }
}

/// The innermost stage of a filter chain: whatever actually places the call
/// once every filter's `on_request` has run (`LoadBalancedCall`, or a
/// direct subchannel dispatch in tests).
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn call(&self, request: Request) -> Response;
}

/// Runs `request` through `filters` (in order) into `terminal`, then runs the
/// resulting response back through `filters` in reverse order.
pub async fn run(filters: &[std::sync::Arc<dyn Filter>], request: Request, terminal: &dyn Terminal) -> Response {
    let mut request = request;
    for filter in filters {
        request = filter.on_request(request);
    }
    let mut response = terminal.call(request).await;
    for filter in filters.iter().rev() {
        response = filter.on_response(response).await;
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StampingFilter {
        key: &'static str,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    impl Filter for StampingFilter {
        fn on_request(&self, request: Request) -> Request {
            self.order.lock().unwrap().push(self.key);
            request
        }
    }

    struct RecordingTerminal(AtomicUsize);

    #[async_trait]
    impl Terminal for RecordingTerminal {
        async fn call(&self, _request: Request) -> Response {
            self.0.fetch_add(1, Ordering::SeqCst);
            Response::fail(Status::unavailable("no transport in this test"))
        }
    }

    #[tokio::test]
    async fn filters_run_in_order_on_the_way_in() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let filters: Vec<Arc<dyn Filter>> = vec![
            Arc::new(StampingFilter { key: "a", order: order.clone() }),
            Arc::new(StampingFilter { key: "b", order: order.clone() }),
        ];
        let terminal = RecordingTerminal(AtomicUsize::new(0));
        let request = Request::unary("/svc/Method", bytes::Bytes::new());
        let _ = run(&filters, request, &terminal).await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(terminal.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_filter_stack_goes_straight_to_terminal() {
        let terminal = RecordingTerminal(AtomicUsize::new(0));
        let request = Request::unary("/svc/Method", bytes::Bytes::new());
        let response = run(&[], request, &terminal).await;
        assert_eq!(response.status().code(), crate::status::Code::Unavailable);
    }
}
