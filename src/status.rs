//! gRPC status codes and the error type used throughout the channel core.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// A gRPC status code, matching the values defined by the gRPC wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

/// A gRPC status: a code, a human-readable message, and whatever typed
/// metadata the control plane wants to thread through to a caller without
/// widening the error taxonomy.
///
/// `lb_drop` distinguishes an LB policy's deliberate `Drop` decision from an
/// ordinary `UNAVAILABLE` caused by a connection failure, so that filters
/// above the core (e.g. retry) can tell the two apart.
#[derive(Clone, Debug)]
pub struct Status {
    code: Code,
    message: String,
    lb_drop: bool,
    idle_reentry: bool,
    cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            lb_drop: false,
            idle_reentry: false,
            cause: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    /// Tags this status as an LB-policy drop. Callers that
    /// distinguish drops from ordinary connection failures check
    /// [`Status::is_lb_drop`].
    pub fn with_lb_drop(mut self) -> Self {
        self.lb_drop = true;
        self
    }

    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Tags this status as a channel's "entered IDLE" signal rather than a
    /// terminal shutdown: `lb_drop` is the wrong tag to reuse here since a
    /// dropped call and an idle channel call for different caller behavior
    /// -- idle is recoverable via `exit_idle`, shutdown is not. Absent (the
    /// default), a disconnect status means SHUTDOWN.
    pub fn with_idle_reentry(mut self) -> Self {
        self.idle_reentry = true;
        self
    }

    pub fn is_idle_reentry(&self) -> bool {
        self.idle_reentry
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_lb_drop(&self) -> bool {
        self.lb_drop
    }

    /// Whether a wait-for-ready call should re-queue instead of failing
    /// outright on this status. Only connectivity-shaped codes qualify;
    /// an LB drop is terminal regardless of wait-for-ready.
    pub fn is_retriable_for_wait_for_ready(&self) -> bool {
        !self.lb_drop && matches!(self.code, Code::Unavailable)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl StdError for Status {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|c| c.as_ref() as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lb_drop_is_not_wait_for_ready_retriable() {
        let st = Status::unavailable("dropped").with_lb_drop();
        assert!(st.is_lb_drop());
        assert!(!st.is_retriable_for_wait_for_ready());
    }

    #[test]
    fn plain_unavailable_is_wait_for_ready_retriable() {
        let st = Status::unavailable("connection refused");
        assert!(!st.is_lb_drop());
        assert!(st.is_retriable_for_wait_for_ready());
    }

    #[test]
    fn idle_reentry_defaults_to_absent() {
        let st = Status::unavailable("channel shut down");
        assert!(!st.is_idle_reentry());
        let idle = Status::unavailable("channel entered IDLE").with_idle_reentry();
        assert!(idle.is_idle_reentry());
    }

    #[test]
    fn display_includes_code_and_message() {
        let st = Status::new(Code::NotFound, "missing");
        let s = st.to_string();
        assert!(s.contains("NotFound"));
        assert!(s.contains("missing"));
    }
}
