//! A single-threaded, re-entrant queue for control-plane mutations.
//!
//! Every state change to the channel's resolver, LB policy, and
//! connectivity tracker runs inside a `WorkSerializer::submit` closure so
//! those components never need their own locks against each other: at most
//! one closure executes at a time, in submission order, and a closure may
//! itself submit further work without deadlocking.

use std::collections::VecDeque;
use std::sync::Mutex;

type Job = Box<dyn FnOnce() + Send>;

struct State {
    queue: VecDeque<Job>,
    draining: bool,
}

/// The control-plane executor for one channel. Cheap to construct, meant
/// to be owned by a single `ClientChannel`.
pub struct WorkSerializer {
    state: Mutex<State>,
}

impl Default for WorkSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkSerializer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                draining: false,
            }),
        }
    }

    /// Queues `job`. If no drain is currently in progress, the calling
    /// thread drains the queue inline (running `job` and any work enqueued
    /// in the meantime) before returning; otherwise `job` is appended and
    /// picked up by whichever thread is already draining.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(Box::new(job));
        if state.draining {
            return;
        }
        state.draining = true;
        drop(state);
        self.drain();
    }

    /// Drains queued work inline, one job at a time, until the queue is
    /// empty.
    fn drain(&self) {
        loop {
            let job = {
                let mut state = self.state.lock().unwrap();
                match state.queue.pop_front() {
                    Some(job) => job,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            job();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_submitted_job_inline() {
        let ws = WorkSerializer::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        ws.submit(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn preserves_submission_order() {
        let ws = WorkSerializer::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            ws.submit(move || order.lock().unwrap().push(i));
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn reentrant_submit_does_not_deadlock() {
        let ws = Arc::new(WorkSerializer::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let ws2 = ws.clone();
        let ran2 = ran.clone();
        ws.submit(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            let ran3 = ran2.clone();
            ws2.submit(move || {
                ran3.fetch_add(1, Ordering::SeqCst);
            });
        });
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
