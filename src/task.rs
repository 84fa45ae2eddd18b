//! Driving a single suspendable handler forward.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    task::{Context, Poll, Waker},
};

use crate::runner::BoxTask;

/// Identifies one live root task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskId(pub(crate) u64);

/// The result of advancing a task by one step.
pub(crate) enum Step {
    /// The task parked on an await; its request slots will resume it.
    Suspended,
    /// The task ran to completion.
    Finished,
    /// A panic escaped the task body; the payload is the captured panic.
    Failed(Box<dyn Any + Send>),
}

/// A root task: the pinned suspendable handler plus the driver that steps it.
///
/// Stepping is the only place the crate touches the host language's
/// suspension machinery. The first call drives the handler from its start to
/// the first await or to completion; every later call re-polls it after the
/// outcomes it was awaiting have been written into its request slot, which is
/// how awaited values (or errors) are injected at the await point.
pub(crate) struct Task {
    future: BoxTask,
}

impl Task {
    pub fn new(future: BoxTask) -> Self {
        Self { future }
    }

    /// Advances the task until it suspends again or reaches a terminal state.
    pub fn step(&mut self, waker: &Waker) -> Step {
        let mut cx = Context::from_waker(waker);
        let poll = panic::catch_unwind(AssertUnwindSafe(|| self.future.as_mut().poll(&mut cx)));
        match poll {
            Ok(Poll::Pending) => Step::Suspended,
            Ok(Poll::Ready(())) => Step::Finished,
            Err(payload) => Step::Failed(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::task::Wake;

    use super::*;

    struct NoopWaker;

    impl Wake for NoopWaker {
        fn wake(self: Arc<Self>) {}
    }

    fn noop_waker() -> Waker {
        Waker::from(Arc::new(NoopWaker))
    }

    #[test]
    fn ready_future_finishes_in_one_step() {
        let mut task = Task::new(Box::pin(async {}));
        assert!(matches!(task.step(&noop_waker()), Step::Finished));
    }

    #[test]
    fn pending_future_suspends() {
        let mut task = Task::new(Box::pin(std::future::pending::<()>()));
        assert!(matches!(task.step(&noop_waker()), Step::Suspended));
        assert!(matches!(task.step(&noop_waker()), Step::Suspended));
    }

    #[test]
    fn panicking_future_fails_with_payload() {
        let mut task = Task::new(Box::pin(async { panic!("root") }));
        match task.step(&noop_waker()) {
            Step::Failed(payload) => {
                assert_eq!(payload.downcast_ref::<&str>(), Some(&"root"));
            }
            _ => panic!("expected failure"),
        }
    }
}
