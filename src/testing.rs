//! Test support: a headless event loop and a tester for async handlers.
//!
//! GUI frameworks bring their own event loop; tests usually should not. The
//! [`TestLoop`] stands in for the host loop: it implements
//! [`EventLoopProxy`], queues posted callbacks, and [`TestLoop::run_until`]
//! dispatches them on the calling thread until a predicate holds.
//! [`AsyncTester`] packages the common pattern of starting a handler and
//! pumping the loop until the runner is idle.

use std::{
    collections::VecDeque,
    error::Error,
    fmt,
    future::Future,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use crate::event_loop::EventLoopProxy;
use crate::runner::{Runner, RunnerExt};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A headless GUI event loop for tests.
///
/// Construct it on the test thread, hand [`TestLoop::proxy`] to the runner,
/// and dispatch with [`TestLoop::run_until`] on that same thread.
#[derive(Clone, Default)]
pub struct TestLoop {
    shared: Arc<LoopShared>,
}

#[derive(Default)]
struct LoopShared {
    queue: Mutex<VecDeque<Callback>>,
    condvar: Condvar,
}

impl TestLoop {
    /// Creates an empty loop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the post primitive to hand to a runner.
    pub fn proxy(&self) -> Arc<dyn EventLoopProxy> {
        self.shared.clone()
    }

    /// Dispatches posted callbacks until `pred` returns `true`, waiting for
    /// new posts in between.
    ///
    /// Returns [`WaitTimeout`] if `pred` is still `false` once `timeout` has
    /// elapsed. Callbacks run on the calling thread, which must be the
    /// thread the runner was built on.
    pub fn run_until(
        &self,
        mut pred: impl FnMut() -> bool,
        timeout: Duration,
    ) -> Result<(), WaitTimeout> {
        let deadline = Instant::now() + timeout;
        loop {
            // Dispatch everything currently queued, one callback at a time so
            // that callbacks are free to post more.
            loop {
                let callback = self.shared.queue.lock().unwrap().pop_front();
                match callback {
                    Some(callback) => callback(),
                    None => break,
                }
            }
            if pred() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitTimeout { waited: timeout });
            }
            let guard = self.shared.queue.lock().unwrap();
            if guard.is_empty() {
                let (guard, _) = self
                    .shared
                    .condvar
                    .wait_timeout(guard, deadline - now)
                    .unwrap();
                drop(guard);
            }
        }
    }
}

impl EventLoopProxy for LoopShared {
    fn post(&self, callback: Callback) {
        self.queue.lock().unwrap().push_back(callback);
        self.condvar.notify_one();
    }
}

/// The runner did not become idle within the allotted time.
#[derive(Debug, Clone)]
pub struct WaitTimeout {
    waited: Duration,
}

impl WaitTimeout {
    /// How long was waited before giving up.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl fmt::Display for WaitTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runner did not become idle within {:?}", self.waited)
    }
}

impl Error for WaitTimeout {}

/// Starts handlers and pumps the loop until the runner is quiescent.
///
/// Note that waiting is on the *runner* becoming idle, not on the started
/// handler alone: if the handler starts further handlers, those are waited
/// for too.
pub struct AsyncTester<R: Runner> {
    runner: R,
    event_loop: TestLoop,
    timeout: Duration,
}

impl<R: Runner> AsyncTester<R> {
    /// Creates a tester with the default timeout of 5 seconds.
    pub fn new(runner: R, event_loop: TestLoop) -> Self {
        Self {
            runner,
            event_loop,
            timeout: Duration::from_secs(5),
        }
    }

    /// Changes the default timeout used by [`AsyncTester::start_and_wait`].
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Starts `task` and dispatches the loop until the runner is idle or the
    /// default timeout elapses.
    pub fn start_and_wait<F>(&self, task: F) -> Result<(), WaitTimeout>
    where
        F: Future<Output = ()> + 'static,
    {
        self.start_and_wait_timeout(task, self.timeout)
    }

    /// Like [`AsyncTester::start_and_wait`], with an explicit timeout.
    pub fn start_and_wait_timeout<F>(&self, task: F, timeout: Duration) -> Result<(), WaitTimeout>
    where
        F: Future<Output = ()> + 'static,
    {
        self.runner.start(task);
        self.event_loop
            .run_until(|| self.runner.is_idle(), timeout)
    }
}
