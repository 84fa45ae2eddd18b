//! A runner that executes everything inline, for deterministic tests.

use std::{
    cell::Cell,
    future::Future,
    panic::{self, resume_unwind, AssertUnwindSafe},
    sync::Arc,
    task::{Wake, Waker},
};

use crate::job::{Job, JobError, Panic};
use crate::runner::{
    BoxTask, Engine, ParallelBoxed, Request, RunBoxed, Runner, RunnerExt, Sealed,
};
use crate::task::{Step, Task, TaskId};

/// A runner that runs every submitted callable synchronously in the calling
/// thread, with no worker pool and no event loop.
///
/// It implements the same contract as [`PoolRunner`][crate::PoolRunner], so
/// handler code written against [`Runner`] works unchanged, but all
/// scheduling variance is gone: `run` invokes the callable on the spot,
/// `run_parallel` delivers outcomes in submission order (not completion
/// order), and [`start`][RunnerExt::start] drives the handler to completion
/// before returning. Use it in unit tests that want deterministic
/// reproduction.
#[derive(Clone, Default)]
pub struct SequentialRunner {
    core: Arc<SeqCore>,
}

impl SequentialRunner {
    /// Creates a sequential runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sequential runner whose root-task panics go to `sink`
    /// instead of resuming in the caller of `start`.
    pub fn with_unhandled_error<F>(sink: F) -> Self
    where
        F: Fn(Panic) + 'static,
    {
        Self {
            core: Arc::new(SeqCore {
                sink: Some(Box::new(sink)),
                ..SeqCore::default()
            }),
        }
    }

    /// Wraps an async function into a plain callable; invoking it runs the
    /// handler to completion on the spot.
    pub fn to_sync<F, Fut>(&self, async_fn: F) -> impl Fn() + 'static
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let runner = self.clone();
        move || runner.start(async_fn())
    }

    /// Like [`SequentialRunner::to_sync`], for slots that receive one
    /// argument.
    pub fn to_sync_with<A, F, Fut>(&self, async_fn: F) -> impl Fn(A) + 'static
    where
        F: Fn(A) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let runner = self.clone();
        move |arg| runner.start(async_fn(arg))
    }
}

impl Sealed for SequentialRunner {}

impl Runner for SequentialRunner {
    fn run_boxed(&self, job: Job) -> RunBoxed {
        let engine: Arc<dyn Engine> = self.core.clone();
        RunBoxed::new(&engine, job)
    }

    fn run_parallel_boxed(&self, jobs: Vec<Job>) -> ParallelBoxed {
        let engine: Arc<dyn Engine> = self.core.clone();
        ParallelBoxed::new(&engine, jobs)
    }

    /// Drives `task` to completion before returning.
    ///
    /// # Panics
    ///
    /// Panics if the task suspends on something this runner cannot resume
    /// (anything other than its own `run`/`run_parallel` awaitables), and
    /// resumes a panic escaping the task unless an unhandled-error sink was
    /// configured.
    fn start_boxed(&self, task: BoxTask) {
        let mut task = Task::new(task);
        self.core.running.set(self.core.running.get() + 1);
        let waker = Waker::from(Arc::new(NoopWaker));
        let step = task.step(&waker);
        self.core.running.set(self.core.running.get() - 1);
        match step {
            Step::Suspended => {
                // Every awaitable this runner hands out resolves before it is
                // first polled, so a suspended task is waiting on something
                // foreign that will never be resumed here.
                panic!("task suspended on a future the sequential runner cannot resume");
            }
            Step::Finished => {}
            Step::Failed(payload) => match &self.core.sink {
                Some(sink) => sink(Panic::new(payload)),
                None => resume_unwind(payload),
            },
        }
    }

    fn is_idle(&self) -> bool {
        self.core.running.get() == 0
    }

    fn close(&self) {
        self.core.closed.set(true);
    }
}

#[derive(Default)]
struct SeqCore {
    closed: Cell<bool>,
    /// Depth of `start` calls on the stack (a handler may start another).
    running: Cell<usize>,
    sink: Option<Box<dyn Fn(Panic)>>,
}

impl Engine for SeqCore {
    fn begin(&self, jobs: Vec<Job>) -> Arc<Request> {
        let request = Arc::new(Request::with_jobs(jobs.len()));
        for job in jobs {
            let outcome = if self.closed.get() {
                drop(job);
                Err(JobError::Closed)
            } else {
                panic::catch_unwind(AssertUnwindSafe(job))
                    .map_err(|payload| JobError::Panicked(Panic::new(payload)))
            };
            request.complete(outcome);
        }
        request
    }

    fn current_task(&self) -> Option<TaskId> {
        None
    }
}

struct NoopWaker;

impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        panic::catch_unwind,
        rc::Rc,
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn run_executes_inline_and_returns_the_value() {
        let runner = SequentialRunner::new();
        let result = Rc::new(Cell::new(0));

        let slot = result.clone();
        let handle = runner.clone();
        runner.start(async move {
            slot.set(handle.run(|| 21 * 2).await.unwrap());
        });

        // `start` drove the task to completion synchronously.
        assert_eq!(result.get(), 42);
        assert!(runner.is_idle());
    }

    #[test]
    fn parallel_results_arrive_in_submission_order() {
        let runner = SequentialRunner::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let slot = order.clone();
        let handle = runner.clone();
        runner.start(async move {
            let sleep_then = |ms: u64, value: &'static str| {
                move || {
                    thread::sleep(Duration::from_millis(ms));
                    value
                }
            };
            let mut results = handle.run_parallel(vec![
                sleep_then(30, "a"),
                sleep_then(5, "b"),
                sleep_then(15, "c"),
            ]);
            while let Some(result) = results.next().await {
                slot.borrow_mut().push(result.unwrap());
            }
        });

        // Submission order, not completion order.
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
        assert!(runner.is_idle());
    }

    #[test]
    fn callable_panic_surfaces_at_the_await() {
        let runner = SequentialRunner::new();
        let caught = Rc::new(RefCell::new(None));

        let slot = caught.clone();
        let handle = runner.clone();
        runner.start(async move {
            let err = handle.run(|| -> i32 { panic!("boom") }).await.unwrap_err();
            *slot.borrow_mut() = err.panic_message().map(str::to_owned);
        });

        assert_eq!(caught.borrow().as_deref(), Some("boom"));
    }

    #[test]
    fn root_panic_resumes_in_the_caller() {
        let runner = SequentialRunner::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            runner.start(async { panic!("root boom") });
        }));
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"root boom"));
        assert!(runner.is_idle());
    }

    #[test]
    fn root_panic_goes_to_configured_sink() {
        let message = Rc::new(RefCell::new(None));
        let slot = message.clone();
        let runner = SequentialRunner::with_unhandled_error(move |panic| {
            *slot.borrow_mut() = panic.message().map(str::to_owned);
        });

        runner.start(async { panic!("sunk") });

        assert_eq!(message.borrow().as_deref(), Some("sunk"));
    }

    #[test]
    fn run_after_close_fails_with_closed() {
        let runner = SequentialRunner::new();
        runner.close();

        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        let handle = runner.clone();
        runner.start(async move {
            *slot.borrow_mut() = Some(handle.run(|| 1).await);
        });

        assert!(matches!(&*seen.borrow(), Some(Err(JobError::Closed))));
    }

    #[test]
    fn foreign_suspension_panics() {
        let runner = SequentialRunner::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            runner.start(std::future::pending());
        }));
        assert!(result.is_err());
    }

    #[test]
    fn to_sync_runs_on_the_spot() {
        let runner = SequentialRunner::new();
        let count = Rc::new(Cell::new(0));

        let on_clicked = {
            let count = count.clone();
            let handle = runner.clone();
            runner.to_sync(move || {
                let count = count.clone();
                let handle = handle.clone();
                async move {
                    count.set(count.get() + handle.run(|| 1).await.unwrap());
                }
            })
        };
        on_clicked();
        on_clicked();

        assert_eq!(count.get(), 2);
    }

    #[test]
    fn same_task_code_works_on_both_runners() {
        // The shared handler, written once against the capability interface.
        fn handler<R: Runner + Clone + 'static>(
            runner: &R,
            out: Rc<RefCell<Vec<i32>>>,
        ) -> impl Future<Output = ()> {
            let runner = runner.clone();
            async move {
                let mut results = runner.run_parallel((1..=3).map(|i| move || i * 10));
                while let Some(result) = results.next().await {
                    out.borrow_mut().push(result.unwrap());
                }
            }
        }

        let runner = SequentialRunner::new();
        let out = Rc::new(RefCell::new(Vec::new()));
        runner.start(handler(&runner, out.clone()));
        assert_eq!(*out.borrow(), vec![10, 20, 30]);
    }
}
