//! The runner capability interface and its awaitable types.
//!
//! [`Runner`] is the object-safe operation set shared by
//! [`PoolRunner`][crate::PoolRunner] and
//! [`SequentialRunner`][crate::SequentialRunner]; widget code that wants to
//! swap one for the other in tests can hold an `Rc<dyn Runner>`. The typed
//! conveniences live in [`RunnerExt`], which is implemented for everything
//! that implements [`Runner`], trait objects included.

use std::{
    any::Any,
    collections::VecDeque,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll, Waker},
};

use crate::job::{Job, JobError, Outcome};
use crate::task::TaskId;

/// A boxed root task, as accepted by [`Runner::start_boxed`].
pub type BoxTask = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// The scheduling half a runner provides to its awaitable types.
///
/// `begin` creates the request covering one `run`/`run_parallel` call and
/// submits its jobs; how they execute (worker pool vs. inline) is what
/// distinguishes the runner implementations.
pub(crate) trait Engine {
    fn begin(&self, jobs: Vec<Job>) -> Arc<Request>;

    /// The task currently being advanced, used to route resumptions.
    fn current_task(&self) -> Option<TaskId>;
}

/// Bookkeeping for one suspension: the jobs submitted together by a single
/// `run`/`run_parallel` call, the slot their outcomes land in, and the party
/// to resume when one arrives.
///
/// A request is shared between the awaitable that consumes it and the
/// runner's pending table, which routes each completed job id to it.
pub(crate) struct Request {
    inner: Mutex<RequestInner>,
}

struct RequestInner {
    /// Delivered outcomes in completion order.
    ready: VecDeque<Outcome>,
    /// Jobs submitted but not yet completed.
    unresolved: usize,
    owner: RequestOwner,
}

/// Who gets resumed when an outcome lands in a [`Request`].
pub(crate) enum RequestOwner {
    /// No poll has parked on the request yet; outcomes just accumulate.
    Unbound,
    /// A suspended root task; the runner advances it directly.
    Task(TaskId),
    /// A foreign executor's waker (the awaitable was polled outside a root
    /// task, e.g. by a test harness).
    External(Waker),
    /// The consuming awaitable was dropped; outcomes are drained silently.
    Detached,
}

/// How the completion path should resume the awaiting side, decided while
/// the request lock was held.
pub(crate) enum Resume {
    None,
    Task(TaskId),
    Wake(Waker),
}

impl Request {
    pub fn with_jobs(count: usize) -> Self {
        Self {
            inner: Mutex::new(RequestInner {
                ready: VecDeque::new(),
                unresolved: count,
                owner: RequestOwner::Unbound,
            }),
        }
    }

    /// Records one job's outcome and reports how to resume the awaiting side.
    pub fn complete(&self, outcome: Outcome) -> Resume {
        let mut inner = self.inner.lock().unwrap();
        inner.unresolved -= 1;
        match &inner.owner {
            RequestOwner::Detached => Resume::None,
            RequestOwner::Unbound => {
                inner.ready.push_back(outcome);
                Resume::None
            }
            RequestOwner::Task(task) => {
                let task = *task;
                inner.ready.push_back(outcome);
                Resume::Task(task)
            }
            RequestOwner::External(waker) => {
                let waker = waker.clone();
                inner.ready.push_back(outcome);
                Resume::Wake(waker)
            }
        }
    }

    /// Takes the next outcome in completion order, or reports whether more
    /// can still arrive. `owner` is recorded when the caller must park.
    fn next_or_park(&self, owner: impl FnOnce() -> RequestOwner) -> Parked {
        let mut inner = self.inner.lock().unwrap();
        if let Some(outcome) = inner.ready.pop_front() {
            return Parked::Ready(outcome);
        }
        if inner.unresolved == 0 {
            return Parked::Exhausted;
        }
        inner.owner = owner();
        Parked::Pending
    }

    /// Stops delivery: future outcomes are counted but dropped.
    fn detach(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.owner = RequestOwner::Detached;
        inner.ready.clear();
    }
}

enum Parked {
    Ready(Outcome),
    Exhausted,
    Pending,
}

fn park_owner(engine: &Weak<dyn Engine>, cx: &Context<'_>) -> RequestOwner {
    match engine.upgrade().and_then(|engine| engine.current_task()) {
        Some(task) => RequestOwner::Task(task),
        None => RequestOwner::External(cx.waker().clone()),
    }
}

/// The capability interface of a runner: `run`, `run_parallel`, `start`,
/// `is_idle` and `close`, in type-erased form.
///
/// Implemented by [`PoolRunner`][crate::PoolRunner] and
/// [`SequentialRunner`][crate::SequentialRunner]. User code normally goes
/// through the typed methods of [`RunnerExt`] instead of calling the
/// `*_boxed` operations directly.
pub trait Runner: sealed::Sealed {
    /// Submits one type-erased blocking job and returns the awaitable for
    /// its outcome. See [`RunnerExt::run`] for the typed form.
    fn run_boxed(&self, job: Job) -> RunBoxed;

    /// Submits a batch of type-erased jobs at once and returns the awaitable
    /// sequence of their outcomes. See [`RunnerExt::run_parallel`].
    fn run_parallel_boxed(&self, jobs: Vec<Job>) -> ParallelBoxed;

    /// Schedules a suspendable handler as a root task and returns
    /// immediately. Errors escaping the task go to the runner's unhandled
    /// error sink.
    fn start_boxed(&self, task: BoxTask);

    /// Returns whether no task is live and no submitted job is unresolved.
    ///
    /// Test code polls this to learn that the runner is quiescent. Only
    /// meaningful when slots are connected with direct (synchronous)
    /// connections; with queued connections a handler may not have started
    /// yet when this returns `true`.
    fn is_idle(&self) -> bool;

    /// Shuts the runner down: stops the workers (finishing only what is
    /// already executing) and discards every suspended task without resuming
    /// it. Idempotent.
    fn close(&self);
}

mod sealed {
    pub trait Sealed {}
}

pub(crate) use sealed::Sealed;

/// Typed conveniences over the object-safe [`Runner`] operations.
pub trait RunnerExt: Runner {
    /// Runs `func` on a worker thread; awaiting the result suspends the
    /// calling task and resumes it on the GUI thread once `func` finished.
    ///
    /// If `func` panics, the captured panic surfaces here as
    /// [`JobError::Panicked`]. A `Result` returned by `func` passes through
    /// as the output value, untouched.
    fn run<T, F>(&self, func: F) -> Run<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Run {
            inner: self.run_boxed(Box::new(move || Box::new(func()) as Box<dyn Any + Send>)),
            _result: PhantomData,
        }
    }

    /// Submits all of `funcs` at once and returns their results *in
    /// completion order*, not submission order (whatever finishes first is
    /// delivered first). The sequential runner delivers in submission order
    /// instead.
    ///
    /// Dropping the returned sequence before exhausting it is fine: the
    /// remaining jobs still execute, and their outcomes are drained silently
    /// so the runner becomes idle again.
    fn run_parallel<T, F, I>(&self, funcs: I) -> ParallelResults<T>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let jobs = funcs
            .into_iter()
            .map(|func| Box::new(move || Box::new(func()) as Box<dyn Any + Send>) as Job)
            .collect();
        ParallelResults {
            inner: self.run_parallel_boxed(jobs),
            _result: PhantomData,
        }
    }

    /// Schedules `task` as a root task. Fire-and-forget: there is no handle
    /// to await; a panic escaping `task` goes to the unhandled error sink.
    fn start<F>(&self, task: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.start_boxed(Box::pin(task));
    }
}

impl<R: Runner + ?Sized> RunnerExt for R {}

/// Awaitable for one type-erased job, created by [`Runner::run_boxed`].
pub struct RunBoxed {
    engine: Weak<dyn Engine>,
    request: Arc<Request>,
    done: bool,
}

impl RunBoxed {
    pub(crate) fn new(engine: &Arc<dyn Engine>, job: Job) -> Self {
        Self {
            request: engine.begin(vec![job]),
            engine: Arc::downgrade(engine),
            done: false,
        }
    }
}

impl Future for RunBoxed {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.request.next_or_park(|| park_owner(&this.engine, cx)) {
            Parked::Ready(outcome) => {
                this.done = true;
                Poll::Ready(outcome)
            }
            // A single-job request always has exactly one outcome; observing
            // exhaustion means the future was polled again after completion.
            Parked::Exhausted => Poll::Pending,
            Parked::Pending => Poll::Pending,
        }
    }
}

impl Drop for RunBoxed {
    fn drop(&mut self) {
        if !self.done {
            self.request.detach();
        }
    }
}

/// Awaitable sequence of type-erased outcomes, created by
/// [`Runner::run_parallel_boxed`].
pub struct ParallelBoxed {
    engine: Weak<dyn Engine>,
    request: Arc<Request>,
    finished: bool,
}

impl ParallelBoxed {
    pub(crate) fn new(engine: &Arc<dyn Engine>, jobs: Vec<Job>) -> Self {
        Self {
            request: engine.begin(jobs),
            engine: Arc::downgrade(engine),
            finished: false,
        }
    }

    /// Polls for the next outcome; `Ready(None)` once every job's outcome
    /// has been delivered.
    pub fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Option<Outcome>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.request.next_or_park(|| park_owner(&self.engine, cx)) {
            Parked::Ready(outcome) => Poll::Ready(Some(outcome)),
            Parked::Exhausted => {
                self.finished = true;
                Poll::Ready(None)
            }
            Parked::Pending => Poll::Pending,
        }
    }

    /// Awaitable for the next outcome.
    pub fn next(&mut self) -> ParallelNext<'_> {
        ParallelNext { results: self }
    }
}

impl Drop for ParallelBoxed {
    fn drop(&mut self) {
        self.request.detach();
    }
}

/// Future returned by [`ParallelBoxed::next`].
pub struct ParallelNext<'a> {
    results: &'a mut ParallelBoxed,
}

impl Future for ParallelNext<'_> {
    type Output = Option<Outcome>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().results.poll_next(cx)
    }
}

/// Awaitable for one typed job, created by [`RunnerExt::run`].
pub struct Run<T> {
    inner: RunBoxed,
    _result: PhantomData<fn() -> T>,
}

impl<T: 'static> Future for Run<T> {
    type Output = Result<T, JobError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll(cx)
            .map(|outcome| outcome.map(|value| *value.downcast::<T>().unwrap()))
    }
}

/// Typed sequence of results, created by [`RunnerExt::run_parallel`].
///
/// Iterate with [`ParallelResults::next`]:
///
/// ```ignore
/// let mut results = runner.run_parallel(funcs);
/// while let Some(result) = results.next().await {
///     // `result` is `Result<T, JobError>`, in completion order.
/// }
/// ```
pub struct ParallelResults<T> {
    inner: ParallelBoxed,
    _result: PhantomData<fn() -> T>,
}

impl<T: 'static> ParallelResults<T> {
    /// Awaitable for the next result, or [`None`] once all jobs delivered.
    pub fn next(&mut self) -> Next<'_, T> {
        Next { results: self }
    }
}

/// Future returned by [`ParallelResults::next`].
pub struct Next<'a, T> {
    results: &'a mut ParallelResults<T>,
}

impl<T: 'static> Future for Next<'_, T> {
    type Output = Option<Result<T, JobError>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().results.inner.poll_next(cx).map(|next| {
            next.map(|outcome| outcome.map(|value| *value.downcast::<T>().unwrap()))
        })
    }
}
