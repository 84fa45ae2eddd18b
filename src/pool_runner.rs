//! The pool-backed runner: suspendable handlers on the GUI thread, blocking
//! jobs on worker threads.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    future::Future,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    task::{Wake, Waker},
    thread,
};

use crate::event_loop::EventLoopProxy;
use crate::job::{Job, JobError, JobId, Outcome, Panic};
use crate::main_thread::MainThreadBound;
use crate::pool::{Submission, WorkerPool};
use crate::runner::{
    BoxTask, Engine, ParallelBoxed, Request, Resume, RunBoxed, Runner, RunnerExt, Sealed,
};
use crate::task::{Step, Task, TaskId};

/// A builder object that can be used to configure and create a [`PoolRunner`].
pub struct PoolRunnerBuilder {
    max_threads: Option<usize>,
    name: String,
    on_unhandled_error: Option<Box<dyn Fn(Panic) + 'static>>,
}

impl PoolRunnerBuilder {
    /// Sets the number of worker threads.
    ///
    /// By default, the host's available parallelism is used.
    pub fn max_threads(self, max_threads: usize) -> Self {
        assert_ne!(max_threads, 0, "max_threads must be at least 1");
        Self {
            max_threads: Some(max_threads),
            ..self
        }
    }

    /// Sets the base name of the worker threads.
    ///
    /// Each thread is named according to this base name and its index.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Sets the sink invoked (on the GUI thread) with a panic that escaped a
    /// root task.
    ///
    /// By default, the payload is re-posted to the event loop and resumed
    /// there at the next turn, so it surfaces as an ordinary unhandled panic
    /// on the GUI thread rather than being swallowed.
    pub fn on_unhandled_error<F>(self, sink: F) -> Self
    where
        F: Fn(Panic) + 'static,
    {
        Self {
            on_unhandled_error: Some(Box::new(sink)),
            ..self
        }
    }

    /// Creates the runner, spawning its worker threads.
    ///
    /// The runner is bound to the calling thread, which becomes its GUI
    /// thread: handlers run and resume there, and the affinity is enforced
    /// at runtime.
    pub fn build(self, proxy: Arc<dyn EventLoopProxy>) -> io::Result<PoolRunner> {
        let threads = self
            .max_threads
            .unwrap_or_else(|| thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
        let sink: Box<dyn Fn(Panic)> = match self.on_unhandled_error {
            Some(sink) => sink,
            None => {
                let proxy = proxy.clone();
                Box::new(move |panic: Panic| {
                    proxy.post(Box::new(move || panic.resume()));
                })
            }
        };
        let core = Arc::new(Core {
            closed: AtomicBool::new(false),
            threads,
            next_job: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            pool: Mutex::new(None),
            proxy,
            gui: MainThreadBound::new(GuiState {
                tasks: RefCell::new(HashMap::new()),
                next_task: Cell::new(0),
                running: Cell::new(0),
                current: Cell::new(None),
                sink,
            }),
        });
        let channel = CompletionChannel {
            core: Arc::downgrade(&core),
        };
        let pool = WorkerPool::spawn(
            threads,
            &self.name,
            Arc::new(move |id, outcome| channel.post(id, outcome)),
        )?;
        *core.pool.lock().unwrap() = Some(pool);
        Ok(PoolRunner { core })
    }
}

/// A runner backed by a worker thread pool.
///
/// Handlers written as `async` blocks are started with
/// [`start`][RunnerExt::start] (or connected to GUI signals via
/// [`PoolRunner::to_sync`]); inside them, [`run`][RunnerExt::run] and
/// [`run_parallel`][RunnerExt::run_parallel] execute blocking callables on
/// the pool while the handler is parked. All handler code runs on the GUI
/// thread; only the callables handed to `run`/`run_parallel` run elsewhere.
///
/// `PoolRunner` is a cheap handle: clones share the same pool and task
/// table. Call [`close`][Runner::close] when done (dropping the last handle
/// on the GUI thread also closes it).
#[derive(Clone)]
pub struct PoolRunner {
    core: Arc<Core>,
}

impl PoolRunner {
    /// Returns a builder that can be used to configure and create a
    /// [`PoolRunner`].
    #[inline]
    pub fn builder() -> PoolRunnerBuilder {
        PoolRunnerBuilder {
            max_threads: None,
            name: "offloop".into(),
            on_unhandled_error: None,
        }
    }

    /// Creates a runner with default configuration.
    pub fn new(proxy: Arc<dyn EventLoopProxy>) -> io::Result<Self> {
        Self::builder().build(proxy)
    }

    /// Returns the number of worker threads in the pool.
    #[inline]
    pub fn max_threads(&self) -> usize {
        self.core.threads
    }

    /// Wraps an async function into a plain callable, suitable for direct
    /// connection to a GUI signal.
    ///
    /// Each invocation of the returned closure builds the handler future and
    /// hands it to [`start`][RunnerExt::start].
    pub fn to_sync<F, Fut>(&self, async_fn: F) -> impl Fn() + 'static
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let runner = self.clone();
        move || runner.start(async_fn())
    }

    /// Like [`PoolRunner::to_sync`], for slots that receive one argument.
    pub fn to_sync_with<A, F, Fut>(&self, async_fn: F) -> impl Fn(A) + 'static
    where
        F: Fn(A) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let runner = self.clone();
        move |arg| runner.start(async_fn(arg))
    }
}

impl Sealed for PoolRunner {}

impl Runner for PoolRunner {
    fn run_boxed(&self, job: Job) -> RunBoxed {
        let engine: Arc<dyn Engine> = self.core.clone();
        RunBoxed::new(&engine, job)
    }

    fn run_parallel_boxed(&self, jobs: Vec<Job>) -> ParallelBoxed {
        let engine: Arc<dyn Engine> = self.core.clone();
        ParallelBoxed::new(&engine, jobs)
    }

    fn start_boxed(&self, task: BoxTask) {
        Core::spawn_task(&self.core, task);
    }

    fn is_idle(&self) -> bool {
        self.core.is_idle()
    }

    fn close(&self) {
        self.core.close();
    }
}

impl Drop for PoolRunner {
    fn drop(&mut self) {
        // Best effort: close when the last handle goes away on the GUI
        // thread. Handles dropped elsewhere leave shutdown to an explicit
        // `close` call.
        if Arc::strong_count(&self.core) == 1 && self.core.gui.is_owner() {
            self.core.close();
        }
    }
}

/// Carries outcomes from worker threads to the GUI thread through the host's
/// post primitive. The posted callback delivers into the runner core, which
/// the GUI thread owns.
struct CompletionChannel {
    core: Weak<Core>,
}

impl CompletionChannel {
    /// Safe from any thread; posting wakes the GUI event loop.
    fn post(&self, id: JobId, outcome: Outcome) {
        let Some(core) = self.core.upgrade() else { return };
        if core.closed.load(Ordering::Acquire) {
            log::trace!("dropping completion for {id:?}: runner closed");
            return;
        }
        let target = core.clone();
        core.proxy
            .post(Box::new(move || Core::deliver(&target, id, outcome)));
    }
}

struct Core {
    closed: AtomicBool,
    threads: usize,
    next_job: AtomicU64,
    /// In-flight submissions, keyed by job id. Each id maps to the request
    /// of the `run`/`run_parallel` call that spawned it.
    pending: Mutex<HashMap<JobId, Arc<Request>>>,
    /// Taken (and stopped) on close.
    pool: Mutex<Option<WorkerPool>>,
    proxy: Arc<dyn EventLoopProxy>,
    gui: MainThreadBound<GuiState>,
}

/// The state only the GUI thread touches.
struct GuiState {
    tasks: RefCell<HashMap<TaskId, Task>>,
    next_task: Cell<u64>,
    /// Number of tasks currently being advanced (normally 0 or 1; a task
    /// starting another task nests).
    running: Cell<usize>,
    /// The task whose `step` is on the stack, for resume routing.
    current: Cell<Option<TaskId>>,
    /// Receives panics that escaped root tasks.
    sink: Box<dyn Fn(Panic)>,
}

impl Core {
    /// Runs on the GUI thread for every completed job: shutdown check,
    /// request lookup, outcome hand-off, resumption.
    fn deliver(this: &Arc<Core>, id: JobId, outcome: Outcome) {
        if this.closed.load(Ordering::Acquire) {
            log::trace!("dropping completion for {id:?}: runner closed");
            return;
        }
        let request = this.pending.lock().unwrap().remove(&id);
        let Some(request) = request else { return };
        match request.complete(outcome) {
            Resume::None => {}
            Resume::Wake(waker) => waker.wake(),
            Resume::Task(task) => Core::advance(this, task),
        }
    }

    fn spawn_task(this: &Arc<Core>, future: BoxTask) {
        let gui = this.gui.get();
        let id = TaskId(gui.next_task.get());
        gui.next_task.set(id.0 + 1);
        log::trace!("starting task {id:?}");
        gui.tasks.borrow_mut().insert(id, Task::new(future));
        Core::advance(this, id);
    }

    /// Advances one task and applies the state machine to the result. The
    /// task is taken out of the table while it runs, so that user code inside
    /// it can freely start tasks or close the runner.
    fn advance(this: &Arc<Core>, id: TaskId) {
        let gui = this.gui.get();
        let Some(mut task) = gui.tasks.borrow_mut().remove(&id) else {
            return;
        };
        gui.running.set(gui.running.get() + 1);
        let previous = gui.current.replace(Some(id));
        let waker = Waker::from(Arc::new(TaskWaker {
            core: Arc::downgrade(this),
            task: id,
        }));
        let step = task.step(&waker);
        gui.current.set(previous);
        gui.running.set(gui.running.get() - 1);
        match step {
            Step::Suspended => {
                if this.closed.load(Ordering::Acquire) {
                    // The task closed the runner while it ran; it must not
                    // be resumed anymore.
                    log::trace!("dropping suspended task {id:?}: runner closed");
                } else {
                    gui.tasks.borrow_mut().insert(id, task);
                }
            }
            Step::Finished => log::trace!("task {id:?} finished"),
            Step::Failed(payload) => {
                log::trace!("task {id:?} failed");
                (gui.sink)(Panic::new(payload));
            }
        }
    }

    fn is_idle(&self) -> bool {
        let gui = self.gui.get();
        gui.tasks.borrow().is_empty()
            && gui.running.get() == 0
            && self.pending.lock().unwrap().is_empty()
    }

    fn close(&self) {
        // Closing drops tasks, so it is bound to the GUI thread like any
        // other access to them.
        let gui = self.gui.get();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::trace!("closing runner");
        if let Some(mut pool) = self.pool.lock().unwrap().take() {
            pool.stop();
        }
        // Discard every task still suspended, without resuming it. Collected
        // first: task destructors may run arbitrary user code.
        let tasks: Vec<Task> = {
            let mut tasks = gui.tasks.borrow_mut();
            tasks.drain().map(|(_, task)| task).collect()
        };
        if !tasks.is_empty() {
            log::trace!("dropping {} suspended task(s)", tasks.len());
        }
        drop(tasks);
        self.pending.lock().unwrap().clear();
    }
}

impl Engine for Core {
    fn begin(&self, jobs: Vec<Job>) -> Arc<Request> {
        let request = Arc::new(Request::with_jobs(jobs.len()));
        let pool = self.pool.lock().unwrap();
        match (pool.as_ref(), self.closed.load(Ordering::Acquire)) {
            (Some(pool), false) => {
                let mut pending = self.pending.lock().unwrap();
                for job in jobs {
                    let id = JobId(self.next_job.fetch_add(1, Ordering::Relaxed));
                    pending.insert(id, request.clone());
                    if !pool.submit(Submission { id, job }) {
                        pending.remove(&id);
                        request.complete(Err(JobError::Closed));
                    }
                }
            }
            _ => {
                // Closed: resolve every slot right away so the awaiting
                // handler sees the error at its await point.
                for job in jobs {
                    drop(job);
                    request.complete(Err(JobError::Closed));
                }
            }
        }
        request
    }

    fn current_task(&self) -> Option<TaskId> {
        // Tolerate being polled off the GUI thread (e.g. by an external
        // executor): there is no current task there.
        if self.gui.is_owner() {
            self.gui.get().current.get()
        } else {
            None
        }
    }
}

/// Wakes a suspended task by posting its advancement to the GUI loop.
///
/// The runner's own resumption path goes through the completion channel and
/// never uses this; it exists so that the tasks' wakers are functional if
/// something else wakes them.
struct TaskWaker {
    core: Weak<Core>,
    task: TaskId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let Some(core) = self.core.upgrade() else { return };
        if core.closed.load(Ordering::Acquire) {
            return;
        }
        let task = self.task;
        let target = core.clone();
        core.proxy.post(Box::new(move || {
            if !target.closed.load(Ordering::Acquire) {
                Core::advance(&target, task);
            }
        }));
    }
}
