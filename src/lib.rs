//! A small library for offloading blocking work from a single-threaded GUI
//! event loop onto a worker thread pool, while keeping event handlers in
//! linear, top-to-bottom form.
//!
//! (if you're looking for homogeneous parallel processing using an
//! iterator-like interface, check out [`rayon`] instead; if your application
//! is built around `async` I/O rather than a GUI event loop, a full `async`
//! runtime is the better fit)
//!
//! # Overview
//!
//! GUI toolkits dispatch events on one thread, and widgets may only be
//! touched on that thread. Any handler that does something slow (decoding an
//! image, hitting the disk) freezes the interface unless the work moves to
//! another thread, and moving it usually shreds the handler into callback
//! fragments.
//!
//! This crate keeps the handler in one piece. Handlers are written as
//! `async` blocks and scheduled on a [`PoolRunner`]; inside them,
//! [`run`][RunnerExt::run] ships a blocking closure to the pool and suspends
//! the handler until the result is back. The handler resumes *on the GUI
//! thread*, so everything around the `await` may freely touch widgets:
//!
//! ```
//! use std::{cell::Cell, rc::Rc, time::Duration};
//! use offloop::{PoolRunner, Runner, RunnerExt};
//! use offloop::testing::TestLoop;
//!
//! // Stands in for the host GUI loop; any framework with a cross-thread
//! // "post a callback" primitive can be plugged in via `EventLoopProxy`.
//! let event_loop = TestLoop::new();
//! let runner = PoolRunner::builder().build(event_loop.proxy()).unwrap();
//!
//! let label = Rc::new(Cell::new(0));
//!
//! let shown = label.clone();
//! let handle = runner.clone();
//! runner.start(async move {
//!     // Runs on a worker thread; the handler is parked meanwhile.
//!     let sum = handle.run(|| (1..=100).sum::<u32>()).await.unwrap();
//!     // Back on the GUI thread: safe to update widgets.
//!     shown.set(sum);
//! });
//!
//! event_loop.run_until(|| runner.is_idle(), Duration::from_secs(5)).unwrap();
//! assert_eq!(label.get(), 5050);
//! runner.close();
//! ```
//!
//! # Connecting to signals
//!
//! [`PoolRunner::to_sync`] adapts an async handler into a plain callable
//! that a signal system can invoke directly:
//!
//! ```
//! use std::{cell::Cell, rc::Rc, time::Duration};
//! use offloop::{PoolRunner, Runner, RunnerExt};
//! use offloop::testing::TestLoop;
//!
//! let event_loop = TestLoop::new();
//! let runner = PoolRunner::builder().build(event_loop.proxy()).unwrap();
//! let clicks = Rc::new(Cell::new(0));
//!
//! let on_clicked = {
//!     let clicks = clicks.clone();
//!     let handle = runner.clone();
//!     runner.to_sync(move || {
//!         let clicks = clicks.clone();
//!         let handle = handle.clone();
//!         async move {
//!             let n = handle.run(|| 1).await.unwrap();
//!             clicks.set(clicks.get() + n);
//!         }
//!     })
//! };
//!
//! // e.g. button.connect_clicked(move |_| on_clicked());
//! on_clicked();
//!
//! event_loop.run_until(|| runner.is_idle(), Duration::from_secs(5)).unwrap();
//! assert_eq!(clicks.get(), 1);
//! runner.close();
//! ```
//!
//! # Fanning out
//!
//! [`run_parallel`][RunnerExt::run_parallel] submits a batch of callables at
//! once and yields their results *as they finish*, which suits workloads like
//! downloads where whichever item completes first should be processed first.
//!
//! # Errors
//!
//! A panic in a callable is captured on the worker and surfaces at the
//! `await` as a [`JobError`], payload preserved; callables that want typed
//! errors just return a `Result`, which passes through untouched. A panic
//! escaping a handler itself goes to the runner's unhandled-error sink, which
//! by default re-raises it on the GUI thread at the next loop turn.
//!
//! # Shutdown
//!
//! [`close`][Runner::close] is a hard stop: workers finish only what they
//! are already executing, and every suspended handler is dropped without
//! being resumed. That is deliberate: resuming handlers during teardown
//! would let them touch widgets that no longer exist.
//!
//! # Testing
//!
//! [`SequentialRunner`] implements the same interface with everything inline
//! and deterministic, and the [`testing`] module provides a headless event
//! loop plus an [`AsyncTester`][testing::AsyncTester] for integration-style
//! tests. Note that [`is_idle`][Runner::is_idle] is only a reliable
//! quiescence signal when handlers are invoked through direct (synchronous)
//! signal connections; with queued connections a handler may still be
//! sitting in the host's event queue when it returns `true`.
//!
//! [`rayon`]: https://crates.io/crates/rayon

mod event_loop;
mod job;
mod main_thread;
mod pool;
mod pool_runner;
mod runner;
mod sequential;
mod task;
pub mod testing;

pub use event_loop::*;
pub use job::{Job, JobError, Outcome, Panic};
pub use pool_runner::*;
pub use runner::*;
pub use sequential::*;
