//! The worker pool that executes blocking jobs off the GUI thread.

use std::{
    io,
    panic::{self, resume_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::Sender;

use crate::job::{Job, JobError, JobId, Outcome, Panic};

/// Where workers hand finished outcomes. Invoked on the worker thread; the
/// implementation is responsible for crossing back to the GUI thread.
pub(crate) type CompletionFn = Arc<dyn Fn(JobId, Outcome) + Send + Sync>;

/// One unit of work queued for the pool.
pub(crate) struct Submission {
    pub id: JobId,
    pub job: Job,
}

/// A fixed-size set of worker threads consuming a single shared FIFO queue.
///
/// Every worker loops: dequeue a submission, run its callable, capture the
/// outcome (return value or panic payload), hand the outcome to the
/// completion function. Submissions are picked up in FIFO order, but nothing
/// is guaranteed about the order in which outcomes are produced.
pub(crate) struct WorkerPool {
    sender: Option<Sender<Submission>>,
    handles: Vec<JoinHandle<()>>,
    /// Set to make workers discard queued submissions instead of running them.
    stop: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `count` worker threads named `"{name}-{i}"`.
    pub fn spawn(count: usize, name: &str, complete: CompletionFn) -> io::Result<WorkerPool> {
        assert_ne!(count, 0, "count must be at least 1");

        let stop = Arc::new(AtomicBool::new(false));
        let (sender, recv) = crossbeam_channel::unbounded::<Submission>();
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let thread_name = format!("{name}-{i}");
            let builder = thread::Builder::new().name(thread_name.clone());
            let recv = recv.clone();
            let stop = stop.clone();
            let complete = complete.clone();
            let handle = builder.spawn(move || {
                log::trace!("worker '{thread_name}' starting");
                let _guard = defer(move || log::trace!("worker '{thread_name}' exiting"));
                for Submission { id, job } in recv {
                    if stop.load(Ordering::Acquire) {
                        // The pool is shutting down; queued submissions are
                        // discarded without running.
                        break;
                    }
                    let outcome = panic::catch_unwind(AssertUnwindSafe(job))
                        .map_err(|payload| JobError::Panicked(Panic::new(payload)));
                    complete(id, outcome);
                }
            })?;
            handles.push(handle);
        }

        Ok(WorkerPool {
            sender: Some(sender),
            handles,
            stop,
        })
    }

    /// Queues a submission for execution. Non-blocking and safe from the GUI
    /// thread.
    ///
    /// Returns `false` if the pool has already been stopped, in which case
    /// the submission was dropped without running.
    pub fn submit(&self, submission: Submission) -> bool {
        match &self.sender {
            Some(sender) => sender.send(submission).is_ok(),
            None => false,
        }
    }

    /// Stops the pool: submissions currently executing are drained, queued
    /// ones are discarded, and all worker threads are joined.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Close the channel so idle workers exit their receive loop.
        drop(self.sender.take());
        self.wait_for_exit();
    }

    fn wait_for_exit(&mut self) {
        // Join all threads and propagate a panic if one of them panicked
        // outside of a job (job panics are captured as outcomes).
        let mut payload = None;
        for handle in self.handles.drain(..) {
            if let Err(pl) = handle.join() {
                payload = Some(pl);
            }
        }
        if let Some(payload) = payload {
            if !thread::panicking() {
                resume_unwind(payload);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drop guard returned by [`defer`].
#[must_use = "`Defer` should be assigned to a variable, or it will be dropped immediately"]
struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        (self.0.take().unwrap())();
    }
}

/// Returns a value that runs `cb` when dropped.
fn defer<F: FnOnce()>(cb: F) -> Defer<F> {
    Defer(Some(cb))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        time::Duration,
    };

    use super::*;

    fn collecting_pool(count: usize) -> (WorkerPool, Arc<Mutex<Vec<(JobId, Option<i32>)>>>) {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let complete: CompletionFn = Arc::new(move |id, outcome: Outcome| {
            let value = outcome.ok().map(|v| *v.downcast::<i32>().unwrap());
            sink.lock().unwrap().push((id, value));
        });
        let pool = WorkerPool::spawn(count, "test", complete).unwrap();
        (pool, outcomes)
    }

    fn job(f: impl FnOnce() -> i32 + Send + 'static) -> Job {
        Box::new(move || Box::new(f()))
    }

    /// Spins until `pred` is true; panics after a few seconds.
    fn wait_until(mut pred: impl FnMut() -> bool) {
        for _ in 0..500 {
            if pred() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn runs_submissions_in_fifo_order() {
        let (mut pool, outcomes) = collecting_pool(1);
        for i in 0..10 {
            pool.submit(Submission {
                id: JobId(i),
                job: job(move || i as i32),
            });
        }
        wait_until(|| outcomes.lock().unwrap().len() == 10);
        pool.stop();

        let outcomes = outcomes.lock().unwrap();
        let ids: Vec<u64> = outcomes.iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, (0..10).collect::<Vec<u64>>());
    }

    #[test]
    fn captures_panics_as_outcomes() {
        let captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        let complete: CompletionFn = Arc::new(move |_, outcome: Outcome| {
            *sink.lock().unwrap() = Some(outcome);
        });
        let mut pool = WorkerPool::spawn(1, "test", complete).unwrap();
        pool.submit(Submission {
            id: JobId(0),
            job: Box::new(|| panic!("boom")),
        });
        wait_until(|| captured.lock().unwrap().is_some());
        pool.stop();

        let outcome = captured.lock().unwrap().take().unwrap();
        match outcome {
            Err(JobError::Panicked(panic)) => assert_eq!(panic.message(), Some("boom")),
            other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn stop_discards_queued_submissions() {
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);

        let (mut pool, outcomes) = collecting_pool(1);
        pool.submit(Submission {
            id: JobId(0),
            job: job(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                1
            }),
        });
        pool.submit(Submission {
            id: JobId(1),
            job: job(|| 2),
        });

        started_rx.recv().unwrap();
        // Release the running job shortly after `stop` has set the stop flag.
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            release_tx.send(()).unwrap();
        });
        pool.stop();
        releaser.join().unwrap();

        // The executing submission was drained, the queued one discarded.
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], (JobId(0), Some(1)));
    }

    #[test]
    fn submit_after_stop_reports_failure() {
        let (mut pool, _) = collecting_pool(1);
        pool.stop();
        assert!(!pool.submit(Submission {
            id: JobId(0),
            job: job(|| 3),
        }));
    }

    #[test]
    fn parallel_workers_make_progress_concurrently() {
        let (barrier_tx, barrier_rx) = crossbeam_channel::bounded::<()>(0);

        let (mut pool, outcomes) = collecting_pool(2);
        // Two jobs that can only finish if they run at the same time.
        let tx = barrier_tx.clone();
        pool.submit(Submission {
            id: JobId(0),
            job: job(move || {
                tx.send(()).unwrap();
                10
            }),
        });
        pool.submit(Submission {
            id: JobId(1),
            job: job(move || {
                barrier_rx.recv().unwrap();
                20
            }),
        });
        wait_until(|| outcomes.lock().unwrap().len() == 2);
        pool.stop();

        let mut values: Vec<Option<i32>> =
            outcomes.lock().unwrap().iter().map(|(_, v)| *v).collect();
        values.sort();
        assert_eq!(values, vec![Some(10), Some(20)]);
    }
}
