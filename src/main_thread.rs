//! Storage for GUI-thread-affine state inside shared, [`Send`] structures.

use std::{
    mem,
    thread::{self, ThreadId},
};

/// Owns a value that may only be accessed from the thread that created it.
///
/// The runner's shared state travels into callbacks posted through
/// [`EventLoopProxy`][crate::EventLoopProxy], which requires it to be `Send`
/// even though the task table it contains holds `!Send` futures. Those
/// futures are only ever touched on the GUI thread; this cell encodes that
/// rule and enforces it with a thread check on every access, which doubles as
/// the guarantee that no suspended handler can resume anywhere else.
pub(crate) struct MainThreadBound<T> {
    value: Option<T>,
    owner: ThreadId,
}

impl<T> MainThreadBound<T> {
    /// Wraps `value`, binding it to the calling thread.
    pub fn new(value: T) -> Self {
        Self {
            value: Some(value),
            owner: thread::current().id(),
        }
    }

    /// Returns a reference to the contained value.
    ///
    /// # Panics
    ///
    /// Panics when called from any thread other than the owning one.
    #[track_caller]
    pub fn get(&self) -> &T {
        assert!(
            self.is_owner(),
            "GUI-thread state accessed from thread {:?}",
            thread::current().id(),
        );
        self.value.as_ref().unwrap()
    }

    /// Returns whether the calling thread is the owning thread.
    #[inline]
    pub fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }
}

impl<T> Drop for MainThreadBound<T> {
    fn drop(&mut self) {
        // Running `T`'s destructor on a foreign thread would violate the
        // affinity rule (e.g. decrementing an `Rc` count owned by the GUI
        // thread), so the value is leaked instead. Only reachable when the
        // last handle to a runner is dropped off the GUI thread during
        // teardown.
        if !self.is_owner() {
            if let Some(value) = self.value.take() {
                mem::forget(value);
            }
        }
    }
}

// SAFETY: the inner value is only handed out on the thread that created it
// (checked at runtime in `get`), and is leaked rather than dropped when the
// container is dropped on any other thread.
unsafe impl<T> Send for MainThreadBound<T> {}
unsafe impl<T> Sync for MainThreadBound<T> {}
