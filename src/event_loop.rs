//! The boundary to the host GUI framework.

/// The cross-thread posting primitive of the host event loop.
///
/// This is the single thing a GUI framework must provide for
/// [`PoolRunner`][crate::PoolRunner] to route worker completions back to the
/// GUI thread. Every mainstream toolkit has a suitable primitive: Qt's queued
/// signal emission, glib's `MainContext::invoke`, winit's `EventLoopProxy`,
/// and so on. The headless [`TestLoop`][crate::testing::TestLoop] implements
/// it for tests.
pub trait EventLoopProxy: Send + Sync + 'static {
    /// Schedules `callback` to run on the GUI thread at the next event-loop
    /// turn.
    ///
    /// Must be callable from any thread (including the GUI thread itself),
    /// must not block the caller, and must wake the event loop if it is
    /// currently waiting for events. Callbacks posted from a single thread
    /// must run in posting order; posts from different threads may interleave
    /// arbitrarily.
    fn post(&self, callback: Box<dyn FnOnce() + Send + 'static>);
}
