//! Scoped wait/notify primitive bridging engine callbacks to blocking calls
//!
//! Every operation that waits for an engine-driven outcome parks the calling
//! thread on a [`SyncEvent`]: a mutex paired with a condition variable. The
//! waiter acquires the lock *before* issuing the engine command and keeps it
//! (via [`SyncEventGuard`]) until it is parked on the condvar, so a callback
//! that fires in between blocks inside `notify_*` until the waiter is actually
//! waiting. A notification can therefore never slip past a guard holder.
//!
//! ```text
//! caller thread                         engine callback thread
//!   │ guard = event.start()  ──locks──┐
//!   │ engine command issued           │
//!   │ guard.wait()  ──parks, unlocks──┤
//!   │                                 │  record result fields
//!   │◄── woken ────────────────────── │  event.notify_one()  (takes lock)
//!   │ read result fields
//! ```
//!
//! Notifications delivered while no guard exists are intentionally lost; the
//! contract everywhere in this crate is "wake and re-check state", not "wake
//! exactly one correct waiter".

use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// A mutex/condition-variable pair for one asynchronous completion.
pub struct SyncEvent {
    lock: Mutex<()>,
    cond: Condvar,
}

/// Scoped lock on a [`SyncEvent`]; dropping it releases the lock.
pub struct SyncEventGuard<'a> {
    event: &'a SyncEvent,
    guard: MutexGuard<'a, ()>,
}

impl SyncEvent {
    /// Create a new, unsignalled event.
    pub fn new() -> Self {
        SyncEvent { lock: Mutex::new(()), cond: Condvar::new() }
    }

    /// Acquire the event lock, starting the wait window.
    ///
    /// Hold the returned guard across the engine command and the `wait()`
    /// call; the completion callback cannot deliver its notification while
    /// the guard is held outside of `wait()`.
    pub fn start(&self) -> SyncEventGuard<'_> {
        SyncEventGuard { event: self, guard: self.lock.lock() }
    }

    /// Wake one waiter. Blocks until the lock is free.
    pub fn notify_one(&self) {
        let _held = self.lock.lock();
        self.cond.notify_one();
    }

    /// Wake every waiter. Blocks until the lock is free.
    pub fn notify_all(&self) {
        let _held = self.lock.lock();
        self.cond.notify_all();
    }
}

impl Default for SyncEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEventGuard<'_> {
    /// Park until the event is notified.
    ///
    /// parking_lot condvars do not wake spuriously, so a return from `wait`
    /// always corresponds to a `notify_*` call. Multi-waiter sites must still
    /// re-check their own state: `notify_all` wakes threads whose condition
    /// has not changed.
    pub fn wait(&mut self) {
        self.event.cond.wait(&mut self.guard);
    }

    /// Park until the event is notified or `timeout` elapses.
    ///
    /// Returns `true` if notified, `false` on timeout.
    pub fn wait_for(&mut self, timeout: Duration) -> bool {
        !self.event.cond.wait_for(&mut self.guard, timeout).timed_out()
    }
}
