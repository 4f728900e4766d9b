//! Cancellable deadlines for blocking steps.
//!
//! A timer is armed with a callback. Exactly one of "fire" and "cancel" wins,
//! decided by a single compare-and-swap on the timer state, so the callback
//! runs at most once and never after a successful cancel.
//!
//! Blocking calls cannot be interrupted from the outside, so the callback is
//! expected to abort whatever the guarded step is blocked on (shut a socket
//! down, kill a process). [`TimeoutCoordinator::guard`] then reports the step
//! as timed out no matter how the aborted call returned.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

type Callback = Box<dyn FnOnce() + Send>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared state of one deadline.
pub struct Timer {
    state: AtomicU8,
    on_fire: Mutex<Option<Callback>>,
    wake: Mutex<()>,
    cv: Condvar,
}

impl Timer {
    fn new(on_fire: Callback) -> Self {
        Self {
            state: AtomicU8::new(ARMED),
            on_fire: Mutex::new(Some(on_fire)),
            wake: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) == ARMED
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    /// Run the callback if the timer is still armed. Returns whether it ran.
    pub fn fire(&self) -> bool {
        if self
            .state
            .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let callback = lock(&self.on_fire).take();
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    /// Returns true if this call moved the timer from armed to cancelled.
    fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            lock(&self.on_fire).take();
            let _guard = lock(&self.wake);
            self.cv.notify_all();
        }
        won
    }

    /// Block until `after` elapses or the timer leaves the armed state.
    pub fn wait_while_armed(&self, after: Duration) {
        let guard = lock(&self.wake);
        let _ = self
            .cv
            .wait_timeout_while(guard, after, |_| self.is_armed())
            .unwrap_or_else(|e| e.into_inner());
    }
}

/// Source of time for timers.
pub trait Clock: Send + Sync {
    /// Arrange for `timer.fire()` to be called once `after` has elapsed.
    fn schedule(&self, after: Duration, timer: Arc<Timer>);
}

/// Real time: one short-lived thread per armed timer, woken early on cancel.
#[derive(Debug, Default)]
pub struct ThreadClock;

impl Clock for ThreadClock {
    fn schedule(&self, after: Duration, timer: Arc<Timer>) {
        let spawned = thread::Builder::new()
            .name("runner-timeout".into())
            .spawn(move || {
                timer.wait_while_armed(after);
                timer.fire();
            });
        if let Err(e) = spawned {
            warn!(error = %e, "could not start timeout thread; deadline disabled");
        }
    }
}

/// Deterministic clock for tests. Timers fire on the thread calling [`ManualClock::advance`].
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
    pending: Mutex<Vec<(Duration, Arc<Timer>)>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        *lock(&self.now)
    }

    /// Move time forward and fire every timer whose deadline has passed.
    pub fn advance(&self, by: Duration) {
        let now = {
            let mut now = lock(&self.now);
            *now += by;
            *now
        };
        let due: Vec<Arc<Timer>> = {
            let mut pending = lock(&self.pending);
            let (due, rest): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|(deadline, _)| *deadline <= now);
            *pending = rest;
            due.into_iter().map(|(_, timer)| timer).collect()
        };
        for timer in due {
            timer.fire();
        }
    }

    pub fn pending(&self) -> usize {
        lock(&self.pending)
            .iter()
            .filter(|(_, timer)| timer.is_armed())
            .count()
    }
}

impl Clock for ManualClock {
    fn schedule(&self, after: Duration, timer: Arc<Timer>) {
        let deadline = self.now() + after;
        lock(&self.pending).push((deadline, timer));
    }
}

/// Handle to an armed deadline. Dropping the handle cancels it.
pub struct TimeoutHandle {
    timer: Arc<Timer>,
}

impl TimeoutHandle {
    /// Cancel the deadline. Returns true if it had not fired; in that case the
    /// callback will never run. Cancelling a fired handle is a no-op.
    pub fn cancel(&self) -> bool {
        if self.timer.cancel() {
            return true;
        }
        !self.timer.has_fired()
    }

    pub fn has_fired(&self) -> bool {
        self.timer.has_fired()
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}

/// Arms deadlines for a run and remembers them so teardown can cancel them all.
pub struct TimeoutCoordinator {
    clock: Arc<dyn Clock>,
    enabled: bool,
    armed: Mutex<Vec<Weak<Timer>>>,
}

impl TimeoutCoordinator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            enabled: true,
            armed: Mutex::new(Vec::new()),
        }
    }

    /// Real-time coordinator.
    pub fn threaded() -> Self {
        Self::new(Arc::new(ThreadClock))
    }

    /// Coordinator whose timers never fire (debug sessions sit in gdb indefinitely).
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::threaded()
        }
    }

    pub fn arm<F>(&self, duration: Duration, on_fire: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let timer = Arc::new(Timer::new(Box::new(on_fire)));
        if self.enabled {
            let mut armed = lock(&self.armed);
            armed.retain(|t| t.strong_count() > 0);
            armed.push(Arc::downgrade(&timer));
            drop(armed);
            self.clock.schedule(duration, Arc::clone(&timer));
        }
        TimeoutHandle { timer }
    }

    pub fn cancel(&self, handle: &TimeoutHandle) -> bool {
        handle.cancel()
    }

    /// Cancel every timer still armed. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let timers: Vec<Arc<Timer>> = lock(&self.armed)
            .drain(..)
            .filter_map(|t| t.upgrade())
            .collect();
        let cancelled = timers.iter().filter(|t| t.cancel()).count();
        if cancelled > 0 {
            debug!(cancelled, "cancelled outstanding timers");
        }
        cancelled
    }

    /// Run `op` under a deadline. If the deadline fires, `on_fire` aborts the
    /// step and the result is `Timeout(step, bound)` whatever `op` returned.
    pub fn guard<T, F, O>(&self, step: &str, bound: Duration, on_fire: F, op: O) -> Result<T>
    where
        F: FnOnce() + Send + 'static,
        O: FnOnce() -> Result<T>,
    {
        let handle = self.arm(bound, on_fire);
        let result = op();
        if handle.cancel() {
            result
        } else {
            if let Err(e) = &result {
                debug!(step, error = %e, "guarded step returned after its deadline fired");
            }
            Err(Error::timeout(step, bound))
        }
    }
}
