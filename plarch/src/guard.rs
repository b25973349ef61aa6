//! # AwaitGuard - a one-shot latch for synchronous facades
//!
//! Synchronous public calls post their work to the event loop and then block
//! the calling thread on an [`AwaitGuard`] until the loop (or a bridge task)
//! steps it down with the outcome. Guards are disposable: one guard per
//! operation, never reused.

use std::{
    fmt,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

enum Slot<T> {
    Pending,
    Done(Option<T>),
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

/// A single-use latch carrying the outcome of one asynchronous operation.
/// `step_down` is idempotent: the first value wins, later calls are ignored.
pub struct AwaitGuard<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for AwaitGuard<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for AwaitGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AwaitGuard")
    }
}

impl<T> Default for AwaitGuard<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AwaitGuard<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    /// Completes the guard and wakes the waiter. Only the first call has an
    /// effect; a step-down after the waiter timed out is dropped.
    pub fn step_down(&self, value: T) {
        let mut slot = self.inner.slot.lock().expect("guard lock poisoned");
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Done(Some(value));
            self.inner.cond.notify_one();
        }
    }

    /// Blocks the calling thread until the guard is stepped down or the
    /// timeout elapses. Returns `None` on timeout; a late completion is
    /// then dropped.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock().expect("guard lock poisoned");
        loop {
            if let Slot::Done(value) = &mut *slot {
                return value.take();
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, result) = self
                .inner
                .cond
                .wait_timeout(slot, remaining)
                .expect("guard lock poisoned");
            slot = guard;
            if result.timed_out() {
                if let Slot::Done(value) = &mut *slot {
                    return value.take();
                }
                return None;
            }
        }
    }

    /// Non-blocking check, taking the value if it is already there.
    pub fn try_take(&self) -> Option<T> {
        match &mut *self.inner.slot.lock().expect("guard lock poisoned") {
            Slot::Done(value) => value.take(),
            Slot::Pending => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_down_before_wait() {
        let guard = AwaitGuard::new();
        guard.step_down(42);
        assert_eq!(Some(42), guard.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn first_step_down_wins() {
        let guard = AwaitGuard::new();
        guard.step_down(1);
        guard.step_down(2);
        assert_eq!(Some(1), guard.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn times_out_when_nobody_steps_down() {
        let guard: AwaitGuard<u32> = AwaitGuard::new();
        assert_eq!(None, guard.wait_timeout(Duration::from_millis(20)));
        // A late completion is ignored.
        guard.step_down(7);
        assert_eq!(Some(7), guard.try_take());
    }

    #[test]
    fn wakes_waiter_across_threads() {
        let guard = AwaitGuard::new();
        let stepper = guard.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            stepper.step_down("done");
        });
        assert_eq!(Some("done"), guard.wait_timeout(Duration::from_secs(5)));
    }
}
