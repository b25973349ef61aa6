//! Time and task helpers shared by the whole library: spawning, sleeping,
//! repeating intervals, and the cancellable one-shot [`Timer`] used for
//! connection-attempt and acknowledgement deadlines.

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::{SystemTime, UNIX_EPOCH},
};

use futures::{Future, Stream};
use tokio::{
    sync::oneshot,
    time::{self, sleep, Duration, Instant},
};

/// Returns the milliseconds since 1/1/1970.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Spawns the given future on the runtime.
pub fn spawn<F: Future<Output = ()> + 'static + Send>(f: F) {
    tokio::spawn(f);
}

/// Waits for dur.
pub async fn wait(dur: Duration) {
    sleep(dur).await;
}

/// Waits for ms milliseconds before returning.
pub async fn wait_ms(ms: u64) {
    wait(Duration::from_millis(ms)).await;
}

/// A cancellable one-shot timer. The action runs on the runtime after
/// `delay` unless the timer is cancelled or dropped first.
pub struct Timer {
    cancel: Option<oneshot::Sender<()>>,
}

impl Timer {
    pub fn after<F: FnOnce() + Send + 'static>(delay: Duration, action: F) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        spawn(async move {
            tokio::select! {
                _ = wait(delay) => action(),
                _ = cancel_rx => {}
            }
        });
        Self {
            cancel: Some(cancel_tx),
        }
    }

    /// Cancels the timer. A timer that already fired stays fired; cancelling
    /// twice is a no-op. Dropping the timer cancels it as well.
    pub fn cancel(&mut self) {
        self.cancel = None;
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timer")
    }
}

/// Interval stream that sends the expected wall-clock time in regular
/// intervals. It wraps tokio's interval but yields an `i64` timestamp
/// instead of an `Instant`.
pub struct Interval {
    interval: time::Interval,
    next: i64,
    dur: i64,
}

impl Interval {
    /// Creates a new stream of Interval starting at next_millis and firing
    /// every dur.
    pub fn new(next_millis: i64, dur: Duration) -> Self {
        let next = Instant::now()
            .checked_add(Duration::from_millis((next_millis - now()).max(0) as u64))
            .expect("interval start out of range");
        Self {
            interval: time::interval_at(next, dur),
            next: next_millis,
            dur: dur.as_millis() as i64,
        }
    }

    /// Creates a new stream of Interval starting now and firing every dur.
    pub fn new_interval(dur: Duration) -> Self {
        Self::new(now(), dur)
    }
}

impl Stream for Interval {
    type Item = i64;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.interval.poll_tick(cx) {
            Poll::Ready(_) => {
                let this = self.next;
                self.next += self.dur;
                Poll::Ready(Some(this))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn timer_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_cl = Arc::clone(&fired);
        let _timer = Timer::after(Duration::from_millis(20), move || {
            fired_cl.store(true, Ordering::Relaxed);
        });
        wait_ms(100).await;
        assert!(fired.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn cancelled_timer_stays_quiet() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_cl = Arc::clone(&fired);
        let mut timer = Timer::after(Duration::from_millis(20), move || {
            fired_cl.store(true, Ordering::Relaxed);
        });
        timer.cancel();
        wait_ms(100).await;
        assert!(!fired.load(Ordering::Relaxed));
    }
}
