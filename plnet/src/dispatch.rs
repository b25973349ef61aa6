//! User-callback dispatch. Application callbacks run on the executor, never
//! on the event loop, so slow user code can't stall the state machines.
//! Every lane is a FIFO task of its own: callbacks for one peer keep their
//! order, different peers run independently. Panics in user code are caught
//! and logged at the lane boundary.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use plarch::tasks::spawn;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct Dispatcher {
    lanes: Arc<Mutex<HashMap<String, UnboundedSender<Job>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queues a job on the given lane, creating the lane task on first use.
    pub fn run(&self, lane: &str, job: Job) {
        let mut lanes = self.lanes.lock().expect("dispatcher lock poisoned");
        let tx = lanes.entry(lane.to_string()).or_insert_with(|| {
            let (tx, mut rx) = unbounded_channel::<Job>();
            spawn(async move {
                while let Some(job) = rx.recv().await {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        log::error!("A user callback panicked; continuing");
                    }
                }
            });
            tx
        });
        if tx.send(job).is_err() {
            log::warn!("Dispatch lane {lane} is gone, dropping callback");
        }
    }

    /// Drops a lane; queued jobs still run, new jobs start a fresh lane.
    pub fn drop_lane(&self, lane: &str) {
        self.lanes
            .lock()
            .expect("dispatcher lock poisoned")
            .remove(lane);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dispatcher")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use plarch::tasks::wait_ms;

    use super::*;

    #[tokio::test]
    async fn lanes_keep_order_and_survive_panics() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(vec![]));

        for i in 0..5 {
            let seen = Arc::clone(&seen);
            dispatcher.run(
                "peer",
                Box::new(move || {
                    if i == 2 {
                        panic!("boom");
                    }
                    seen.lock().unwrap().push(i);
                }),
            );
        }
        wait_ms(100).await;
        assert_eq!(vec![0, 1, 3, 4], *seen.lock().unwrap());
    }

    #[tokio::test]
    async fn dropped_lane_restarts() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        dispatcher.run("a", Box::new(move || drop(c.fetch_add(1, Ordering::Relaxed))));
        dispatcher.drop_lane("a");
        let c = Arc::clone(&count);
        dispatcher.run("a", Box::new(move || drop(c.fetch_add(1, Ordering::Relaxed))));

        wait_ms(100).await;
        assert_eq!(2, count.load(Ordering::Relaxed));
    }
}
