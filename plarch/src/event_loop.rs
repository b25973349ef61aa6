//! # EventLoop - a single-threaded FIFO executor for typed events
//!
//! An [`EventLoop<I, O>`] owns a queue of input events `I` and output events
//! `O`. All registered [`EventHandler`]s run on one processing task, one
//! event batch at a time, so every state mutation that happens inside a
//! handler is serialized. Threads that want to change state never touch it
//! directly: they [`EventLoop::post`] an event and the processing task does
//! the rest.
//!
//! Outputs fan out to taps (channels, mostly used by tests and wrappers) and
//! to pipes, which translate them into the input type of another loop. A
//! pipe carries a trail of loop ids so a message forwarded in a cycle is
//! detected and dropped.
//!
//! Handlers that panic are caught and logged; the loop keeps processing the
//! next event.

use core::fmt;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{channel, Receiver, Sender},
        Arc,
    },
};

use async_trait::async_trait;
use futures::{lock::Mutex, FutureExt};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::tasks::spawn;

#[derive(Debug, Error)]
/// The only failure mode of a loop handle: the processing task is gone.
pub enum LoopError {
    /// Couldn't enqueue to this loop.
    #[error("while queueing to {0}")]
    Enqueue(String),
}

/// Identifies a loop instance, used for forward-cycle detection.
pub type LoopId = u64;

/// Anything that can travel through a loop.
pub trait Event: Clone + fmt::Debug + Send + Sync {}
impl<M: Clone + fmt::Debug + Send + Sync> Event for M {}

/// Where a queued event came from. Forwarded events carry the ids of the
/// loops they already passed through.
#[derive(Debug, Clone, PartialEq)]
pub enum Origin {
    Local,
    Forwarded(Vec<LoopId>),
}

impl Origin {
    fn trail(&self) -> Vec<LoopId> {
        match self {
            Origin::Local => vec![],
            Origin::Forwarded(t) => t.clone(),
        }
    }
}

/// Converts an event of one loop into an event of another, or drops it.
pub type Translate<A, B> = Box<dyn Fn(A) -> Option<B> + Send + Sync + 'static>;

/// A state machine driven by the loop. Inputs arrive in FIFO order; returned
/// outputs are queued on the same loop.
#[async_trait]
pub trait EventHandler<I: Event, O: Event>: Send {
    async fn events(&mut self, inputs: Vec<I>) -> Vec<O>;
}

/// Forwards outputs of one loop into another one. Implemented by [`Pipe`];
/// only public because it shows up in [`Subsystem`].
#[async_trait]
pub trait Forwarder<O: Event>: Send {
    fn forward(&self, trail: &[LoopId], msg: O);
    async fn settle(&self, callers: Vec<LoopId>) -> anyhow::Result<()>;
}

/// Subsystems a loop dispatches to. Taps observe outputs, handlers consume
/// inputs and produce outputs, pipes forward outputs to other loops.
pub enum Subsystem<I, O> {
    Tap(UnboundedSender<O>),
    TapSync(Sender<O>),
    Handler(Box<dyn EventHandler<I, O>>),
    Pipe(Box<dyn Forwarder<O>>),
}

impl<I, O> fmt::Debug for Subsystem<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tap(_) => write!(f, "Tap"),
            Self::TapSync(_) => write!(f, "TapSync"),
            Self::Handler(_) => write!(f, "Handler"),
            Self::Pipe(_) => write!(f, "Pipe"),
        }
    }
}

/// The loop handle. Cheap to clone; all clones feed the same processing
/// task. The task shuts down once the last clone is dropped.
pub struct EventLoop<I: Event + 'static, O: Event + 'static> {
    ctrl_tx: UnboundedSender<Ctrl<I, O>>,
    // Held locked by the processing task for its whole life; keeping a
    // reference here makes sure it is dropped last.
    _inner: Arc<Mutex<Inner<I, O>>>,
    subsystem_count: Arc<AtomicUsize>,
    id: LoopId,
}

impl<I: Event + 'static, O: Event + 'static> fmt::Debug for EventLoop<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventLoop<{}>", self.id)
    }
}

impl<I: Event + 'static, O: Event + 'static> Default for EventLoop<I, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Event + 'static, O: Event + 'static> Clone for EventLoop<I, O> {
    fn clone(&self) -> Self {
        self.ctrl_tx
            .send(Ctrl::Cloned)
            .expect("Couldn't inform the processing task of cloning");
        Self {
            ctrl_tx: self.ctrl_tx.clone(),
            _inner: Arc::clone(&self._inner),
            subsystem_count: Arc::clone(&self.subsystem_count),
            id: self.id,
        }
    }
}

impl<I: Event + 'static, O: Event + 'static> Drop for EventLoop<I, O> {
    fn drop(&mut self) {
        self.ctrl_tx
            .send(Ctrl::Dropped)
            .err()
            .map(|e| log::trace!("{self:?}: couldn't send Dropped: {e:?}"));
    }
}

impl<I: Event + 'static, O: Event + 'static> EventLoop<I, O> {
    /// Creates a loop without any subsystems and starts its processing task.
    pub fn new() -> Self {
        let id = rand::random::<LoopId>();
        let (ctrl_tx, inner) = Inner::start(id);
        Self {
            ctrl_tx,
            _inner: inner,
            subsystem_count: Arc::new(AtomicUsize::new(0)),
            id,
        }
    }

    pub fn id(&self) -> LoopId {
        self.id
    }

    fn add_subsystem(&self, ss: Subsystem<I, O>) -> anyhow::Result<usize> {
        let index = self.subsystem_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.ctrl_tx
            .send(Ctrl::Subsystem(SubsystemAction::Add(index, ss)))
            .map_err(|_| LoopError::Enqueue("add_subsystem".into()))?;
        Ok(index)
    }

    /// Registers a handler; returns its index for later removal.
    pub fn add_handler(&self, handler: Box<dyn EventHandler<I, O>>) -> anyhow::Result<usize> {
        self.add_subsystem(Subsystem::Handler(handler))
    }

    /// Removes a subsystem and waits until the removal took effect.
    pub async fn remove_subsystem(&self, index: usize) -> anyhow::Result<()> {
        self.ctrl_tx
            .send(Ctrl::Subsystem(SubsystemAction::Remove(index)))
            .map_err(|_| LoopError::Enqueue("remove_subsystem".into()))?;
        self.settle(vec![]).await
    }

    /// Returns an async channel observing all outputs of this loop.
    pub fn get_tap(&self) -> anyhow::Result<(UnboundedReceiver<O>, usize)> {
        let (tx, rx) = unbounded_channel();
        let index = self.add_subsystem(Subsystem::Tap(tx))?;
        Ok((rx, index))
    }

    /// Returns a synchronous channel observing all outputs. Mostly for
    /// tests; prefer [`EventLoop::get_tap`] in async code.
    pub fn get_tap_sync(&self) -> anyhow::Result<(Receiver<O>, usize)> {
        let (tx, rx) = channel();
        let index = self.add_subsystem(Subsystem::TapSync(tx))?;
        Ok((rx, index))
    }

    /// Forwards every output of this loop, run through `translate`, into the
    /// input queue of `target`.
    pub fn pipe<TI: Event + 'static, TO: Event + 'static>(
        &self,
        target: EventLoop<TI, TO>,
        translate: Translate<O, TI>,
    ) -> anyhow::Result<usize> {
        self.add_subsystem(Subsystem::Pipe(Box::new(Pipe { target, translate })))
    }

    /// Enqueues an input event. Never blocks; the event is processed by the
    /// loop task in arrival order.
    pub fn post(&self, msg: I) -> anyhow::Result<()> {
        self.post_dest(Origin::Local, msg)
    }

    pub(crate) fn post_dest(&self, origin: Origin, msg: I) -> anyhow::Result<()> {
        Ok(self
            .ctrl_tx
            .send(Ctrl::In(origin, msg))
            .map_err(|_| LoopError::Enqueue("post".into()))?)
    }

    /// Enqueues an output event, bypassing the handlers. Used by trampolines
    /// that report engine results straight to the loop's observers.
    pub fn post_out(&self, msg: O) -> anyhow::Result<()> {
        Ok(self
            .ctrl_tx
            .send(Ctrl::Out(Origin::Local, msg))
            .map_err(|_| LoopError::Enqueue("post_out".into()))?)
    }

    /// Posts an input and waits for this loop and all piped loops to run
    /// their queues dry.
    pub async fn settle_post(&self, msg: I) -> anyhow::Result<()> {
        self.post(msg)?;
        self.settle(vec![]).await
    }

    /// Waits until all queued events here and in piped loops are handled.
    /// `callers` is used when settling recursively to avoid endless loops.
    pub async fn settle(&self, callers: Vec<LoopId>) -> anyhow::Result<()> {
        let (tx, mut rx) = unbounded_channel();
        self.ctrl_tx
            .send(Ctrl::Settle(callers, tx))
            .map_err(|_| LoopError::Enqueue("settle".into()))?;
        rx.recv().await;
        Ok(())
    }
}

struct Pipe<O: Event, TI: Event + 'static, TO: Event + 'static> {
    target: EventLoop<TI, TO>,
    translate: Translate<O, TI>,
}

#[async_trait]
impl<O: Event, TI: Event + 'static, TO: Event + 'static> Forwarder<O> for Pipe<O, TI, TO> {
    fn forward(&self, trail: &[LoopId], msg: O) {
        if let Some(translated) = (self.translate)(msg) {
            if trail.contains(&self.target.id) {
                log::warn!("Endless forward-loop detected, dropping message");
                return;
            }
            self.target
                .post_dest(Origin::Forwarded(trail.to_vec()), translated)
                .err()
                .map(|e| log::error!("Piped message couldn't be queued: {e}"));
        }
    }

    async fn settle(&self, callers: Vec<LoopId>) -> anyhow::Result<()> {
        if !callers.contains(&self.target.id) {
            self.target.settle(callers).await?;
        }
        Ok(())
    }
}

enum Ctrl<I: Event, O: Event> {
    Subsystem(SubsystemAction<I, O>),
    In(Origin, I),
    Out(Origin, O),
    Settle(Vec<LoopId>, UnboundedSender<bool>),
    Cloned,
    Dropped,
}

enum SubsystemAction<I, O> {
    Add(usize, Subsystem<I, O>),
    Remove(usize),
}

struct Inner<I: Event + 'static, O: Event + 'static> {
    ctrl_rx: UnboundedReceiver<Ctrl<I, O>>,
    subsystems: HashMap<usize, Subsystem<I, O>>,
    queue_in: Vec<(Origin, I)>,
    queue_out: Vec<(Origin, O)>,
    id: LoopId,
    copies: usize,
}

impl<I: Event + 'static, O: Event + 'static> Inner<I, O> {
    fn start(id: LoopId) -> (UnboundedSender<Ctrl<I, O>>, Arc<Mutex<Inner<I, O>>>) {
        log::trace!(
            "Creating EventLoop {} for {} -> {}",
            id,
            std::any::type_name::<I>(),
            std::any::type_name::<O>()
        );
        let (ctrl_tx, ctrl_rx) = unbounded_channel::<Ctrl<I, O>>();
        let inner = Arc::new(Mutex::new(Self {
            ctrl_rx,
            subsystems: HashMap::new(),
            queue_in: vec![],
            queue_out: vec![],
            id,
            copies: 1,
        }));

        let inner_arc = Arc::clone(&inner);
        spawn(async move {
            let mut inner = inner_arc.try_lock().expect("getting the loop lock");
            loop {
                if !inner.next_ctrl().await {
                    return;
                }
                if !inner.queue_in.is_empty() || !inner.queue_out.is_empty() {
                    let handled = inner.process().await;
                    log::trace!("{}: processed {handled} events", inner.type_str());
                }
            }
        });

        (ctrl_tx, inner)
    }

    // Blocks until the next control message is available. Returns false once
    // the loop should shut down.
    async fn next_ctrl(&mut self) -> bool {
        let ctrl = match self.ctrl_rx.recv().await {
            Some(ctrl) => ctrl,
            None => {
                log::warn!("{}/{}: queue closed unexpectedly", self.id, self.type_str());
                return false;
            }
        };
        match ctrl {
            Ctrl::Subsystem(action) => self.subsystem_action(action),
            Ctrl::In(origin, msg) => self.queue_in.push((origin, msg)),
            Ctrl::Out(origin, msg) => self.queue_out.push((origin, msg)),
            Ctrl::Settle(callers, reply) => {
                if !callers.contains(&self.id) {
                    let mut callers = callers.clone();
                    callers.push(self.id);
                    for ss in self.subsystems.values_mut() {
                        if let Subsystem::Pipe(pipe) = ss {
                            pipe.settle(callers.clone())
                                .await
                                .err()
                                .map(|e| log::error!("While settling: {e:?}"));
                        }
                    }
                }
                reply
                    .send(true)
                    .err()
                    .map(|e| log::error!("Couldn't reply to settle: {e:?}"));
            }
            Ctrl::Cloned => self.copies += 1,
            Ctrl::Dropped => {
                self.copies -= 1;
                if self.copies == 0 {
                    self.subsystems = HashMap::new();
                    return false;
                }
            }
        };
        true
    }

    async fn process(&mut self) -> usize {
        let mut handled = 0;
        loop {
            handled += self.queue_in.len() + self.queue_out.len();
            self.process_once().await;
            if self.queue_in.is_empty() && self.queue_out.is_empty() {
                break;
            }
        }
        handled
    }

    // One pass: forward outputs through the pipes, then to the taps, then
    // feed the inputs to the handlers and queue whatever they produce.
    async fn process_once(&mut self) {
        self.forward_out();

        let mut faulty = self.send_taps();
        self.queue_out.clear();

        self.run_handlers().await;
        self.queue_in.clear();

        faulty.sort_unstable();
        for index in faulty.iter().rev() {
            self.subsystem_action(SubsystemAction::Remove(*index));
        }
    }

    fn forward_out(&mut self) {
        for (origin, msg) in &self.queue_out {
            let mut trail = origin.trail();
            if trail.contains(&self.id) {
                log::warn!("{}: endless forward-loop detected, dropping", self.type_str());
                continue;
            }
            trail.push(self.id);
            for ss in self.subsystems.values_mut() {
                if let Subsystem::Pipe(pipe) = ss {
                    pipe.forward(&trail, msg.clone());
                }
            }
        }
    }

    fn send_taps(&mut self) -> Vec<usize> {
        let mut faulty = vec![];
        let msgs: Vec<O> = self.queue_out.iter().map(|(_, msg)| msg.clone()).collect();
        if msgs.is_empty() {
            return faulty;
        }
        let type_str = self.type_str();
        for (index, ss) in self.subsystems.iter_mut() {
            let gone = match ss {
                Subsystem::Tap(tx) => msgs.iter().any(|msg| tx.send(msg.clone()).is_err()),
                Subsystem::TapSync(tx) => msgs.iter().any(|msg| tx.send(msg.clone()).is_err()),
                _ => false,
            };
            if gone {
                log::trace!("{}: tap {} is closed, removing it", type_str, index);
                faulty.push(*index);
            }
        }
        faulty
    }

    async fn run_handlers(&mut self) {
        if self.queue_in.is_empty() {
            return;
        }
        let inputs: Vec<I> = self.queue_in.iter().map(|(_, msg)| msg.clone()).collect();
        let mut produced = vec![];
        let type_str = self.type_str();
        for ss in self.subsystems.values_mut() {
            if let Subsystem::Handler(handler) = ss {
                match std::panic::AssertUnwindSafe(handler.events(inputs.clone()))
                    .catch_unwind()
                    .await
                {
                    Ok(outputs) => produced.extend(outputs),
                    Err(_) => log::error!("{}: handler panicked, events dropped", type_str),
                }
            }
        }
        self.queue_out
            .extend(produced.into_iter().map(|msg| (Origin::Local, msg)));
    }

    fn subsystem_action(&mut self, action: SubsystemAction<I, O>) {
        match action {
            SubsystemAction::Add(index, ss) => {
                self.subsystems.insert(index, ss);
            }
            SubsystemAction::Remove(index) => {
                self.subsystems.remove(&index);
            }
        }
    }

    fn type_str(&self) -> String {
        format!(
            "<{},{}>",
            std::any::type_name::<I>(),
            std::any::type_name::<O>()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::start_logging_filter_level;

    #[derive(Debug, Clone, PartialEq)]
    enum TestIn {
        Ping,
        Other,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum TestOut {
        Pong,
    }

    struct Echo {}

    #[async_trait]
    impl EventHandler<TestIn, TestOut> for Echo {
        async fn events(&mut self, inputs: Vec<TestIn>) -> Vec<TestOut> {
            inputs
                .iter()
                .filter(|msg| matches!(msg, TestIn::Ping))
                .map(|_| TestOut::Pong)
                .collect()
        }
    }

    #[tokio::test]
    async fn handler_replies() -> anyhow::Result<()> {
        start_logging_filter_level(vec![], log::LevelFilter::Info);

        let event_loop: EventLoop<TestIn, TestOut> = EventLoop::new();
        event_loop.add_handler(Box::new(Echo {}))?;
        let (tap, _) = event_loop.get_tap_sync()?;

        event_loop.settle_post(TestIn::Ping).await?;
        assert_eq!(1, tap.try_iter().count());

        event_loop.settle_post(TestIn::Other).await?;
        assert_eq!(0, tap.try_iter().count());

        // A second handler doubles the replies.
        event_loop.add_handler(Box::new(Echo {}))?;
        event_loop.settle_post(TestIn::Ping).await?;
        assert_eq!(2, tap.try_iter().count());
        Ok(())
    }

    #[derive(Debug, Clone, PartialEq)]
    enum OtherIn {
        FromFirst,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum OtherOut {
        Nothing,
    }

    #[tokio::test]
    async fn pipe_forwards() -> anyhow::Result<()> {
        start_logging_filter_level(vec![], log::LevelFilter::Info);

        let first: EventLoop<TestIn, TestOut> = EventLoop::new();
        first.add_handler(Box::new(Echo {}))?;
        let second: EventLoop<OtherIn, OtherOut> = EventLoop::new();
        let (second_tap, _) = second.get_tap_sync()?;

        first.pipe(
            second.clone(),
            Box::new(|msg| matches!(msg, TestOut::Pong).then_some(OtherIn::FromFirst)),
        )?;

        struct Check {}
        #[async_trait]
        impl EventHandler<OtherIn, OtherOut> for Check {
            async fn events(&mut self, inputs: Vec<OtherIn>) -> Vec<OtherOut> {
                inputs.iter().map(|_| OtherOut::Nothing).collect()
            }
        }
        second.add_handler(Box::new(Check {}))?;

        first.settle_post(TestIn::Ping).await?;
        second.settle(vec![]).await?;
        assert_eq!(Ok(OtherOut::Nothing), second_tap.try_recv());
        Ok(())
    }

    #[tokio::test]
    async fn panicking_handler_keeps_loop_alive() -> anyhow::Result<()> {
        start_logging_filter_level(vec![], log::LevelFilter::Error);

        struct Panics {}
        #[async_trait]
        impl EventHandler<TestIn, TestOut> for Panics {
            async fn events(&mut self, inputs: Vec<TestIn>) -> Vec<TestOut> {
                if inputs.contains(&TestIn::Other) {
                    panic!("boom");
                }
                vec![TestOut::Pong]
            }
        }

        let event_loop: EventLoop<TestIn, TestOut> = EventLoop::new();
        event_loop.add_handler(Box::new(Panics {}))?;
        let (tap, _) = event_loop.get_tap_sync()?;

        event_loop.settle_post(TestIn::Other).await?;
        assert_eq!(0, tap.try_iter().count());

        event_loop.settle_post(TestIn::Ping).await?;
        assert_eq!(1, tap.try_iter().count());
        Ok(())
    }
}
