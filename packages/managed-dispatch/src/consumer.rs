//! Consumer pipeline: admission control around "run a producer".
//!
//! A [`Run`] turns a producer into a [`Task`]. A [`Consumer`] wraps one `Run`
//! into another, so filters stack:
//!
//! ```text
//! submission ─► c1 ─► c2 ─► ... ─► cn ─► base run (controller + revocation)
//! ```
//!
//! Built-ins:
//!
//! - [`bypass`] runs immediately.
//! - [`concurrency`] keeps at most `limit` producers running, FIFO for the rest;
//!   [`series`] is `concurrency(1)`. Producers marked
//!   [`immediate`](Producer::immediate) skip the queue.
//! - [`inject`] / [`inject_with`] add extra arguments after `dispatch` and
//!   `read_state`.
//! - [`compose`] chains consumers left to right.
//!
//! # Example
//!
//! ```ignore
//! let pipeline = Compose::new()
//!     .then(inject(vec![extra(api.clone())]))
//!     .then(series());
//!
//! let dispatcher = ManagedDispatcher::builder(store.sink(), store.reader())
//!     .with_consumer(pipeline)
//!     .build();
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::core::{Action, Extra, Output, Producer};
use crate::error::{Result, ThunkError};
use crate::task::Task;

/// A function that runs a producer.
pub type Run<A, S, T> = Arc<dyn Fn(Producer<A, S, T>) -> Task<T> + Send + Sync>;

/// Transforms one [`Run`] into another.
///
/// `wrap` is called once when the dispatch boundary is built; any queue or
/// counter a consumer needs lives inside the `Run` it returns.
pub trait Consumer<A, S, T>: Send + Sync + 'static {
    /// Wrap `run` with this consumer's admission policy.
    fn wrap(&self, run: Run<A, S, T>) -> Run<A, S, T>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

// =============================================================================
// Bypass
// =============================================================================

/// Runs every producer immediately. The default consumer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bypass;

impl<A, S, T> Consumer<A, S, T> for Bypass
where
    A: Action,
    S: 'static,
    T: Output,
{
    fn wrap(&self, run: Run<A, S, T>) -> Run<A, S, T> {
        run
    }

    fn name(&self) -> &'static str {
        "bypass"
    }
}

/// The identity consumer.
pub fn bypass() -> Bypass {
    Bypass
}

// =============================================================================
// Concurrency
// =============================================================================

/// At most `limit` producers run at once; the rest wait in FIFO order.
#[derive(Debug, Clone, Copy)]
pub struct Concurrency {
    limit: usize,
}

impl Concurrency {
    /// The configured limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Allow at most `limit` producers to run at a time.
///
/// # Panics
///
/// Panics if `limit` is zero.
pub fn concurrency(limit: usize) -> Concurrency {
    assert!(limit > 0, "concurrency limit must be at least 1");
    Concurrency { limit }
}

/// Run producers strictly one at a time.
pub fn series() -> Concurrency {
    concurrency(1)
}

struct PendingTask<A, S, T> {
    producer: Producer<A, S, T>,
    completion: oneshot::Sender<Result<T>>,
    seq: u64,
}

struct QueueState<A, S, T> {
    pending: VecDeque<PendingTask<A, S, T>>,
    running: usize,
    next_seq: u64,
}

struct Queue<A, S, T> {
    run: Run<A, S, T>,
    limit: usize,
    state: Mutex<QueueState<A, S, T>>,
}

impl<A, S, T> Queue<A, S, T>
where
    A: Action,
    S: 'static,
    T: Output,
{
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<A, S, T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn submit(self: &Arc<Self>, producer: Producer<A, S, T>) -> Task<T> {
        if producer.is_immediate() {
            trace!("running immediate producer outside the queue");
            return (self.run)(producer);
        }

        let (completion, mut settled) = oneshot::channel();

        let start_slot = {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push_back(PendingTask {
                producer,
                completion,
                seq,
            });
            let start = state.running < self.limit;
            if start {
                state.running += 1;
            }
            debug!(
                seq,
                queued = state.pending.len(),
                running = state.running,
                limit = self.limit,
                "producer admitted"
            );
            start
        };

        if start_slot {
            self.take_next();
        }

        // A producer that settled synchronously on a free slot stays synchronous.
        match settled.try_recv() {
            Ok(result) => Task::from_result(result),
            Err(oneshot::error::TryRecvError::Closed) => Task::failed(ThunkError::Abandoned),
            Err(oneshot::error::TryRecvError::Empty) => Task::pending(async move {
                settled.await.unwrap_or(Err(ThunkError::Abandoned))
            }),
        }
    }

    /// Fill the slot held by the caller with queued work until something
    /// stays pending or the queue is empty.
    fn take_next(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.lock();
                match state.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        state.running -= 1;
                        trace!(running = state.running, "queue drained, slot released");
                        return;
                    }
                }
            };

            let PendingTask {
                producer,
                completion,
                seq,
            } = next;
            trace!(seq, "starting queued producer");

            let task = (self.run)(producer);
            if !task.is_pending() {
                if let Some(result) = task.peek() {
                    let _ = completion.send(result);
                }
                continue;
            }

            let queue = self.clone();
            task.on_settle(move |result| {
                // The submitter may have dropped its task; the queue advances anyway.
                let _ = completion.send(result.clone());
                queue.take_next();
            });
            return;
        }
    }
}

impl<A, S, T> Consumer<A, S, T> for Concurrency
where
    A: Action,
    S: 'static,
    T: Output,
{
    fn wrap(&self, run: Run<A, S, T>) -> Run<A, S, T> {
        let queue = Arc::new(Queue {
            run,
            limit: self.limit,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                running: 0,
                next_seq: 0,
            }),
        });
        Arc::new(move |producer| queue.submit(producer))
    }

    fn name(&self) -> &'static str {
        if self.limit == 1 {
            "series"
        } else {
            "concurrency"
        }
    }
}

// =============================================================================
// Injection
// =============================================================================

/// Adds fixed extra arguments to every invocation.
#[derive(Clone)]
pub struct Inject {
    extras: Vec<Extra>,
}

/// Provide `extras` to every producer, after `dispatch` and `read_state`.
pub fn inject(extras: impl IntoIterator<Item = Extra>) -> Inject {
    Inject {
        extras: extras.into_iter().collect(),
    }
}

impl<A, S, T> Consumer<A, S, T> for Inject
where
    A: Action,
    S: 'static,
    T: Output,
{
    fn wrap(&self, run: Run<A, S, T>) -> Run<A, S, T> {
        let extras = self.extras.clone();
        Arc::new(move |producer: Producer<A, S, T>| {
            let extras = extras.clone();
            let injected = Producer::new({
                let producer = producer.clone();
                move |ctx| producer.run(&ctx.with_leading_extras(extras.iter().cloned()))
            });
            run(injected.admitted_like(&producer))
        })
    }

    fn name(&self) -> &'static str {
        "inject"
    }
}

impl fmt::Debug for Inject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inject")
            .field("extras", &self.extras.len())
            .finish()
    }
}

/// A zero-argument factory producing one extra per invocation.
pub type ExtraFactory = Arc<dyn Fn() -> Extra + Send + Sync>;

/// Adds extra arguments computed fresh for every invocation.
#[derive(Clone)]
pub struct InjectWith {
    factories: Vec<ExtraFactory>,
}

/// Provide one extra per factory, calling each factory on every invocation.
pub fn inject_with(factories: impl IntoIterator<Item = ExtraFactory>) -> InjectWith {
    InjectWith {
        factories: factories.into_iter().collect(),
    }
}

impl<A, S, T> Consumer<A, S, T> for InjectWith
where
    A: Action,
    S: 'static,
    T: Output,
{
    fn wrap(&self, run: Run<A, S, T>) -> Run<A, S, T> {
        let factories = self.factories.clone();
        Arc::new(move |producer: Producer<A, S, T>| {
            let factories = factories.clone();
            let injected = Producer::new({
                let producer = producer.clone();
                move |ctx| {
                    let fresh: Vec<Extra> = factories.iter().map(|factory| factory()).collect();
                    producer.run(&ctx.with_leading_extras(fresh))
                }
            });
            run(injected.admitted_like(&producer))
        })
    }

    fn name(&self) -> &'static str {
        "inject_with"
    }
}

impl fmt::Debug for InjectWith {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectWith")
            .field("factories", &self.factories.len())
            .finish()
    }
}

// =============================================================================
// Composition
// =============================================================================

/// Several consumers applied left to right.
pub struct Compose<A, S, T> {
    consumers: Vec<Box<dyn Consumer<A, S, T>>>,
}

/// Merge consumers; a submission passes through the first one first.
pub fn compose<A, S, T>(consumers: Vec<Box<dyn Consumer<A, S, T>>>) -> Compose<A, S, T> {
    Compose { consumers }
}

impl<A, S, T> Compose<A, S, T> {
    /// An empty composition (same as [`bypass`]).
    pub fn new() -> Self {
        Self {
            consumers: Vec::new(),
        }
    }

    /// Append a consumer at the inner end of the chain.
    pub fn then(mut self, consumer: impl Consumer<A, S, T>) -> Self {
        self.consumers.push(Box::new(consumer));
        self
    }
}

impl<A, S, T> Default for Compose<A, S, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, S, T> Consumer<A, S, T> for Compose<A, S, T>
where
    A: Action,
    S: 'static,
    T: Output,
{
    fn wrap(&self, run: Run<A, S, T>) -> Run<A, S, T> {
        self.consumers
            .iter()
            .rev()
            .fold(run, |inner, consumer| consumer.wrap(inner))
    }

    fn name(&self) -> &'static str {
        "compose"
    }
}

impl<A, S, T> Consumer<A, S, T> for Box<dyn Consumer<A, S, T>>
where
    A: Action,
    S: 'static,
    T: Output,
{
    fn wrap(&self, run: Run<A, S, T>) -> Run<A, S, T> {
        (**self).wrap(run)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
