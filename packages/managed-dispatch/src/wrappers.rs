//! Higher-order wrappers around producer factories.
//!
//! A [`ProducerFactory`] builds a producer from call arguments
//! (`(args) -> Producer`). Wrapping the factory rather than a single producer
//! lets a wrapper compare repeated calls:
//!
//! - [`ReusePrevious`] hands back the in-flight task when the same call is
//!   made again before it settles.
//! - [`CancelPrevious`] silences the in-flight call when the same call is made
//!   again, and starts fresh work.
//! - [`transactional`] buffers every emission of one call and commits them
//!   only if the call succeeds.
//!
//! Bookkeeping for reuse and cancellation belongs to the wrapped factory; two
//! factories wrapped by the same builder do not see each other's calls.
//!
//! # Example
//!
//! ```ignore
//! let search = ProducerFactory::new(|query: String| search_producer(query));
//!
//! // Typing the same query twice while the first request is out reuses it.
//! let search = ReusePrevious::new().wrap(search);
//!
//! // A newer request for the same key silences the older one.
//! let save = CancelPrevious::new()
//!     .with_cancel(|task| tracing::debug!(?task, "superseded"))
//!     .wrap(transactional(save_factory));
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::behavior::{BehaviorController, DispatchBehavior};
use crate::core::{Action, Dispatch, Output, Producer};
use crate::task::Task;
use crate::util::{args_equal, ShallowEq};

/// Builds a producer from call arguments.
pub struct ProducerFactory<Args, A, S, T> {
    inner: Arc<dyn Fn(Args) -> Producer<A, S, T> + Send + Sync>,
}

impl<Args, A, S, T> ProducerFactory<Args, A, S, T>
where
    Args: Clone + Send + Sync + 'static,
    A: Action,
    S: 'static,
    T: Output,
{
    /// Wrap a closure as a factory.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Args) -> Producer<A, S, T> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Build the producer for `args`.
    pub fn call(&self, args: Args) -> Producer<A, S, T> {
        (self.inner)(args)
    }
}

impl<Args, A, S, T> Clone for ProducerFactory<Args, A, S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Args, A, S, T> fmt::Debug for ProducerFactory<Args, A, S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerFactory").finish_non_exhaustive()
    }
}

/// Compares new call arguments against the previous call's.
pub type ArgsPredicate<Args> = Arc<dyn Fn(&Args, &Args) -> bool + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Reuse previous
// =============================================================================

/// Reuse the in-flight task when `should_reuse(args, previous_args)` holds.
///
/// Only asynchronous producers are remembered; a producer that settles
/// synchronously has nothing to reuse.
pub struct ReusePrevious<Args> {
    should_reuse: ArgsPredicate<Args>,
}

impl<Args: ShallowEq + Send + Sync + 'static> ReusePrevious<Args> {
    /// Reuse when arguments are shallowly equal.
    pub fn new() -> Self {
        Self::with_predicate(|args, previous| args_equal(args, previous))
    }
}

impl<Args: ShallowEq + Send + Sync + 'static> Default for ReusePrevious<Args> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Args: Send + Sync + 'static> ReusePrevious<Args> {
    /// Reuse when `should_reuse(args, previous_args)` returns true.
    pub fn with_predicate<F>(should_reuse: F) -> Self
    where
        F: Fn(&Args, &Args) -> bool + Send + Sync + 'static,
    {
        Self {
            should_reuse: Arc::new(should_reuse),
        }
    }

    /// Wrap `next`.
    pub fn wrap<A, S, T>(
        &self,
        next: ProducerFactory<Args, A, S, T>,
    ) -> ProducerFactory<Args, A, S, T>
    where
        Args: Clone,
        A: Action,
        S: 'static,
        T: Output,
    {
        let in_flight: Arc<Mutex<Option<InFlight<Args, T>>>> = Arc::new(Mutex::new(None));
        let should_reuse = self.should_reuse.clone();

        ProducerFactory::new(move |args: Args| {
            let (in_flight, should_reuse, next) =
                (in_flight.clone(), should_reuse.clone(), next.clone());

            Producer::new(move |ctx| {
                {
                    let guard = lock(&in_flight);
                    if let Some(previous) = guard.as_ref() {
                        if !previous.task.is_settled() && should_reuse(&args, &previous.args) {
                            debug!("reusing in-flight producer task");
                            return previous.task.clone();
                        }
                    }
                }

                let task = next.call(args.clone()).run(ctx);
                if task.is_pending() {
                    *lock(&in_flight) = Some(InFlight {
                        args: args.clone(),
                        task: task.clone(),
                    });
                    forget_on_settle(&in_flight, &task);
                }
                task
            })
        })
    }
}

struct InFlight<Args, T> {
    args: Args,
    task: Task<T>,
}

/// A remembered invocation.
trait Remembered<T> {
    fn task(&self) -> &Task<T>;
}

impl<Args, T> Remembered<T> for InFlight<Args, T> {
    fn task(&self) -> &Task<T> {
        &self.task
    }
}

/// Clear `slot` once `task` settles, unless a newer call has replaced it.
fn forget_on_settle<E, T>(slot: &Arc<Mutex<Option<E>>>, task: &Task<T>)
where
    E: Remembered<T> + Send + 'static,
    T: Output,
{
    let slot = slot.clone();
    let remembered = task.clone();
    task.on_settle(move |_| {
        let mut guard = lock(&slot);
        let still_current = guard
            .as_ref()
            .map_or(false, |entry| entry.task().same_as(&remembered));
        if still_current {
            *guard = None;
        }
    });
}

// =============================================================================
// Cancel previous
// =============================================================================

/// Called with the superseded invocation's task when it is cancelled.
pub type CancelHook<T> = Arc<dyn Fn(&Task<T>) + Send + Sync>;

/// Cancel the in-flight call when `should_cancel(args, previous_args)` holds.
///
/// Cancelling calls the hook with the old task, then switches the old call's
/// dispatch to [`DispatchBehavior::Ignore`]. Actions it already emitted stay
/// delivered; wrap the inner factory in [`transactional`] to hold them back
/// until success.
pub struct CancelPrevious<Args, T> {
    should_cancel: ArgsPredicate<Args>,
    cancel: CancelHook<T>,
}

impl<Args: ShallowEq + Send + Sync + 'static, T: Output> CancelPrevious<Args, T> {
    /// Cancel when arguments are shallowly equal; no teardown hook.
    pub fn new() -> Self {
        Self::with_predicate(|args, previous| args_equal(args, previous))
    }
}

impl<Args: ShallowEq + Send + Sync + 'static, T: Output> Default for CancelPrevious<Args, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Args: Send + Sync + 'static, T: Output> CancelPrevious<Args, T> {
    /// Cancel when `should_cancel(args, previous_args)` returns true.
    pub fn with_predicate<F>(should_cancel: F) -> Self
    where
        F: Fn(&Args, &Args) -> bool + Send + Sync + 'static,
    {
        Self {
            should_cancel: Arc::new(should_cancel),
            cancel: Arc::new(|_| {}),
        }
    }

    /// Teardown hook for the superseded task (abort a request, close a socket).
    pub fn with_cancel<F>(mut self, cancel: F) -> Self
    where
        F: Fn(&Task<T>) + Send + Sync + 'static,
    {
        self.cancel = Arc::new(cancel);
        self
    }

    /// Wrap `next`.
    pub fn wrap<A, S>(&self, next: ProducerFactory<Args, A, S, T>) -> ProducerFactory<Args, A, S, T>
    where
        Args: Clone,
        A: Action,
        S: 'static,
    {
        let running: Arc<Mutex<Option<Running<Args, A, T>>>> = Arc::new(Mutex::new(None));
        let should_cancel = self.should_cancel.clone();
        let cancel = self.cancel.clone();

        ProducerFactory::new(move |args: Args| {
            let (running, should_cancel, cancel, next) = (
                running.clone(),
                should_cancel.clone(),
                cancel.clone(),
                next.clone(),
            );

            Producer::new(move |ctx| {
                // A previous call that is not cancelled stays remembered.
                let superseded = {
                    let mut slot = lock(&running);
                    let supersede = slot.as_ref().map_or(false, |previous| {
                        !previous.task.is_settled() && should_cancel(&args, &previous.args)
                    });
                    if supersede {
                        slot.take()
                    } else {
                        None
                    }
                };
                if let Some(previous) = superseded {
                    debug!("cancelling superseded producer");
                    cancel(&previous.task);
                    previous.controller.replace(DispatchBehavior::Ignore);
                }

                let controller = BehaviorController::new(ctx.dispatch().clone());
                let task = next
                    .call(args.clone())
                    .run(&ctx.with_dispatch(controller.dispatch()));

                if task.is_pending() {
                    *lock(&running) = Some(Running {
                        args: args.clone(),
                        task: task.clone(),
                        controller,
                    });
                    forget_on_settle(&running, &task);
                }
                task
            })
        })
    }
}

struct Running<Args, A, T> {
    args: Args,
    task: Task<T>,
    controller: BehaviorController<A>,
}

impl<Args, A, T> Remembered<T> for Running<Args, A, T> {
    fn task(&self) -> &Task<T> {
        &self.task
    }
}

// =============================================================================
// Transactional
// =============================================================================

enum Buffer<A> {
    Collecting(Vec<A>),
    Committed,
    Discarded,
}

/// Buffer every action emitted by one call; replay them in order on success,
/// drop them on failure.
///
/// After a successful commit, further emissions from the same call pass
/// straight through. After a failure they are dropped.
pub fn transactional<Args, A, S, T>(
    next: ProducerFactory<Args, A, S, T>,
) -> ProducerFactory<Args, A, S, T>
where
    Args: Clone + Send + Sync + 'static,
    A: Action,
    S: 'static,
    T: Output,
{
    ProducerFactory::new(move |args: Args| {
        let next = next.clone();

        Producer::new(move |ctx| {
            let buffer = Arc::new(Mutex::new(Buffer::Collecting(Vec::new())));
            let outer = ctx.dispatch().clone();

            let collect = {
                let buffer = buffer.clone();
                let outer = outer.clone();
                Dispatch::from_fn(move |action: A| {
                    let forward = {
                        let mut guard = lock(&buffer);
                        match &mut *guard {
                            Buffer::Collecting(actions) => {
                                actions.push(action);
                                return Ok(());
                            }
                            Buffer::Committed => true,
                            Buffer::Discarded => false,
                        }
                    };
                    if forward {
                        outer.dispatch(action)
                    } else {
                        Ok(())
                    }
                })
            };

            next.call(args.clone())
                .run(&ctx.with_dispatch(collect))
                .then(move |result| {
                    let settled = if result.is_ok() {
                        Buffer::Committed
                    } else {
                        Buffer::Discarded
                    };
                    let buffered = match std::mem::replace(&mut *lock(&buffer), settled) {
                        Buffer::Collecting(actions) => actions,
                        _ => Vec::new(),
                    };

                    match result {
                        Ok(value) => {
                            debug!(count = buffered.len(), "committing buffered actions");
                            for action in buffered {
                                outer.dispatch(action)?;
                            }
                            Ok(value)
                        }
                        Err(e) => {
                            let count = buffered.len();
                            debug!(count, error = %e, "discarding buffered actions");
                            Err(e)
                        }
                    }
                })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Context, ReadState};
    use crate::error::ThunkError;
    use crate::testing::{Gate, RecordingSink};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Factory = ProducerFactory<(u32, u32), u32, (), u32>;

    fn ctx(sink: &RecordingSink<u32>) -> Context<u32, ()> {
        Context::new(sink.dispatch(), ReadState::constant(()))
    }

    /// Emits 1 synchronously, then 2 once `gate` opens; returns `x + y`.
    fn emitting_factory(calls: Arc<AtomicUsize>, gate: Gate) -> Factory {
        ProducerFactory::new(move |(x, y): (u32, u32)| {
            let (calls, gate) = (calls.clone(), gate.clone());
            Producer::try_new(move |ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                ctx.emit(1)?;
                let (dispatch, gate) = (ctx.dispatch().clone(), gate.clone());
                Ok(Task::pending(async move {
                    gate.wait().await;
                    dispatch.dispatch(2)?;
                    Ok(x + y)
                }))
            })
        })
    }

    #[tokio::test]
    async fn test_reuse_returns_identical_task_for_equal_args() {
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Gate::new();
        let wrapped = ReusePrevious::new().wrap(emitting_factory(calls.clone(), gate.clone()));

        let first = wrapped.call((1, 2)).run(&ctx(&sink));
        let second = wrapped.call((1, 2)).run(&ctx(&sink));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(first.same_as(&second));

        gate.open();
        assert_eq!(first.await.unwrap(), 3);
        assert_eq!(second.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reuse_skipped_for_different_args() {
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Gate::new();
        let wrapped = ReusePrevious::new().wrap(emitting_factory(calls.clone(), gate.clone()));

        let first = wrapped.call((1, 2)).run(&ctx(&sink));
        let second = wrapped.call((2, 3)).run(&ctx(&sink));
        let third = wrapped.call((1, 2)).run(&ctx(&sink));

        // Only the most recent call is remembered.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!first.same_as(&second));
        assert!(!first.same_as(&third));

        gate.open();
        assert_eq!(first.await.unwrap(), 3);
        assert_eq!(second.await.unwrap(), 5);
        assert_eq!(third.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reuse_starts_fresh_after_settlement() {
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Gate::new();
        gate.open();
        let wrapped = ReusePrevious::new().wrap(emitting_factory(calls.clone(), gate));

        let first = wrapped.call((1, 1)).run(&ctx(&sink));
        assert_eq!(first.clone().await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let second = wrapped.call((1, 1)).run(&ctx(&sink));
        assert!(!first.same_as(&second));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reuse_with_custom_predicate() {
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Gate::new();
        // Reuse whenever the first argument matches.
        let wrapped = ReusePrevious::with_predicate(|a: &(u32, u32), b: &(u32, u32)| a.0 == b.0)
            .wrap(emitting_factory(calls.clone(), gate.clone()));

        let first = wrapped.call((1, 2)).run(&ctx(&sink));
        let second = wrapped.call((1, 9)).run(&ctx(&sink));
        assert!(first.same_as(&second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        gate.open();
        assert_eq!(second.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancel_silences_superseded_call() {
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Gate::new();
        let wrapped = CancelPrevious::new().wrap(emitting_factory(calls.clone(), gate.clone()));

        let first = wrapped.call((1, 2)).run(&ctx(&sink));
        let second = wrapped.call((1, 2)).run(&ctx(&sink));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        gate.open();
        assert_eq!(first.await.unwrap(), 3);
        assert_eq!(second.await.unwrap(), 3);

        // Both synchronous 1s were delivered; only the live call's 2 arrives.
        assert_eq!(sink.actions(), vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn test_cancel_hook_receives_superseded_task() {
        let sink = RecordingSink::new();
        let gate = Gate::new();
        let seen: Arc<Mutex<Vec<Task<u32>>>> = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = seen.clone();
        let wrapped = CancelPrevious::new()
            .with_cancel(move |task: &Task<u32>| hook_seen.lock().unwrap().push(task.clone()))
            .wrap(emitting_factory(Arc::new(AtomicUsize::new(0)), gate.clone()));

        let first = wrapped.call((1, 2)).run(&ctx(&sink));
        let second = wrapped.call((1, 2)).run(&ctx(&sink));

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert!(seen[0].same_as(&first));
            assert!(!seen[0].same_as(&second));
        }
        gate.open();
        let _ = second.await;
    }

    #[tokio::test]
    async fn test_cancel_not_triggered_for_different_args() {
        let sink = RecordingSink::new();
        let gate = Gate::new();
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = cancels.clone();
        let wrapped = CancelPrevious::new()
            .with_cancel(move |_: &Task<u32>| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .wrap(emitting_factory(Arc::new(AtomicUsize::new(0)), gate.clone()));

        let first = wrapped.call((1, 2)).run(&ctx(&sink));
        let second = wrapped.call((3, 4)).run(&ctx(&sink));
        gate.open();
        assert_eq!(first.await.unwrap(), 3);
        assert_eq!(second.await.unwrap(), 7);

        assert_eq!(cancels.load(Ordering::SeqCst), 0);
        assert_eq!(sink.actions(), vec![1, 1, 2, 2]);
    }

    #[tokio::test]
    async fn test_sync_call_keeps_pending_call_cancellable() {
        let sink = RecordingSink::new();
        let gate = Gate::new();
        // Zero settles synchronously; anything else emits once `gate` opens.
        let factory: ProducerFactory<u32, u32, (), u32> = {
            let gate = gate.clone();
            ProducerFactory::new(move |n: u32| {
                let gate = gate.clone();
                Producer::new(move |ctx: &Context<u32, ()>| {
                    if n == 0 {
                        return Task::ready(0);
                    }
                    let (dispatch, gate) = (ctx.dispatch().clone(), gate.clone());
                    Task::pending(async move {
                        gate.wait().await;
                        dispatch.dispatch(n)?;
                        Ok(n)
                    })
                })
            })
        };
        let wrapped = CancelPrevious::new().wrap(factory);

        let first = wrapped.call(5).run(&ctx(&sink));
        let sync = wrapped.call(0).run(&ctx(&sink));
        let third = wrapped.call(5).run(&ctx(&sink));
        assert!(!sync.is_pending());

        gate.open();
        assert_eq!(first.await.unwrap(), 5);
        assert_eq!(third.await.unwrap(), 5);

        // The first call was still superseded by the third.
        assert_eq!(sink.actions(), vec![5]);
    }

    #[tokio::test]
    async fn test_reuse_starts_fresh_after_failure() {
        let sink = RecordingSink::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Gate::new();
        let factory: Factory = {
            let (calls, gate) = (calls.clone(), gate.clone());
            ProducerFactory::new(move |_| {
                let (calls, gate) = (calls.clone(), gate.clone());
                Producer::new(move |_ctx| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let gate = gate.clone();
                    Task::pending(async move {
                        gate.wait().await;
                        Err(ThunkError::msg("lookup failed"))
                    })
                })
            })
        };
        let wrapped = ReusePrevious::new().wrap(factory);

        let first = wrapped.call((1, 1)).run(&ctx(&sink));
        let reused = wrapped.call((1, 1)).run(&ctx(&sink));
        assert!(first.same_as(&reused));

        gate.open();
        assert!(first.clone().await.is_err());
        tokio::time::sleep(Duration::from_millis(5)).await;

        let retry = wrapped.call((1, 1)).run(&ctx(&sink));
        assert!(!retry.same_as(&first));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(retry.await.is_err());
    }

    #[tokio::test]
    async fn test_transactional_commits_in_order_after_success() {
        let sink = RecordingSink::new();
        let gate = Gate::new();
        let wrapped = transactional(emitting_factory(Arc::new(AtomicUsize::new(0)), gate.clone()));

        let task = wrapped.call((0, 0)).run(&ctx(&sink));
        assert!(sink.is_empty());

        gate.open();
        task.await.unwrap();
        assert_eq!(sink.actions(), vec![1, 2]);
    }

    #[test]
    fn test_transactional_discards_on_sync_failure() {
        let sink = RecordingSink::new();
        let factory: Factory = ProducerFactory::new(|_| {
            Producer::sync(|ctx| {
                ctx.emit(1)?;
                Err(ThunkError::msg("validation failed"))
            })
        });

        let outcome = transactional(factory)
            .call((0, 0))
            .run(&ctx(&sink))
            .into_ready()
            .unwrap();

        assert!(outcome.is_err());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_transactional_discards_on_async_failure() {
        let sink = RecordingSink::new();
        let factory: Factory = ProducerFactory::new(|_| {
            Producer::try_new(|ctx| {
                ctx.emit(1)?;
                let dispatch = ctx.dispatch().clone();
                Ok(Task::pending(async move {
                    dispatch.dispatch(2)?;
                    Err(ThunkError::msg("server rejected"))
                }))
            })
        });

        let result = transactional(factory).call((0, 0)).run(&ctx(&sink)).await;
        assert!(result.is_err());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_transactional_sync_success_commits_before_return() {
        let sink = RecordingSink::new();
        let factory: Factory = ProducerFactory::new(|_| {
            Producer::sync(|ctx| {
                ctx.emit(7)?;
                ctx.emit(8)?;
                Ok(0)
            })
        });

        let task = transactional(factory).call((0, 0)).run(&ctx(&sink));
        assert!(!task.is_pending());
        assert_eq!(sink.actions(), vec![7, 8]);
    }
}
