//! Optimistic transactions.
//!
//! An optimistic pair is two producers submitted together:
//!
//! 1. **authoritative** - the real work; must return a pending task.
//! 2. **speculative** - a synchronous guess at the outcome, shown right away.
//!
//! Both run through the managed pipeline. Their emissions are staged in the
//! overlay under one [`TransactionId`]:
//!
//! ```text
//! dispatch pair ──▶ authoritative starts (sync emissions staged)
//!               ──▶ speculative runs     (emissions staged)         ──▶ state shows guess
//! authoritative emits again ──▶ Rollback(speculative) then staged   ──▶ state shows real data
//! authoritative settles     ──▶ Commit (Ok) / Abort (Err)           ──▶ optimistic = false
//! ```
//!
//! If the authoritative producer settles without emitting after the speculative
//! one ran, the speculative entries are retracted at settlement, right before
//! the commit.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(wrap_reducer(reduce_todos).into_store(TodoState::default()));
//! let reader = store.reader_with(|s| s.current().clone());
//! let managed = ManagedDispatcher::builder(store.sink(), reader)
//!     .with_config(&config)
//!     .build();
//! let manager = OptimisticManager::new(managed);
//!
//! let task = manager
//!     .dispatch(Submission::optimistic(save_item(text.clone()), show_pending_item(text)))?
//!     .into_task();
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::core::{
    Action, Dispatch, Dispatched, IdGenerator, Output, Producer, Submission, TransactionId,
};
use crate::error::{Result, ThunkError};
use crate::managed::ManagedDispatcher;
use crate::overlay::{OverlayAction, Side};
use crate::task::Task;

const AUTHORITATIVE_SETTLED: &str = "authoritative producer must return a pending task";

/// Runs optimistic pairs on top of a [`ManagedDispatcher`] whose sink is an
/// overlay store.
pub struct OptimisticManager<A, S, T> {
    managed: ManagedDispatcher<OverlayAction<A>, S, T>,
    ids: IdGenerator,
}

/// Per-transaction progress shared by the tagging handles and the settlement
/// continuation.
#[derive(Debug, Default)]
struct TransactionFlags {
    /// The authoritative producer returned and the speculative one has run.
    armed: AtomicBool,
    /// Speculative entries have been retracted.
    rolled_back: AtomicBool,
    /// The transaction was aborted for a protocol violation.
    aborted: AtomicBool,
}

impl<A, S, T> OptimisticManager<A, S, T>
where
    A: Action,
    S: 'static,
    T: Output,
{
    /// A manager allocating random transaction ids.
    pub fn new(managed: ManagedDispatcher<OverlayAction<A>, S, T>) -> Self {
        Self {
            managed,
            ids: IdGenerator::random(),
        }
    }

    /// Use `ids` to allocate transaction ids.
    pub fn with_ids(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    /// The dispatcher producers run on.
    pub fn managed(&self) -> &ManagedDispatcher<OverlayAction<A>, S, T> {
        &self.managed
    }

    /// Handle one submission.
    ///
    /// Plain actions and producers behave as on the managed dispatcher, with
    /// their actions applied untagged. Optimistic pairs that break the
    /// async/sync contract fail here with [`ThunkError::ProtocolViolation`].
    pub fn dispatch(&self, submission: Submission<A, S, T>) -> Result<Dispatched<T>> {
        match submission {
            Submission::Action(action) => {
                self.managed.dispatch_action(OverlayAction::Plain(action))?;
                Ok(Dispatched::Forwarded)
            }
            Submission::Plain(producer) => {
                let untagged = retag(producer, |_| Ok(()), OverlayAction::Plain, Returned::new());
                Ok(Dispatched::Task(self.managed.run(untagged)))
            }
            Submission::Optimistic {
                authoritative,
                speculative,
            } => self.run_optimistic(authoritative, speculative).map(Dispatched::Task),
        }
    }

    /// Run an optimistic pair.
    ///
    /// The authoritative producer goes through the admission pipeline like any
    /// other producer and may wait there for a slot. The speculative producer
    /// is marked [`immediate`](Producer::immediate) so its guess shows up
    /// before this call returns. Both checks look at what each producer itself
    /// returned, not at the pipeline's task.
    pub fn run_optimistic(
        &self,
        authoritative: Producer<A, S, T>,
        speculative: Producer<A, S, T>,
    ) -> Result<Task<T>> {
        let transaction = self.ids.next_id();
        let flags = Arc::new(TransactionFlags::default());
        let sink = self.managed.sink().clone();
        debug!(%transaction, "starting optimistic transaction");

        let authoritative_returned = Returned::new();
        let authoritative = {
            let flags = flags.clone();
            let sink = sink.clone();
            retag(
                authoritative,
                move |action: &A| {
                    if flags.aborted.load(Ordering::SeqCst) {
                        debug!(%transaction, ?action, "dropping emission from aborted transaction");
                        return Err(());
                    }
                    let armed = flags.armed.load(Ordering::SeqCst);
                    if armed && !flags.rolled_back.swap(true, Ordering::SeqCst) {
                        debug!(
                            %transaction,
                            "authoritative producer emitted, retracting speculative entries"
                        );
                        deliver(&sink, OverlayAction::rollback(transaction));
                    }
                    Ok(())
                },
                move |action| OverlayAction::post(action, transaction, Side::Authoritative),
                authoritative_returned.clone(),
            )
        };

        let running = self.managed.run(authoritative);
        if authoritative_returned.settled_synchronously() {
            self.abort(&flags, &sink, transaction);
            return Err(ThunkError::ProtocolViolation(AUTHORITATIVE_SETTLED.to_string()));
        }
        flags.armed.store(true, Ordering::SeqCst);

        let speculative_returned = Returned::new();
        let speculative = {
            let flags = flags.clone();
            retag(
                speculative,
                move |action: &A| {
                    if flags.aborted.load(Ordering::SeqCst) {
                        debug!(%transaction, ?action, "dropping emission from aborted transaction");
                        return Err(());
                    }
                    Ok(())
                },
                move |action| OverlayAction::post(action, transaction, Side::Speculative),
                speculative_returned.clone(),
            )
        };

        // A producer that panicked never returned; the pipeline task holds the panic.
        let pipeline = self.managed.run(speculative.immediate());
        let own = speculative_returned.take().unwrap_or(pipeline);
        match own.into_ready() {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(
                    %transaction,
                    error = %e,
                    "speculative producer failed, retracting its entries"
                );
                if !flags.rolled_back.swap(true, Ordering::SeqCst) {
                    deliver(&sink, OverlayAction::rollback(transaction));
                }
            }
            Err(_pending) => {
                self.abort(&flags, &sink, transaction);
                return Err(ThunkError::ProtocolViolation(
                    "speculative producer must settle synchronously".to_string(),
                ));
            }
        }

        Ok(running.then(move |result| {
            // A queued authoritative producer is only checked once it ran.
            if authoritative_returned.settled_synchronously() {
                warn!(
                    %transaction,
                    "queued authoritative producer settled synchronously, aborting transaction"
                );
                flags.aborted.store(true, Ordering::SeqCst);
                deliver(&sink, OverlayAction::abort(transaction));
                return Err(ThunkError::ProtocolViolation(AUTHORITATIVE_SETTLED.to_string()));
            }
            if !flags.rolled_back.swap(true, Ordering::SeqCst) {
                debug!(
                    %transaction,
                    "authoritative producer settled silently, retracting speculative entries"
                );
                deliver(&sink, OverlayAction::rollback(transaction));
            }
            match &result {
                Ok(_) => {
                    debug!(%transaction, "committing optimistic transaction");
                    deliver(&sink, OverlayAction::commit(transaction));
                }
                Err(e) => {
                    debug!(
                        %transaction,
                        error = %e,
                        "authoritative producer failed, aborting transaction"
                    );
                    deliver(&sink, OverlayAction::abort(transaction));
                }
            }
            result
        }))
    }

    fn abort(
        &self,
        flags: &TransactionFlags,
        sink: &Dispatch<OverlayAction<A>>,
        transaction: TransactionId,
    ) {
        warn!(%transaction, "optimistic pair broke its contract, aborting transaction");
        flags.aborted.store(true, Ordering::SeqCst);
        deliver(sink, OverlayAction::abort(transaction));
    }
}

impl<A, S, T> Clone for OptimisticManager<A, S, T> {
    fn clone(&self) -> Self {
        Self {
            managed: self.managed.clone(),
            ids: self.ids.clone(),
        }
    }
}

impl<A, S, T> fmt::Debug for OptimisticManager<A, S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticManager")
            .field("managed", &self.managed)
            .finish_non_exhaustive()
    }
}

/// Send a bookkeeping action straight to the store.
fn deliver<A: Action>(sink: &Dispatch<OverlayAction<A>>, action: OverlayAction<A>) {
    if let Err(e) = sink.dispatch(action.clone()) {
        error!(error = %e, ?action, "failed to deliver overlay action");
    }
}

/// The task a producer itself returned, captured inside the pipeline.
struct Returned<T> {
    task: Mutex<Option<Task<T>>>,
}

impl<T: Output> Returned<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            task: Mutex::new(None),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Task<T>>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, task: &Task<T>) {
        *self.lock() = Some(task.clone());
    }

    /// True once the producer ran and returned a settled task.
    fn settled_synchronously(&self) -> bool {
        self.lock().as_ref().map_or(false, |task| !task.is_pending())
    }

    fn take(&self) -> Option<Task<T>> {
        self.lock().take()
    }
}

/// Adapt a producer emitting `A` to the overlay dispatcher.
///
/// `admit` runs before each emission; `Err(())` drops the emission. The task
/// the producer returns is recorded in `returned`.
fn retag<A, S, T, G, F>(
    producer: Producer<A, S, T>,
    admit: G,
    tag: F,
    returned: Arc<Returned<T>>,
) -> Producer<OverlayAction<A>, S, T>
where
    A: Action,
    S: 'static,
    T: Output,
    G: Fn(&A) -> std::result::Result<(), ()> + Send + Sync + 'static,
    F: Fn(A) -> OverlayAction<A> + Send + Sync + 'static,
{
    let admit = Arc::new(admit);
    let tag = Arc::new(tag);
    Producer::new(move |ctx| {
        let inner = ctx.dispatch().clone();
        let (admit, tag) = (admit.clone(), tag.clone());
        let tagged = Dispatch::from_fn(move |action: A| {
            if admit(&action).is_err() {
                return Ok(());
            }
            inner.dispatch(tag(action))
        });
        let task = producer.run(&ctx.with_dispatch(tagged));
        returned.record(&task);
        task
    })
}
