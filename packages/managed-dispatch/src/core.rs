//! Core types: actions, dispatch handles, producer contexts and submissions.
//!
//! A **producer** is a unit of deferred work. It receives a [`Context`] that
//! carries an emit handle ([`Dispatch`]), a state reader ([`ReadState`]) and any
//! injected [`Extras`], and it returns a [`Task`] with its result.
//!
//! ```ignore
//! let load = Producer::try_new(|ctx: &Context<TodoAction, TodoState>| {
//!     ctx.emit(TodoAction::LoadStarted)?;
//!     let api = ctx.find::<TodoApi>().cloned().ok_or_else(|| ThunkError::msg("no api"))?;
//!     let dispatch = ctx.dispatch().clone();
//!     Ok(Task::pending(async move {
//!         let items = api.list().await.map_err(ThunkError::failed)?;
//!         dispatch.dispatch(TodoAction::Loaded(items))
//!     }))
//! });
//!
//! dispatcher.dispatch(Submission::Plain(load))?;
//! ```
//!
//! Code that runs before the closure returns is synchronous; the returned
//! pending future is the asynchronous part.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::task::Task;

/// An opaque message consumed by the state store.
///
/// Automatically implemented for any `Clone + Debug + Send + Sync + 'static`
/// type.
pub trait Action: Any + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Any + Clone + fmt::Debug + Send + Sync + 'static> Action for T {}

/// Values a producer may return.
///
/// Automatically implemented for any `Clone + Send + Sync + 'static` type.
pub trait Output: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Output for T {}

// =============================================================================
// Dispatch
// =============================================================================

type DispatchFn<A> = dyn Fn(A) -> Result<()> + Send + Sync;

/// A cloneable emit handle.
///
/// Every sink, revocable controller and tagging layer in the crate is a
/// `Dispatch`; they compose with [`Dispatch::map`].
pub struct Dispatch<A> {
    inner: Arc<DispatchFn<A>>,
}

impl<A: Action> Dispatch<A> {
    /// Build a dispatch handle from a closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(A) -> Result<()> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// A handle that accepts and drops every action.
    pub fn discard() -> Self {
        Self::from_fn(|_| Ok(()))
    }

    /// Emit an action.
    pub fn dispatch(&self, action: A) -> Result<()> {
        (self.inner)(action)
    }

    /// Adapt this handle to accept another action type.
    pub fn map<B, F>(&self, f: F) -> Dispatch<B>
    where
        B: Action,
        F: Fn(B) -> A + Send + Sync + 'static,
    {
        let inner = self.clone();
        Dispatch::from_fn(move |action| inner.dispatch(f(action)))
    }
}

impl<A> Clone for Dispatch<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> fmt::Debug for Dispatch<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch").finish_non_exhaustive()
    }
}

/// A cloneable state reader.
pub struct ReadState<S> {
    inner: Arc<dyn Fn() -> S + Send + Sync>,
}

impl<S> ReadState<S> {
    /// Build a reader from a closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Take a snapshot of the current state.
    pub fn read(&self) -> S {
        (self.inner)()
    }
}

impl<S: Clone + Send + Sync + 'static> ReadState<S> {
    /// A reader that always returns `state`.
    pub fn constant(state: S) -> Self {
        Self::from_fn(move || state.clone())
    }
}

impl<S> Clone for ReadState<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> fmt::Debug for ReadState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadState").finish_non_exhaustive()
    }
}

// =============================================================================
// Extras
// =============================================================================

/// A single injected extra argument.
pub type Extra = Arc<dyn Any + Send + Sync>;

/// Wrap a value as an [`Extra`].
pub fn extra<V: Any + Send + Sync>(value: V) -> Extra {
    Arc::new(value)
}

/// Ordered extra arguments handed to producers after `dispatch` and `read_state`.
#[derive(Clone, Default)]
pub struct Extras {
    values: Vec<Extra>,
}

impl Extras {
    /// No extras.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of extras.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no extras.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The extra at `index`, if it has type `V`.
    pub fn get<V: Any>(&self, index: usize) -> Option<&V> {
        self.values.get(index)?.downcast_ref::<V>()
    }

    /// The first extra of type `V`.
    pub fn find<V: Any>(&self) -> Option<&V> {
        self.values.iter().find_map(|v| v.downcast_ref::<V>())
    }

    /// The raw extra at `index`.
    pub fn raw(&self, index: usize) -> Option<&Extra> {
        self.values.get(index)
    }

    /// New extras with `leading` placed before the current ones.
    pub(crate) fn with_leading(&self, leading: impl IntoIterator<Item = Extra>) -> Self {
        let mut values: Vec<Extra> = leading.into_iter().collect();
        values.extend(self.values.iter().cloned());
        Self { values }
    }
}

impl FromIterator<Extra> for Extras {
    fn from_iter<I: IntoIterator<Item = Extra>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl fmt::Debug for Extras {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extras").field("len", &self.len()).finish()
    }
}

// =============================================================================
// Context
// =============================================================================

/// Everything a producer receives: `(dispatch, read_state, ...extras)`.
///
/// Contexts are immutable and cheap to clone. Wrappers that need a different
/// emit handle derive a new context with [`Context::with_dispatch`] instead of
/// mutating the one they were given.
pub struct Context<A, S> {
    dispatch: Dispatch<A>,
    read_state: ReadState<S>,
    extras: Extras,
}

impl<A: Action, S> Context<A, S> {
    /// A context with no extras.
    pub fn new(dispatch: Dispatch<A>, read_state: ReadState<S>) -> Self {
        Self {
            dispatch,
            read_state,
            extras: Extras::new(),
        }
    }

    /// The emit handle.
    pub fn dispatch(&self) -> &Dispatch<A> {
        &self.dispatch
    }

    /// Shorthand for `self.dispatch().dispatch(action)`.
    pub fn emit(&self, action: A) -> Result<()> {
        self.dispatch.dispatch(action)
    }

    /// A snapshot of the store state.
    pub fn state(&self) -> S {
        self.read_state.read()
    }

    /// The state reader.
    pub fn read_state(&self) -> &ReadState<S> {
        &self.read_state
    }

    /// Injected extras.
    pub fn extras(&self) -> &Extras {
        &self.extras
    }

    /// The extra at `index`, if it has type `V`.
    pub fn extra<V: Any>(&self, index: usize) -> Option<&V> {
        self.extras.get(index)
    }

    /// The first extra of type `V`.
    pub fn find<V: Any>(&self) -> Option<&V> {
        self.extras.find()
    }

    /// The same context with a different emit handle.
    pub fn with_dispatch<B: Action>(&self, dispatch: Dispatch<B>) -> Context<B, S> {
        Context {
            dispatch,
            read_state: self.read_state.clone(),
            extras: self.extras.clone(),
        }
    }

    /// The same context with `extras` placed before the current extras.
    pub fn with_leading_extras(&self, extras: impl IntoIterator<Item = Extra>) -> Self {
        Self {
            dispatch: self.dispatch.clone(),
            read_state: self.read_state.clone(),
            extras: self.extras.with_leading(extras),
        }
    }
}

impl<A, S> Clone for Context<A, S> {
    fn clone(&self) -> Self {
        Self {
            dispatch: self.dispatch.clone(),
            read_state: self.read_state.clone(),
            extras: self.extras.clone(),
        }
    }
}

impl<A, S> fmt::Debug for Context<A, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("extras", &self.extras)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Producer
// =============================================================================

type ProducerFn<A, S, T> = dyn Fn(&Context<A, S>) -> Task<T> + Send + Sync;

/// A deferred unit of work: `(dispatch, read_state, ...extras) -> value | future`.
///
/// Producers are cheap to clone; clones share the same closure.
pub struct Producer<A, S, T> {
    inner: Arc<ProducerFn<A, S, T>>,
    immediate: bool,
}

impl<A, S, T> Producer<A, S, T>
where
    A: Action,
    S: 'static,
    T: Output,
{
    /// Build a producer from a closure returning a [`Task`].
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Context<A, S>) -> Task<T> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(f),
            immediate: false,
        }
    }

    /// Build a producer whose synchronous part may fail with `?`.
    pub fn try_new<F>(f: F) -> Self
    where
        F: Fn(&Context<A, S>) -> Result<Task<T>> + Send + Sync + 'static,
    {
        Self::new(move |ctx| f(ctx).unwrap_or_else(|e| Task::failed(e)))
    }

    /// Build a producer that settles before it returns.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Context<A, S>) -> Result<T> + Send + Sync + 'static,
    {
        Self::new(move |ctx| Task::from_result(f(ctx)))
    }

    /// Build a producer whose whole body runs asynchronously.
    ///
    /// Nothing runs before the producer returns; use [`Producer::new`] when
    /// some emissions must happen synchronously.
    pub fn deferred<F, Fut>(f: F) -> Self
    where
        F: Fn(Context<A, S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::new(move |ctx| Task::pending(f(ctx.clone())))
    }

    /// Mark the producer as exempt from admission queues.
    ///
    /// Queueing consumers run an immediate producer as soon as it is
    /// submitted, without taking a slot. Meant for producers that settle
    /// before they return, such as the speculative half of an optimistic pair.
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// Returns true if queueing consumers must not hold this producer back.
    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    /// Copy the admission mark of `other`, for consumers that wrap producers.
    pub(crate) fn admitted_like(mut self, other: &Producer<A, S, T>) -> Self {
        self.immediate = other.immediate;
        self
    }

    /// Invoke the producer.
    pub fn run(&self, ctx: &Context<A, S>) -> Task<T> {
        (self.inner)(ctx)
    }
}

impl<A, S, T> Clone for Producer<A, S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            immediate: self.immediate,
        }
    }
}

impl<A, S, T> fmt::Debug for Producer<A, S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("immediate", &self.immediate)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Submission
// =============================================================================

/// What can be handed to the dispatch boundary.
pub enum Submission<A, S, T> {
    /// A plain action, forwarded to the store untouched.
    Action(A),
    /// A single producer.
    Plain(Producer<A, S, T>),
    /// An optimistic pair: slow authoritative work plus a synchronous guess.
    Optimistic {
        /// Must return a pending task.
        authoritative: Producer<A, S, T>,
        /// Must settle synchronously.
        speculative: Producer<A, S, T>,
    },
}

impl<A, S, T> Submission<A, S, T> {
    /// Build an optimistic pair.
    pub fn optimistic(authoritative: Producer<A, S, T>, speculative: Producer<A, S, T>) -> Self {
        Submission::Optimistic {
            authoritative,
            speculative,
        }
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Submission::Action(_) => "action",
            Submission::Plain(_) => "producer",
            Submission::Optimistic { .. } => "optimistic",
        }
    }
}

impl<A, S, T> From<Producer<A, S, T>> for Submission<A, S, T> {
    fn from(producer: Producer<A, S, T>) -> Self {
        Submission::Plain(producer)
    }
}

impl<A: fmt::Debug, S, T> fmt::Debug for Submission<A, S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Submission::Action(action) => f.debug_tuple("Action").field(action).finish(),
            Submission::Plain(_) => f.write_str("Plain(..)"),
            Submission::Optimistic { .. } => f.write_str("Optimistic { .. }"),
        }
    }
}

/// What the dispatch boundary did with a submission.
pub enum Dispatched<T> {
    /// A plain action reached the sink.
    Forwarded,
    /// A producer (or optimistic pair) is running.
    Task(Task<T>),
}

impl<T> Dispatched<T> {
    /// The running task, if a producer was submitted.
    pub fn into_task(self) -> Option<Task<T>> {
        match self {
            Dispatched::Forwarded => None,
            Dispatched::Task(task) => Some(task),
        }
    }

    /// Returns true if a plain action was forwarded.
    pub fn is_forwarded(&self) -> bool {
        matches!(self, Dispatched::Forwarded)
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for Dispatched<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatched::Forwarded => f.write_str("Forwarded"),
            Dispatched::Task(task) => f.debug_tuple("Task").field(task).finish(),
        }
    }
}

// =============================================================================
// Transaction ids
// =============================================================================

/// Identifies the actions staged by one optimistic transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// A new random transaction id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TransactionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of fresh transaction ids, held explicitly by whoever allocates them.
#[derive(Clone)]
pub struct IdGenerator {
    next: Arc<dyn Fn() -> TransactionId + Send + Sync>,
}

impl IdGenerator {
    /// Random v4 ids.
    pub fn random() -> Self {
        Self::from_fn(TransactionId::new)
    }

    /// Ids `1, 2, 3, ...` encoded as UUIDs; handy when reading logs.
    pub fn sequential() -> Self {
        let counter = AtomicU64::new(0);
        Self::from_fn(move || {
            let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
            TransactionId::from(Uuid::from_u128(u128::from(n)))
        })
    }

    /// Ids from a custom closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> TransactionId + Send + Sync + 'static,
    {
        Self { next: Arc::new(f) }
    }

    /// Allocate an id.
    pub fn next_id(&self) -> TransactionId {
        (self.next)()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::random()
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}
