//! # Managed Dispatch
//!
//! Admission control, revocable emit handles and optimistic transactions for
//! producers that run against a shared state store.
//!
//! ## Core Concepts
//!
//! - A [`Producer`] is deferred work: it receives a [`Context`] (emit handle,
//!   state reader, injected extras) and returns a [`Task`] that is either
//!   settled already or settles later.
//! - A [`Consumer`] decides *when* producers run: immediately ([`bypass`]), at
//!   most `n` at a time ([`concurrency`], [`series`]), or with extra arguments
//!   ([`inject`], [`inject_with`]).
//! - The [`ManagedDispatcher`] gives every producer its own revocable emit
//!   handle and revokes it when the producer finishes, so late emissions fail
//!   loudly instead of corrupting unrelated state.
//! - The [`OptimisticManager`] runs an authoritative/speculative pair as one
//!   transaction over an [overlay reducer](wrap_reducer).
//!
//! ## Architecture
//!
//! ```text
//! Submission
//!     │
//!     ├─► Action(a) ──────────────────────────────────────────► sink
//!     │
//!     ├─► Plain(producer) ──► Consumer pipeline ──► base run ──► producer(ctx)
//!     │                        (inject, series...)   │               │
//!     │                                              │               └─► ctx.emit()
//!     │                                              │                     │
//!     │                                              │        controller ◄─┘ ──► sink
//!     │                                              └─► revoke controller once finished
//!     │
//!     └─► Optimistic { authoritative, speculative }
//!             │
//!             └─► OptimisticManager: tag emissions with a TransactionId,
//!                 roll back the guess on the first real emission,
//!                 commit or abort at settlement
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Synchronous stays synchronous** - a producer that settles before it
//!    returns has its continuations run before the dispatch call returns.
//! 2. **One controller per invocation** - only `CancelPrevious` reaches into
//!    another invocation's controller, to silence it.
//! 3. **Cancellation is cooperative** - it never interrupts a running producer,
//!    it only drops that producer's further emissions.
//! 4. **Failures advance queues** - a failed or panicking producer releases its
//!    slot and reports the failure to its own submitter.
//!
//! ## Example
//!
//! ```ignore
//! use managed_dispatch::{
//!     extra, inject, series, Compose, ManagedDispatcher, Producer, Submission, Task,
//! };
//!
//! let dispatcher = ManagedDispatcher::builder(store.sink(), store.reader())
//!     .with_consumer(Compose::new().then(inject([extra(api)])).then(series()))
//!     .build();
//!
//! let load = Producer::try_new(|ctx| {
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

// Core modules
mod behavior;
mod config;
mod consumer;
mod core;
mod error;
mod managed;
mod optimistic;
mod overlay;
mod store;
mod task;
mod util;
mod wrappers;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export core types
pub use crate::core::{
    extra, Action, Context, Dispatch, Dispatched, Extra, Extras, IdGenerator, Output, Producer,
    ReadState, Submission, TransactionId,
};

// Re-export task and error types
pub use crate::error::{Result, StaleAction, ThunkError};
pub use crate::task::Task;

// Re-export dispatch behavior types
pub use crate::behavior::{BehaviorController, DispatchBehavior};

// Re-export consumer pipeline
pub use crate::consumer::{
    bypass, compose, concurrency, inject, inject_with, series, Bypass, Compose, Concurrency,
    Consumer, ExtraFactory, Inject, InjectWith, Run,
};

// Re-export higher-order wrappers
pub use crate::wrappers::{
    transactional, ArgsPredicate, CancelHook, CancelPrevious, ProducerFactory, ReusePrevious,
};

// Re-export the dispatch boundary (primary entry point)
pub use crate::managed::{
    ManagedDispatcher, ManagedDispatcherBuilder, REVOKED_AFTER_RETURN, REVOKED_AFTER_SETTLEMENT,
};

// Re-export optimistic transactions
pub use crate::optimistic::OptimisticManager;
pub use crate::overlay::{
    wrap_reducer, OptimisticReducer, OptimisticState, OptimisticView, OverlayAction,
    RollbackScope, Side,
};

// Re-export store and configuration
pub use crate::config::DispatchConfig;
pub use crate::store::{ReducerStore, Store};

// Re-export argument comparison
pub use crate::util::{args_equal, ShallowEq};
