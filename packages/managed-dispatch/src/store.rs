//! State store collaborator.
//!
//! The dispatch boundary never touches state itself; it only emits actions into
//! a [`Store`] and reads snapshots back. [`ReducerStore`] is a small in-memory
//! implementation: one mutex-guarded state value folded by a reducer.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::core::{Action, Dispatch, ReadState};
use crate::error::Result;

/// Something that accepts actions and exposes state snapshots.
pub trait Store<A, S>: Send + Sync + 'static {
    /// Apply an action.
    fn dispatch(&self, action: A) -> Result<()>;

    /// A snapshot of the current state.
    fn state(&self) -> S;
}

type Reducer<S, A> = dyn Fn(&mut S, A) + Send + Sync;

/// An in-memory store: `state = reducer(state, action)` under a mutex.
///
/// The lock is held only while the reducer runs, never while a producer runs,
/// so producers may emit from inside their synchronous part.
pub struct ReducerStore<S, A> {
    state: Mutex<S>,
    reducer: Box<Reducer<S, A>>,
}

impl<S, A> ReducerStore<S, A>
where
    S: Send + 'static,
    A: Action,
{
    /// A store holding `initial`, updated by `reducer`.
    pub fn new<R>(initial: S, reducer: R) -> Self
    where
        R: Fn(&mut S, A) + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(initial),
            reducer: Box::new(reducer),
        }
    }

    /// Read the state without cloning it.
    pub fn with_state<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.lock())
    }

    /// A dispatch handle that applies actions to this store.
    pub fn sink(self: &Arc<Self>) -> Dispatch<A> {
        let store = self.clone();
        Dispatch::from_fn(move |action| {
            store.apply(action);
            Ok(())
        })
    }

    /// A reader that projects the state through `f`.
    pub fn reader_with<R, F>(self: &Arc<Self>, f: F) -> ReadState<R>
    where
        F: Fn(&S) -> R + Send + Sync + 'static,
    {
        let store = self.clone();
        ReadState::from_fn(move || store.with_state(&f))
    }

    fn apply(&self, action: A) {
        trace!(?action, "reducing action");
        let mut state = self.lock();
        (self.reducer)(&mut state, action);
    }

    fn lock(&self) -> MutexGuard<'_, S> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S, A> ReducerStore<S, A>
where
    S: Clone + Send + 'static,
    A: Action,
{
    /// A reader returning clones of the whole state.
    pub fn reader(self: &Arc<Self>) -> ReadState<S> {
        self.reader_with(S::clone)
    }
}

impl<S, A> Store<A, S> for ReducerStore<S, A>
where
    S: Clone + Send + 'static,
    A: Action,
{
    fn dispatch(&self, action: A) -> Result<()> {
        self.apply(action);
        Ok(())
    }

    fn state(&self) -> S {
        self.lock().clone()
    }
}

impl<S: fmt::Debug, A> fmt::Debug for ReducerStore<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ReducerStore");
        match self.state.try_lock() {
            Ok(state) => s.field("state", &*state),
            Err(_) => s.field("state", &"<locked>"),
        };
        s.finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed::ManagedDispatcher;
    use crate::core::{Producer, Submission};

    #[derive(Debug, Clone, PartialEq)]
    enum Counter {
        Add(i64),
        Reset,
    }

    fn counter_store() -> Arc<ReducerStore<i64, Counter>> {
        Arc::new(ReducerStore::new(0, |state: &mut i64, action| match action {
            Counter::Add(n) => *state += n,
            Counter::Reset => *state = 0,
        }))
    }

    #[test]
    fn test_sink_and_reader_share_state() {
        let store = counter_store();
        let sink = store.sink();
        let reader = store.reader();

        sink.dispatch(Counter::Add(2)).unwrap();
        sink.dispatch(Counter::Add(3)).unwrap();
        assert_eq!(reader.read(), 5);

        Store::dispatch(&*store, Counter::Reset).unwrap();
        assert_eq!(store.state(), 0);
    }

    #[test]
    fn test_projection_reader() {
        let store = counter_store();
        let doubled = store.reader_with(|n| n * 2);
        store.sink().dispatch(Counter::Add(4)).unwrap();
        assert_eq!(doubled.read(), 8);
    }

    #[test]
    fn test_producer_reads_its_own_emissions() {
        let store = counter_store();
        let dispatcher: ManagedDispatcher<Counter, i64, i64> =
            ManagedDispatcher::for_store(store.clone()).build();

        let producer = Producer::sync(|ctx| {
            ctx.emit(Counter::Add(10))?;
            ctx.emit(Counter::Add(-3))?;
            Ok(ctx.state())
        });
        let task = dispatcher
            .dispatch(Submission::Plain(producer))
            .unwrap()
            .into_task()
            .unwrap();

        assert_eq!(task.into_ready().unwrap().unwrap(), 7);
        assert_eq!(store.state(), 7);
    }
}
