//! Sync-or-async task outcomes.
//!
//! A producer either settles before it returns ([`Task::ready`]) or hands back a
//! future that settles later ([`Task::pending`]). Every layer of the crate needs
//! to attach work to "whenever this settles" without turning synchronous
//! producers asynchronous, so `Task` keeps the two cases explicit:
//!
//! - On a ready task, [`Task::then`] and [`Task::on_settle`] run their closure
//!   before returning.
//! - On a pending task they run once the shared future resolves.
//!
//! Pending tasks are started eagerly on the ambient Tokio runtime, the way a
//! started promise keeps running whether or not anyone awaits it. The underlying
//! future is shared, so clones of a pending task are the *same* task
//! ([`Task::same_as`]).

use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::AssertUnwindSafe;

use futures::future::{self, BoxFuture, FutureExt, Shared};

use crate::error::{Result, ThunkError};

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T>>>;

enum TaskState<T> {
    Ready(Result<T>),
    Pending(SharedOutcome<T>),
}

/// The outcome of running a producer: settled now, or settling later.
pub struct Task<T> {
    state: TaskState<T>,
}

impl<T> Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A task that already succeeded.
    pub fn ready(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    /// A task that already failed.
    pub fn failed(error: impl Into<ThunkError>) -> Self {
        Self::from_result(Err(error.into()))
    }

    /// A task that already settled with `result`.
    pub fn from_result(result: Result<T>) -> Self {
        Self {
            state: TaskState::Ready(result),
        }
    }

    /// Start `future` on the current Tokio runtime and track it as a pending task.
    ///
    /// Panics inside the future are captured and settle the task with
    /// [`ThunkError::Panicked`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let shared = AssertUnwindSafe(future)
            .catch_unwind()
            .map(|outcome| outcome.unwrap_or_else(|panic| Err(ThunkError::from_panic(panic))))
            .boxed()
            .shared();

        // Drive the future even if nobody awaits it.
        tokio::spawn(shared.clone().map(|_| ()));

        Self {
            state: TaskState::Pending(shared),
        }
    }

    /// Returns true if this task was created pending, whether or not it has
    /// resolved since.
    pub fn is_pending(&self) -> bool {
        matches!(self.state, TaskState::Pending(_))
    }

    /// Returns true once the outcome is known.
    pub fn is_settled(&self) -> bool {
        match &self.state {
            TaskState::Ready(_) => true,
            TaskState::Pending(shared) => shared.peek().is_some(),
        }
    }

    /// The outcome, if already known.
    pub fn peek(&self) -> Option<Result<T>> {
        match &self.state {
            TaskState::Ready(result) => Some(result.clone()),
            TaskState::Pending(shared) => shared.peek().cloned(),
        }
    }

    /// Take the outcome of a task that settled synchronously, or get the pending
    /// task back.
    pub fn into_ready(self) -> std::result::Result<Result<T>, Task<T>> {
        match self.state {
            TaskState::Ready(result) => Ok(result),
            state @ TaskState::Pending(_) => Err(Task { state }),
        }
    }

    /// Identity comparison: true iff both are handles to the same pending future.
    pub fn same_as(&self, other: &Task<T>) -> bool {
        match (&self.state, &other.state) {
            (TaskState::Pending(a), TaskState::Pending(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Chain a continuation on the outcome.
    ///
    /// For a ready task `f` runs before this call returns; for a pending task
    /// it runs when the task settles, and the returned task settles after `f`.
    pub fn then<U, F>(self, f: F) -> Task<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Result<T>) -> Result<U> + Send + 'static,
    {
        match self.state {
            TaskState::Ready(result) => Task::from_result(f(result)),
            TaskState::Pending(shared) => Task::pending(async move { f(shared.await) }),
        }
    }

    /// Observe the outcome without changing it.
    ///
    /// Runs `f` immediately for a ready task. For a pending task `f` runs on a
    /// separate Tokio task after settlement, so it is not ordered against other
    /// awaiters; use [`Task::then`] when work must happen before the outcome is
    /// observable.
    pub fn on_settle<F>(&self, f: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        match &self.state {
            TaskState::Ready(result) => f(result),
            TaskState::Pending(shared) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let outcome = shared.await;
                    f(&outcome);
                });
            }
        }
    }
}

impl<T: Clone> Clone for Task<T> {
    fn clone(&self) -> Self {
        let state = match &self.state {
            TaskState::Ready(result) => TaskState::Ready(result.clone()),
            TaskState::Pending(shared) => TaskState::Pending(shared.clone()),
        };
        Self { state }
    }
}

impl<T> fmt::Debug for Task<T>
where
    T: Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            TaskState::Ready(result) => f.debug_tuple("Task::Ready").field(result).finish(),
            TaskState::Pending(shared) => f
                .debug_struct("Task::Pending")
                .field("outcome", &shared.peek())
                .finish(),
        }
    }
}

impl<T> IntoFuture for Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        match self.state {
            TaskState::Ready(result) => future::ready(result).boxed(),
            TaskState::Pending(shared) => shared.boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_ready_then_runs_synchronously() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let chained = Task::ready(20).then(move |r| {
            seen.fetch_add(1, Ordering::SeqCst);
            r.map(|v| v + 1)
        });

        // No runtime needed: a ready task never leaves the calling thread.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!chained.is_pending());
        assert_eq!(chained.into_ready().unwrap().unwrap(), 21);
    }

    #[test]
    fn test_ready_on_settle_sees_failure() {
        let task: Task<u8> = Task::failed(ThunkError::msg("nope"));
        let seen = Arc::new(AtomicUsize::new(0));
        let observer = seen.clone();
        task.on_settle(move |r| {
            assert!(r.is_err());
            observer.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pending_runs_without_being_awaited() {
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();

        let task = Task::pending(async move {
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(task.is_pending());
        assert!(!task.is_settled());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(task.is_settled());
        assert!(task.peek().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_clones_share_identity() {
        let task = Task::pending(async { Ok(5) });
        let copy = task.clone();
        let other = Task::pending(async { Ok(5) });

        assert!(task.same_as(&copy));
        assert!(!task.same_as(&other));
        assert!(!Task::ready(5).same_as(&Task::ready(5)));

        assert_eq!(task.await.unwrap(), 5);
        assert_eq!(copy.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_pending_then_settles_after_continuation() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = order.clone();

        let task = Task::pending(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok("value")
        })
        .then(move |r| {
            log.lock().unwrap().push("continuation");
            r
        });

        let value = task.await.unwrap();
        order.lock().unwrap().push("awaited");

        assert_eq!(value, "value");
        assert_eq!(*order.lock().unwrap(), vec!["continuation", "awaited"]);
    }

    #[tokio::test]
    async fn test_panic_inside_pending_is_captured() {
        let task: Task<()> = Task::pending(async {
            tokio::task::yield_now().await;
            if true {
                panic!("exploded");
            }
            Ok(())
        });

        match task.await {
            Err(ThunkError::Panicked(message)) => assert_eq!(message, "exploded"),
            other => panic!("Expected Panicked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_into_ready_returns_pending_task_back() {
        let task = Task::pending(async { Ok(1) });
        let task = task.into_ready().expect_err("pending task must come back");
        assert_eq!(task.await.unwrap(), 1);
    }
}
