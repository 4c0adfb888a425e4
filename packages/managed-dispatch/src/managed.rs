//! The managed dispatch boundary.
//!
//! Every submission is matched on its shape:
//!
//! - a plain action goes straight to the sink;
//! - a producer goes through the consumer pipeline to the base runner, which
//!   gives it a fresh [`BehaviorController`] and revokes that controller once
//!   the producer is finished (unless the dispatcher is `loose`);
//! - an optimistic pair is refused here; it needs an
//!   [`OptimisticManager`](crate::OptimisticManager).
//!
//! # Example
//!
//! ```ignore
//! let dispatcher = ManagedDispatcher::builder(store.sink(), store.reader())
//!     .with_consumer(Compose::new().then(inject(vec![extra(api)])).then(series()))
//!     .build();
//!
//! dispatcher.dispatch(Submission::Action(TodoAction::Clear))?;
//! let task = dispatcher.run(load_todos());
//! task.await?;
//! ```

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::behavior::{BehaviorController, DispatchBehavior};
use crate::config::DispatchConfig;
use crate::consumer::{bypass, Consumer, Run};
use crate::core::{Action, Context, Dispatch, Dispatched, Output, Producer, ReadState, Submission};
use crate::error::{Result, ThunkError};
use crate::store::Store;
use crate::task::Task;

/// Installed when a producer returns without a pending task.
pub const REVOKED_AFTER_RETURN: &str = "dispatch used after producer finished (synchronous return)";

/// Installed when a producer's pending task settles.
pub const REVOKED_AFTER_SETTLEMENT: &str =
    "dispatch used after producer finished (asynchronous settlement)";

/// Runs producers against a sink through an admission pipeline.
pub struct ManagedDispatcher<A, S, T> {
    sink: Dispatch<A>,
    read_state: ReadState<S>,
    run: Run<A, S, T>,
    loose: bool,
    consumer_name: &'static str,
}

impl<A, S, T> ManagedDispatcher<A, S, T>
where
    A: Action,
    S: 'static,
    T: Output,
{
    /// Start building a dispatcher around `sink` and `read_state`.
    pub fn builder(
        sink: Dispatch<A>,
        read_state: ReadState<S>,
    ) -> ManagedDispatcherBuilder<A, S, T> {
        ManagedDispatcherBuilder {
            sink,
            read_state,
            consumer: None,
            loose: false,
        }
    }

    /// Start building a dispatcher around a [`Store`].
    pub fn for_store<St>(store: Arc<St>) -> ManagedDispatcherBuilder<A, S, T>
    where
        St: Store<A, S>,
    {
        let reader = store.clone();
        Self::builder(
            Dispatch::from_fn(move |action| store.dispatch(action)),
            ReadState::from_fn(move || reader.state()),
        )
    }

    /// Handle one submission.
    ///
    /// Plain actions report sink failures synchronously. Producer failures are
    /// reported through the returned task.
    pub fn dispatch(&self, submission: Submission<A, S, T>) -> Result<Dispatched<T>> {
        match submission {
            Submission::Action(action) => {
                self.sink.dispatch(action)?;
                Ok(Dispatched::Forwarded)
            }
            Submission::Plain(producer) => Ok(Dispatched::Task(self.run(producer))),
            Submission::Optimistic { .. } => Err(ThunkError::ProtocolViolation(
                "optimistic pairs must be dispatched through an OptimisticManager".to_string(),
            )),
        }
    }

    /// Forward a plain action to the sink.
    pub fn dispatch_action(&self, action: A) -> Result<()> {
        self.sink.dispatch(action)
    }

    /// Submit a producer to the pipeline.
    pub fn run(&self, producer: Producer<A, S, T>) -> Task<T> {
        debug!(consumer = self.consumer_name, loose = self.loose, "submitting producer");
        (self.run)(producer)
    }

    /// The unmanaged sink.
    pub fn sink(&self) -> &Dispatch<A> {
        &self.sink
    }

    /// The state reader handed to producers.
    pub fn read_state(&self) -> &ReadState<S> {
        &self.read_state
    }

    /// Returns true if emit handles stay valid after producers finish.
    pub fn is_loose(&self) -> bool {
        self.loose
    }
}

impl<A, S, T> Clone for ManagedDispatcher<A, S, T> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            read_state: self.read_state.clone(),
            run: self.run.clone(),
            loose: self.loose,
            consumer_name: self.consumer_name,
        }
    }
}

impl<A, S, T> fmt::Debug for ManagedDispatcher<A, S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedDispatcher")
            .field("consumer", &self.consumer_name)
            .field("loose", &self.loose)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ManagedDispatcher`].
pub struct ManagedDispatcherBuilder<A, S, T> {
    sink: Dispatch<A>,
    read_state: ReadState<S>,
    consumer: Option<Box<dyn Consumer<A, S, T>>>,
    loose: bool,
}

impl<A, S, T> ManagedDispatcherBuilder<A, S, T>
where
    A: Action,
    S: 'static,
    T: Output,
{
    /// Admission pipeline for producers. Defaults to [`bypass`].
    pub fn with_consumer(mut self, consumer: impl Consumer<A, S, T>) -> Self {
        self.consumer = Some(Box::new(consumer));
        self
    }

    /// Keep emit handles valid after producers finish.
    pub fn loose(mut self, loose: bool) -> Self {
        self.loose = loose;
        self
    }

    /// Take `loose` and the consumer from a [`DispatchConfig`].
    pub fn with_config(mut self, config: &DispatchConfig) -> Self {
        self.loose = config.loose;
        self.consumer = Some(config.consumer());
        self
    }

    /// Build the dispatcher.
    pub fn build(self) -> ManagedDispatcher<A, S, T> {
        let consumer = self.consumer.unwrap_or_else(|| Box::new(bypass()));
        let consumer_name = consumer.name();
        let base = base_run(self.sink.clone(), self.read_state.clone(), self.loose);

        ManagedDispatcher {
            sink: self.sink,
            read_state: self.read_state,
            run: consumer.wrap(base),
            loose: self.loose,
            consumer_name,
        }
    }
}

impl<A, S, T> fmt::Debug for ManagedDispatcherBuilder<A, S, T>
where
    A: Action,
    S: 'static,
    T: Output,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedDispatcherBuilder")
            .field("consumer", &self.consumer.as_ref().map(|c| c.name()))
            .field("loose", &self.loose)
            .finish_non_exhaustive()
    }
}

/// The innermost runner: fresh controller, panic capture, revocation.
fn base_run<A, S, T>(sink: Dispatch<A>, read_state: ReadState<S>, loose: bool) -> Run<A, S, T>
where
    A: Action,
    S: 'static,
    T: Output,
{
    Arc::new(move |producer: Producer<A, S, T>| {
        let controller = BehaviorController::new(sink.clone());
        let ctx = Context::new(controller.dispatch(), read_state.clone());

        let task = match std::panic::catch_unwind(AssertUnwindSafe(|| producer.run(&ctx))) {
            Ok(task) => task,
            Err(panic) => {
                let error = ThunkError::from_panic(panic);
                warn!(error = %error, "producer panicked before returning");
                Task::failed(error)
            }
        };

        if loose {
            return task;
        }

        match task.into_ready() {
            Ok(result) => {
                controller.replace(DispatchBehavior::error(REVOKED_AFTER_RETURN));
                Task::from_result(result)
            }
            Err(pending) => pending.then(move |result| {
                controller.replace(DispatchBehavior::error(REVOKED_AFTER_SETTLEMENT));
                result
            }),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::series;
    use crate::testing::{Gate, RecordingSink};
    use std::sync::Mutex;
    use std::time::Duration;

    fn dispatcher(sink: &RecordingSink<&'static str>) -> ManagedDispatcher<&'static str, (), ()> {
        ManagedDispatcher::builder(sink.dispatch(), ReadState::constant(())).build()
    }

    /// Stash the emit handle so the test can use it after the producer finished.
    fn leak_handle(
        slot: &Arc<Mutex<Option<Dispatch<&'static str>>>>,
    ) -> Producer<&'static str, (), ()> {
        let slot = slot.clone();
        Producer::sync(move |ctx| {
            *slot.lock().unwrap() = Some(ctx.dispatch().clone());
            Ok(())
        })
    }

    #[test]
    fn test_producer_emissions_reach_sink() {
        let sink = RecordingSink::new();
        let dispatched = dispatcher(&sink)
            .dispatch(Submission::Plain(Producer::sync(|ctx| ctx.emit("TEST"))))
            .unwrap();

        assert!(!dispatched.is_forwarded());
        assert_eq!(sink.actions(), vec!["TEST"]);
    }

    #[test]
    fn test_plain_action_bypasses_pipeline() {
        let sink = RecordingSink::new();
        let dispatched = dispatcher(&sink).dispatch(Submission::Action("TEST")).unwrap();

        assert!(dispatched.is_forwarded());
        assert!(dispatched.into_task().is_none());
        assert_eq!(sink.actions(), vec!["TEST"]);
    }

    #[test]
    fn test_dispatch_after_sync_return_is_rejected() {
        let sink = RecordingSink::new();
        let slot = Arc::new(Mutex::new(None));
        dispatcher(&sink).run(leak_handle(&slot));

        let late = slot.lock().unwrap().clone().unwrap();
        match late.dispatch("TEST") {
            Err(ThunkError::StaleDispatch { message, action }) => {
                assert_eq!(message, REVOKED_AFTER_RETURN);
                assert_eq!(action.downcast_ref::<&str>(), Some(&"TEST"));
            }
            other => panic!("Expected StaleDispatch, got {:?}", other),
        }
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_after_async_settlement_is_rejected() {
        let sink = RecordingSink::new();
        let slot = Arc::new(Mutex::new(None));
        let stash = slot.clone();
        let producer = Producer::deferred(move |ctx: Context<&'static str, ()>| {
            let stash = stash.clone();
            async move {
                ctx.emit("DURING")?;
                *stash.lock().unwrap() = Some(ctx.dispatch().clone());
                Ok(())
            }
        });

        dispatcher(&sink).run(producer).await.unwrap();

        let late = slot.lock().unwrap().clone().unwrap();
        let err = late.dispatch("AFTER").unwrap_err();
        assert!(err.to_string().contains(REVOKED_AFTER_SETTLEMENT));
        assert_eq!(sink.actions(), vec!["DURING"]);
    }

    #[tokio::test]
    async fn test_failed_producer_is_revoked_too() {
        let sink = RecordingSink::new();
        let slot = Arc::new(Mutex::new(None));
        let stash = slot.clone();
        let producer = Producer::deferred(move |ctx: Context<&'static str, ()>| {
            let stash = stash.clone();
            async move {
                *stash.lock().unwrap() = Some(ctx.dispatch().clone());
                Err::<(), _>(ThunkError::msg("backend down"))
            }
        });

        assert!(dispatcher(&sink).run(producer).await.is_err());
        let late = slot.lock().unwrap().clone().unwrap();
        assert!(late.dispatch("AFTER").unwrap_err().is_stale_dispatch());
    }

    #[test]
    fn test_loose_keeps_handle_valid() {
        let sink = RecordingSink::new();
        let slot = Arc::new(Mutex::new(None));
        let loose = ManagedDispatcher::builder(sink.dispatch(), ReadState::constant(()))
            .loose(true)
            .build();
        assert!(loose.is_loose());

        loose.run(leak_handle(&slot));
        let late = slot.lock().unwrap().clone().unwrap();
        late.dispatch("TEST").unwrap();

        assert_eq!(sink.actions(), vec!["TEST"]);
    }

    #[test]
    fn test_sync_panic_is_captured() {
        let sink = RecordingSink::new();
        let producer: Producer<&'static str, (), ()> = Producer::new(|_| panic!("kaboom"));

        let outcome = dispatcher(&sink).run(producer).into_ready().unwrap();
        match outcome {
            Err(ThunkError::Panicked(message)) => assert_eq!(message, "kaboom"),
            other => panic!("Expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn test_optimistic_submission_is_refused() {
        let sink = RecordingSink::new();
        let pair = Submission::optimistic(Producer::sync(|_| Ok(())), Producer::sync(|_| Ok(())));

        let err = dispatcher(&sink).dispatch(pair).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    /// Holds producers until two have arrived, then runs them together in
    /// one producer followed by a marker action.
    struct Pairing {
        pending: Arc<Mutex<Vec<Producer<&'static str, (), ()>>>>,
    }

    impl Consumer<&'static str, (), ()> for Pairing {
        fn wrap(&self, run: Run<&'static str, (), ()>) -> Run<&'static str, (), ()> {
            let pending = self.pending.clone();
            Arc::new(move |producer| {
                let mut held = pending.lock().unwrap();
                held.push(producer);
                if held.len() < 2 {
                    return Task::ready(());
                }
                let batch: Vec<_> = held.drain(..).collect();
                drop(held);
                run(Producer::sync(move |ctx| {
                    for producer in &batch {
                        producer.run(ctx).into_ready().ok();
                    }
                    ctx.emit("CONSUMER")
                }))
            })
        }
    }

    #[test]
    fn test_custom_consumer_controls_execution() {
        let sink = RecordingSink::new();
        let dispatcher = ManagedDispatcher::builder(sink.dispatch(), ReadState::constant(()))
            .with_consumer(Pairing {
                pending: Arc::new(Mutex::new(Vec::new())),
            })
            .build();

        dispatcher.run(Producer::sync(|ctx| ctx.emit("TEST1")));
        assert!(sink.is_empty());

        dispatcher.run(Producer::sync(|ctx| ctx.emit("TEST2")));
        assert_eq!(sink.actions(), vec!["TEST1", "TEST2", "CONSUMER"]);
    }

    #[tokio::test]
    async fn test_queued_producer_gets_its_own_controller() {
        let sink = RecordingSink::new();
        let gate = Gate::new();
        let dispatcher = ManagedDispatcher::builder(sink.dispatch(), ReadState::constant(()))
            .with_consumer(series())
            .build();

        let held = gate.clone();
        let first = dispatcher.run(Producer::deferred(move |ctx: Context<&'static str, ()>| {
            let held = held.clone();
            async move {
                held.wait().await;
                ctx.emit("first")
            }
        }));
        let second = dispatcher.run(Producer::sync(|ctx| ctx.emit("second")));

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(sink.is_empty());

        gate.open();
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(sink.actions(), vec!["first", "second"]);
    }

    #[test]
    fn test_read_state_reaches_producer() {
        let sink = RecordingSink::new();
        let dispatcher: ManagedDispatcher<&'static str, u32, u32> =
            ManagedDispatcher::builder(sink.dispatch(), ReadState::constant(41)).build();

        let task = dispatcher.run(Producer::sync(|ctx| Ok(ctx.state() + 1)));
        assert_eq!(task.into_ready().unwrap().unwrap(), 42);
    }

    #[test]
    fn test_debug_output_for_builder_and_outcomes() {
        let sink = RecordingSink::<&'static str>::new();
        let builder: ManagedDispatcherBuilder<&'static str, (), ()> =
            ManagedDispatcher::builder(sink.dispatch(), ReadState::constant(()))
                .with_consumer(series());
        assert!(format!("{:?}", builder).contains("series"));

        let dispatcher = builder.build();
        let forwarded = dispatcher.dispatch(Submission::Action("TEST")).unwrap();
        assert_eq!(format!("{:?}", forwarded), "Forwarded");

        let ran = dispatcher
            .dispatch(Submission::Plain(Producer::sync(|_| Ok(()))))
            .unwrap();
        assert!(format!("{:?}", ran).starts_with("Task(Task::Ready"));
    }
}
