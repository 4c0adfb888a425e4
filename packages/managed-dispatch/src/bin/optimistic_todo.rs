//! Optimistic todo list
//!
//! Saves a few items against a slow in-memory backend. Each save is an
//! optimistic pair: the item shows up as pending immediately and is replaced
//! by the stored item once the backend answers.
//!
//! ```text
//! RUST_LOG=info,managed_dispatch=debug cargo run --bin optimistic-todo -- 800
//! ```
//!
//! The optional argument is the backend delay in milliseconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use managed_dispatch::{
    extra, inject, wrap_reducer, Compose, Consumer, Context as ProducerContext, DispatchConfig,
    IdGenerator, ManagedDispatcher, OptimisticManager, OptimisticState, OverlayAction, Producer,
    ReducerStore, Submission, Task, ThunkError,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, PartialEq)]
struct TodoItem {
    id: u64,
    text: String,
    pending: bool,
    deleted: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum TodoAction {
    NewItem(TodoItem),
    DeleteItem(u64),
    SetDelay(u64),
}

#[derive(Debug, Clone, Default)]
struct TodoState {
    delay_ms: u64,
    items: Vec<TodoItem>,
}

fn reduce(state: &mut TodoState, action: &TodoAction) {
    match action {
        TodoAction::NewItem(item) => state.items.push(item.clone()),
        TodoAction::DeleteItem(id) => {
            for item in state.items.iter_mut().filter(|item| item.id == *id) {
                item.deleted = true;
            }
        }
        TodoAction::SetDelay(delay_ms) => state.delay_ms = *delay_ms,
    }
}

/// The fake backend handed to producers through `inject`.
#[derive(Clone, Default)]
struct TodoApi {
    counter: Arc<AtomicU64>,
}

impl TodoApi {
    fn uid(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn delay(&self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

type Overlay = OverlayAction<TodoAction>;
type TodoProducer = Producer<TodoAction, TodoState, ()>;

fn api_of(ctx: &ProducerContext<TodoAction, TodoState>) -> Result<TodoApi, ThunkError> {
    ctx.find::<TodoApi>()
        .cloned()
        .ok_or_else(|| ThunkError::msg("todo api was not injected"))
}

/// Store the item after the backend delay.
fn store_item(text: String) -> TodoProducer {
    Producer::try_new(move |ctx| {
        let api = api_of(ctx)?;
        let delay_ms = ctx.state().delay_ms;
        let dispatch = ctx.dispatch().clone();
        let text = text.clone();
        Ok(Task::pending(async move {
            api.delay(delay_ms).await;
            dispatch.dispatch(TodoAction::NewItem(TodoItem {
                id: api.uid(),
                text,
                pending: false,
                deleted: false,
            }))
        }))
    })
}

/// Show the item as pending right away.
fn show_pending_item(text: String) -> TodoProducer {
    Producer::sync(move |ctx| {
        let api = api_of(ctx)?;
        ctx.emit(TodoAction::NewItem(TodoItem {
            id: api.uid(),
            text: text.clone(),
            pending: true,
            deleted: false,
        }))
    })
}

fn save_item(text: &str) -> Submission<TodoAction, TodoState, ()> {
    Submission::optimistic(store_item(text.to_string()), show_pending_item(text.to_string()))
}

fn log_state(store: &ReducerStore<OptimisticState<TodoState, TodoAction>, Overlay>, stage: &str) {
    let view = store.with_state(|state| state.view());
    let items: Vec<String> = view
        .state
        .items
        .iter()
        .filter(|item| !item.deleted)
        .map(|item| {
            let marker = if item.pending { " (saving)" } else { "" };
            format!("#{} {}{}", item.id, item.text, marker)
        })
        .collect();
    info!(stage, optimistic = view.optimistic, ?items, "todo list");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,managed_dispatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = DispatchConfig::from_env().context("Failed to load dispatch configuration")?;
    let delay_ms: u64 = match std::env::args().nth(1) {
        Some(raw) => raw.parse().context("delay must be a number of milliseconds")?,
        None => 500,
    };
    info!(?config, delay_ms, "Starting optimistic todo demo");

    let api = TodoApi::default();
    let initial = TodoState {
        delay_ms: 0,
        items: ["Buy a milk", "Talk with Berry", "Fitness - Run 10km"]
            .into_iter()
            .map(|text| TodoItem {
                id: api.uid(),
                text: text.to_string(),
                pending: false,
                deleted: false,
            })
            .collect(),
    };

    let store = Arc::new(wrap_reducer(reduce).into_store(initial));
    let limit: Box<dyn Consumer<Overlay, TodoState, ()>> = config.consumer();
    let reader = store.reader_with(|s| s.current().clone());
    let managed = ManagedDispatcher::builder(store.sink(), reader)
        .loose(config.loose)
        .with_consumer(Compose::new().then(inject([extra(api.clone())])).then(limit))
        .build();
    let todos = OptimisticManager::new(managed).with_ids(IdGenerator::sequential());

    todos.dispatch(Submission::Action(TodoAction::SetDelay(delay_ms)))?;
    log_state(&store, "initial");

    let first = todos.dispatch(save_item("Walk the dog"))?.into_task();
    let second = todos.dispatch(save_item("Read \"Node.js for Embedded Systems\""))?.into_task();
    log_state(&store, "saving");

    todos.dispatch(Submission::Action(TodoAction::DeleteItem(2)))?;
    log_state(&store, "deleted one item while saving");

    for task in [first, second].into_iter().flatten() {
        task.await?;
    }
    log_state(&store, "saved");

    Ok(())
}
