//! Testing utilities for producers, pipelines and optimistic transactions.
//!
//! # Feature Flag
//!
//! This module is available with the `testing` feature (and always inside
//! this crate's own tests):
//!
//! ```toml
//! [dev-dependencies]
//! managed-dispatch = { version = "0.1", features = ["testing"] }
//! ```
//!
//! - [`RecordingSink`] records every action it receives.
//! - [`Gate`] is a future you release by hand, for holding an async producer
//!   open at a precise point.
//! - [`ConcurrencyProbe`] tracks how many producers are inside a region at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::core::{Action, Dispatch};

/// A sink that records actions in arrival order.
#[derive(Clone)]
pub struct RecordingSink<A> {
    actions: Arc<Mutex<Vec<A>>>,
}

impl<A: Action> RecordingSink<A> {
    /// An empty recorder.
    pub fn new() -> Self {
        Self {
            actions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A dispatch handle that records into this sink.
    pub fn dispatch(&self) -> Dispatch<A> {
        let actions = self.actions.clone();
        Dispatch::from_fn(move |action| {
            actions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(action);
            Ok(())
        })
    }

    /// A copy of everything recorded so far.
    pub fn actions(&self) -> Vec<A> {
        self.actions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of recorded actions.
    pub fn len(&self) -> usize {
        self.actions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: Action> Default for RecordingSink<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// A one-shot barrier opened by hand.
///
/// Clones share the barrier. Waiting after the gate opened returns at once.
#[derive(Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Gate {
    /// A closed gate.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Release every current and future waiter.
    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once opened.
    pub fn is_open(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the gate opens.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of the gate, so this cannot fail
        // while `self` is borrowed.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts producers inside a region and remembers the peak.
#[derive(Clone, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    /// A probe with nothing inside.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark one producer as entered.
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    /// Mark one producer as left.
    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// How many are inside right now.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// The highest simultaneous count seen.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}
