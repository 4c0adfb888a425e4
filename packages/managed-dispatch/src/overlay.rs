//! Optimistic overlay over a base reducer.
//!
//! The overlay keeps a confirmed checkpoint plus an ordered log of every action
//! received since the first unconfirmed one. The visible state is the log
//! folded over the checkpoint:
//!
//! ```text
//!   checkpoint ── [A1 tx1] [S2 tx1] [S3 tx1] [P5] [A4 tx1] ──▶ current
//!                  staged   staged   staged  plain staged
//! ```
//!
//! Retracting a transaction removes its entries and re-folds the remaining log,
//! so unrelated actions that arrived in between keep their place. Once the
//! oldest entries are all confirmed they are folded into the checkpoint and
//! dropped from the log.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::core::{Action, TransactionId};
use crate::store::ReducerStore;

/// Which half of an optimistic pair emitted a staged action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The slow, real work; confirmed on commit.
    Authoritative,
    /// The immediate guess; always retracted eventually.
    Speculative,
}

/// Which staged entries a rollback retracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollbackScope {
    /// Only the speculative entries.
    Speculative,
    /// Every unconfirmed entry of the transaction.
    All,
}

/// Actions understood by an [`OptimisticReducer`].
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayAction<A> {
    /// An untagged action, applied as confirmed.
    Plain(A),
    /// An action staged under a transaction.
    Staged {
        transaction: TransactionId,
        side: Side,
        action: A,
    },
    /// Retract staged entries of a transaction.
    Rollback {
        transaction: TransactionId,
        scope: RollbackScope,
    },
    /// Confirm a transaction's authoritative entries and close it.
    Commit { transaction: TransactionId },
}

impl<A> OverlayAction<A> {
    /// Stage `action` under `transaction`.
    pub fn post(action: A, transaction: TransactionId, side: Side) -> Self {
        OverlayAction::Staged {
            transaction,
            side,
            action,
        }
    }

    /// Retract the speculative entries of `transaction`.
    pub fn rollback(transaction: TransactionId) -> Self {
        OverlayAction::Rollback {
            transaction,
            scope: RollbackScope::Speculative,
        }
    }

    /// Retract every unconfirmed entry of `transaction`.
    pub fn abort(transaction: TransactionId) -> Self {
        OverlayAction::Rollback {
            transaction,
            scope: RollbackScope::All,
        }
    }

    /// Confirm `transaction`.
    pub fn commit(transaction: TransactionId) -> Self {
        OverlayAction::Commit { transaction }
    }

    /// The transaction this action belongs to, if any.
    pub fn transaction(&self) -> Option<TransactionId> {
        match self {
            OverlayAction::Plain(_) => None,
            OverlayAction::Staged { transaction, .. }
            | OverlayAction::Rollback { transaction, .. }
            | OverlayAction::Commit { transaction } => Some(*transaction),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry<A> {
    action: A,
    /// `None` once confirmed.
    staged: Option<(TransactionId, Side)>,
}

/// Base state plus the overlay log.
#[derive(Clone)]
pub struct OptimisticState<S, A> {
    /// Present exactly when the log is non-empty.
    checkpoint: Option<S>,
    log: VecDeque<Entry<A>>,
    current: S,
}

impl<S, A> OptimisticState<S, A> {
    /// The visible state, staged entries included.
    pub fn current(&self) -> &S {
        &self.current
    }

    /// Returns true while any transaction has unconfirmed entries.
    pub fn is_optimistic(&self) -> bool {
        self.log.iter().any(|entry| entry.staged.is_some())
    }

    /// Transactions with unconfirmed entries, in first-staged order.
    pub fn open_transactions(&self) -> Vec<TransactionId> {
        let mut open = Vec::new();
        for (transaction, _) in self.log.iter().filter_map(|entry| entry.staged) {
            if !open.contains(&transaction) {
                open.push(transaction);
            }
        }
        open
    }

    /// Number of log entries not yet folded into the checkpoint.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }
}

impl<S: Clone, A> OptimisticState<S, A> {
    /// The visible state with its optimistic flag.
    pub fn view(&self) -> OptimisticView<S> {
        OptimisticView {
            state: self.current.clone(),
            optimistic: self.is_optimistic(),
        }
    }
}

impl<S: fmt::Debug, A: fmt::Debug> fmt::Debug for OptimisticState<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticState")
            .field("current", &self.current)
            .field("optimistic", &self.is_optimistic())
            .field("log", &self.log)
            .finish()
    }
}

/// `{ ...state, optimistic }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimisticView<S> {
    #[serde(flatten)]
    pub state: S,
    pub optimistic: bool,
}

type BaseReducer<S, A> = dyn Fn(&mut S, &A) + Send + Sync;

/// Wraps a base reducer with the overlay.
pub struct OptimisticReducer<S, A> {
    base: Arc<BaseReducer<S, A>>,
}

/// Wrap `base` with the optimistic overlay.
pub fn wrap_reducer<S, A, R>(base: R) -> OptimisticReducer<S, A>
where
    R: Fn(&mut S, &A) + Send + Sync + 'static,
{
    OptimisticReducer {
        base: Arc::new(base),
    }
}

impl<S, A> OptimisticReducer<S, A>
where
    S: Clone,
    A: Clone,
{
    /// The overlay state for `base` with nothing staged.
    pub fn init(&self, base: S) -> OptimisticState<S, A> {
        OptimisticState {
            checkpoint: None,
            log: VecDeque::new(),
            current: base,
        }
    }

    /// Apply one overlay action.
    pub fn reduce(&self, state: &mut OptimisticState<S, A>, action: OverlayAction<A>) {
        match action {
            OverlayAction::Plain(action) => {
                (self.base)(&mut state.current, &action);
                if !state.log.is_empty() {
                    state.log.push_back(Entry {
                        action,
                        staged: None,
                    });
                }
            }
            OverlayAction::Staged {
                transaction,
                side,
                action,
            } => {
                if state.log.is_empty() {
                    state.checkpoint = Some(state.current.clone());
                }
                (self.base)(&mut state.current, &action);
                state.log.push_back(Entry {
                    action,
                    staged: Some((transaction, side)),
                });
            }
            OverlayAction::Rollback { transaction, scope } => {
                let before = state.log.len();
                state.log.retain(|entry| match entry.staged {
                    Some((tx, side)) if tx == transaction => {
                        scope == RollbackScope::Speculative && side == Side::Authoritative
                    }
                    _ => true,
                });
                let removed = before - state.log.len();
                debug!(%transaction, ?scope, removed, "rolling back staged entries");
                if removed > 0 {
                    self.refold(state);
                }
            }
            OverlayAction::Commit { transaction } => {
                let before = state.log.len();
                state.log.retain_mut(|entry| match entry.staged {
                    Some((tx, Side::Speculative)) if tx == transaction => false,
                    Some((tx, Side::Authoritative)) if tx == transaction => {
                        entry.staged = None;
                        true
                    }
                    _ => true,
                });
                let dropped = before - state.log.len();
                debug!(%transaction, dropped, "committing transaction");
                if dropped > 0 {
                    self.refold(state);
                }
            }
        }
        self.compact(state);
    }

    /// A store reducer over the overlay state.
    pub fn into_store_reducer(
        self,
    ) -> impl Fn(&mut OptimisticState<S, A>, OverlayAction<A>) + Send + Sync + 'static
    where
        S: 'static,
        A: 'static,
    {
        move |state, action| self.reduce(state, action)
    }

    fn refold(&self, state: &mut OptimisticState<S, A>) {
        if let Some(checkpoint) = &state.checkpoint {
            let mut current = checkpoint.clone();
            for entry in &state.log {
                (self.base)(&mut current, &entry.action);
            }
            state.current = current;
        }
    }

    fn compact(&self, state: &mut OptimisticState<S, A>) {
        while matches!(state.log.front(), Some(entry) if entry.staged.is_none()) {
            let popped = state.log.pop_front();
            if let (Some(entry), Some(checkpoint)) = (popped, state.checkpoint.as_mut()) {
                (self.base)(checkpoint, &entry.action);
            }
        }
        if state.log.is_empty() {
            state.checkpoint = None;
        }
    }
}

impl<S, A> OptimisticReducer<S, A>
where
    S: Clone + Send + 'static,
    A: Action,
{
    /// An in-memory store running this overlay, starting from `initial`.
    pub fn into_store(self, initial: S) -> ReducerStore<OptimisticState<S, A>, OverlayAction<A>> {
        let state = self.init(initial);
        ReducerStore::new(state, self.into_store_reducer())
    }
}

impl<S, A> Clone for OptimisticReducer<S, A> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
        }
    }
}

impl<S, A> fmt::Debug for OptimisticReducer<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticReducer").finish_non_exhaustive()
    }
}
