//! Revocable, swappable dispatch.
//!
//! A [`BehaviorController`] wraps a sink and hands out a [`Dispatch`] whose
//! behavior can be replaced at any time:
//!
//! - [`DispatchBehavior::Normal`] forwards to the sink.
//! - [`DispatchBehavior::Ignore`] drops actions silently (cancellation).
//! - [`DispatchBehavior::Error`] rejects actions with
//!   [`ThunkError::StaleDispatch`] (revocation).
//!
//! This lets the dispatch boundary take away a producer's permission to emit
//! once its lifetime is over, without tracking every place the handle was
//! copied to.
//!
//! ```ignore
//! let controller = BehaviorController::new(sink);
//! let dispatch = controller.dispatch();
//!
//! dispatch.dispatch(action)?;           // forwarded
//! controller.replace(DispatchBehavior::error("finished"));
//! assert!(dispatch.dispatch(action).is_err());
//! ```

use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::core::{Action, Dispatch};
use crate::error::{Result, StaleAction, ThunkError};

/// What a controlled dispatch does with an incoming action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchBehavior {
    /// Forward to the sink.
    Normal,
    /// Drop silently.
    Ignore,
    /// Reject with a [`ThunkError::StaleDispatch`] carrying this message.
    Error(String),
}

impl DispatchBehavior {
    /// Shorthand for `DispatchBehavior::Error(message.into())`.
    pub fn error(message: impl Into<String>) -> Self {
        DispatchBehavior::Error(message.into())
    }
}

/// Owns the "current behavior" cell of one dispatch handle.
///
/// Clones share the cell, so any clone can revoke the handle. Replacement
/// applies to emissions issued after `replace` returns; an emission already
/// past the behavior check completes under the behavior it read.
pub struct BehaviorController<A> {
    sink: Dispatch<A>,
    current: Arc<RwLock<DispatchBehavior>>,
}

impl<A: Action> BehaviorController<A> {
    /// A controller in [`DispatchBehavior::Normal`] around `sink`.
    pub fn new(sink: Dispatch<A>) -> Self {
        Self {
            sink,
            current: Arc::new(RwLock::new(DispatchBehavior::Normal)),
        }
    }

    /// The controlled dispatch handle.
    pub fn dispatch(&self) -> Dispatch<A> {
        let sink = self.sink.clone();
        let current = self.current.clone();
        Dispatch::from_fn(move |action: A| {
            let behavior = read_behavior(&current);
            apply(&behavior, &sink, action)
        })
    }

    /// Install a new behavior.
    pub fn replace(&self, behavior: DispatchBehavior) {
        debug!(?behavior, "replacing dispatch behavior");
        let mut guard = match self.current.write() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!("dispatch behavior lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        *guard = behavior;
    }

    /// The currently installed behavior.
    pub fn behavior(&self) -> DispatchBehavior {
        read_behavior(&self.current)
    }
}

fn read_behavior(cell: &RwLock<DispatchBehavior>) -> DispatchBehavior {
    match cell.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn apply<A: Action>(behavior: &DispatchBehavior, sink: &Dispatch<A>, action: A) -> Result<()> {
    match behavior {
        DispatchBehavior::Normal => sink.dispatch(action),
        DispatchBehavior::Ignore => {
            debug!(?action, "dropping action from cancelled producer");
            Ok(())
        }
        DispatchBehavior::Error(message) => {
            warn!(?action, %message, "rejecting action from revoked dispatch");
            Err(ThunkError::StaleDispatch {
                message: message.clone(),
                action: StaleAction::new(action),
            })
        }
    }
}

impl<A> Clone for BehaviorController<A> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            current: self.current.clone(),
        }
    }
}

impl<A> fmt::Debug for BehaviorController<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorController")
            .field("current", &read_behavior(&self.current))
            .finish_non_exhaustive()
    }
}
