//! Structured error type for producers, dispatch handles and transactions.
//!
//! `ThunkError` is the one error type that flows through [`Task`](crate::Task)
//! settlement. It is `Clone` because a pending task is a shared future and every
//! awaiter receives its own copy of the outcome.
//!
//! # Kinds
//!
//! - [`ThunkError::StaleDispatch`] - an emit handle was used after it was revoked.
//!   Always surfaced, unlike the silent drop used for cancellation.
//! - [`ThunkError::ProtocolViolation`] - an optimistic pair broke the
//!   authoritative-async / speculative-sync contract.
//! - [`ThunkError::Failed`] - the producer itself failed.
//! - [`ThunkError::Panicked`] - the producer panicked; captured so queues advance.
//! - [`ThunkError::Abandoned`] - a queued task was dropped before it could settle.
//!
//! # Example
//!
//! ```ignore
//! match dispatch.dispatch(TodoAction::Added(item)) {
//!     Ok(()) => {}
//!     Err(ThunkError::StaleDispatch { action, .. }) => {
//!         let stale = action.downcast_ref::<TodoAction>();
//!         tracing::warn!(?stale, "late emission rejected");
//!     }
//!     Err(e) => return Task::failed(e),
//! }
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = ThunkError> = std::result::Result<T, E>;

/// A type-erased copy of the action that hit a revoked dispatch handle.
///
/// The concrete type is recoverable with [`StaleAction::downcast_ref`]; the
/// `Debug` rendering is captured eagerly so the error stays printable.
#[derive(Clone)]
pub struct StaleAction {
    payload: Arc<dyn Any + Send + Sync>,
    rendered: String,
}

impl StaleAction {
    pub(crate) fn new<A: fmt::Debug + Send + Sync + 'static>(action: A) -> Self {
        let rendered = format!("{:?}", action);
        Self {
            payload: Arc::new(action),
            rendered,
        }
    }

    /// Try to view the rejected action as its concrete type.
    pub fn downcast_ref<A: 'static>(&self) -> Option<&A> {
        self.payload.downcast_ref::<A>()
    }

    /// The `Debug` rendering of the rejected action.
    pub fn rendered(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Debug for StaleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// Errors produced while running producers and delivering their actions.
#[derive(Debug, Clone, Error)]
pub enum ThunkError {
    /// Dispatch invoked through a revoked (`Error`) behavior.
    #[error("{message}: {action:?}")]
    StaleDispatch {
        /// The message installed by the revocation.
        message: String,
        /// The action that was rejected.
        action: StaleAction,
    },

    /// An optimistic pair violated its sync/async contract.
    #[error("optimistic protocol violation: {0}")]
    ProtocolViolation(String),

    /// The producer failed (returned an error or its future rejected).
    #[error("producer failed: {0}")]
    Failed(Arc<anyhow::Error>),

    /// The producer panicked.
    #[error("producer panicked: {0}")]
    Panicked(String),

    /// The task was dropped before it settled.
    #[error("task abandoned before it settled")]
    Abandoned,
}

impl ThunkError {
    /// Wrap any error as a producer failure.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        ThunkError::Failed(Arc::new(err.into()))
    }

    /// Wrap a plain message as a producer failure.
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        ThunkError::Failed(Arc::new(anyhow::Error::msg(message)))
    }

    /// Returns true for [`ThunkError::StaleDispatch`].
    pub fn is_stale_dispatch(&self) -> bool {
        matches!(self, ThunkError::StaleDispatch { .. })
    }

    /// Returns true for [`ThunkError::ProtocolViolation`].
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, ThunkError::ProtocolViolation(_))
    }

    /// Build a panic error from a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        ThunkError::Panicked(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Push(i32);

    #[test]
    fn test_stale_dispatch_display_carries_action() {
        let err = ThunkError::StaleDispatch {
            message: "dispatch used after producer finished".into(),
            action: StaleAction::new(Push(7)),
        };
        let display = err.to_string();
        assert!(display.contains("dispatch used after producer finished"));
        assert!(display.contains("Push(7)"));
        assert!(err.is_stale_dispatch());
    }

    #[test]
    fn test_stale_action_downcasts_to_concrete_type() {
        let err = ThunkError::StaleDispatch {
            message: "revoked".into(),
            action: StaleAction::new(Push(3)),
        };

        match &err {
            ThunkError::StaleDispatch { action, .. } => {
                assert_eq!(action.downcast_ref::<Push>(), Some(&Push(3)));
                assert!(action.downcast_ref::<String>().is_none());
                assert_eq!(action.rendered(), "Push(3)");
            }
            _ => panic!("Expected StaleDispatch"),
        }
    }

    #[test]
    fn test_failed_is_cloneable_and_keeps_message() {
        let err = ThunkError::failed(std::io::Error::new(
            std::io::ErrorKind::Other,
            "backend unavailable",
        ));
        let copy = err.clone();
        assert!(copy.to_string().contains("backend unavailable"));
        assert!(!copy.is_stale_dispatch());
    }

    #[test]
    fn test_from_panic_extracts_message() {
        let err = ThunkError::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "producer panicked: boom");

        let err = ThunkError::from_panic(Box::new(String::from("owned boom")));
        assert_eq!(err.to_string(), "producer panicked: owned boom");

        let err = ThunkError::from_panic(Box::new(42_u8));
        assert_eq!(err.to_string(), "producer panicked: unknown panic");
    }

    #[test]
    fn test_protocol_violation_is_pattern_matchable() {
        let err = ThunkError::ProtocolViolation("authoritative producer must be async".into());
        assert!(err.is_protocol_violation());
        match err {
            ThunkError::ProtocolViolation(reason) => assert!(reason.contains("async")),
            _ => panic!("Expected ProtocolViolation"),
        }
    }
}
