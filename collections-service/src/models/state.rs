//! Shared vocabulary for the per-entity state machines.

use thiserror::Error;

/// Outcome of applying an event to a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// The state changes from `from` to `to`.
    Applied { from: S, to: S },
    /// The entity is already in the target state; re-delivery is a no-op.
    Unchanged(S),
}

impl<S: Copy> Transition<S> {
    /// State after the transition.
    pub fn state(&self) -> S {
        match self {
            Transition::Applied { to, .. } => *to,
            Transition::Unchanged(s) => *s,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

/// The event is not legal from the current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{entity} cannot apply '{event}' from '{from}'")]
pub struct IllegalTransition {
    pub entity: &'static str,
    pub from: &'static str,
    pub event: &'static str,
}
