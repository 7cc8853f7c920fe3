//! Transition-table engine shared by the connection, channel and presence
//! state machines.

use std::fmt::Debug;

/// A state enum with a static adjacency table.
pub trait State: Copy + Eq + Debug + 'static {
    /// States reachable from `self`.
    fn transitions(self) -> &'static [Self];

    fn can_transition_to(self, next: Self) -> bool {
        self.transitions().contains(&next)
    }
}

/// Current state of one machine instance. Transitions that are
/// not in the table are logged and ignored.
#[derive(Debug, Clone)]
pub(crate) struct StateMachine<S: State> {
    name: &'static str,
    current: S,
}

impl<S: State> StateMachine<S> {
    pub(crate) fn new(name: &'static str, initial: S) -> Self {
        StateMachine {
            name,
            current: initial,
        }
    }

    pub(crate) fn current(&self) -> S {
        self.current
    }

    pub(crate) fn is(&self, states: &[S]) -> bool {
        states.contains(&self.current)
    }

    /// Apply `next` if the table allows it. Returns the state left behind.
    pub(crate) fn transition(&mut self, next: S) -> Option<S> {
        if !self.current.can_transition_to(next) {
            tracing::warn!(
                machine = self.name,
                from = ?self.current,
                to = ?next,
                "Ignoring invalid state transition"
            );
            return None;
        }
        let previous = self.current;
        self.current = next;
        tracing::debug!(machine = self.name, from = ?previous, to = ?next, "State transition");
        Some(previous)
    }
}
