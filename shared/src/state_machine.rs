//! Connection Lifecycle State Machine
//!
//! Defines the connection states and which transitions between them are valid.
//!
//! ```text
//! Opening ──► Open ──► Closing ──► Closed
//!    │          │         │
//!    └──────────┴─────────┴──────► Failed
//! ```
//! `Opening ──► Closing` is also allowed so that a pending open can be aborted.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Opening,
    Open,
    Closing,
    Closed,
    Failed,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(ConnectionState),
    /// Transition was invalid from current state
    Invalid {
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl ConnectionState {
    /// A live handle exists while the connection is in one of these states
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Opening | ConnectionState::Open | ConnectionState::Closing
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }

    /// Check whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Opening, Open)
                | (Opening, Closing)
                | (Opening, Failed)
                | (Open, Closing)
                | (Open, Failed)
                | (Closing, Closed)
                | (Closing, Failed)
        )
    }

    /// Attempt a transition, updating `self` only when it is legal
    pub fn transition(&mut self, next: ConnectionState) -> TransitionResult {
        if self.can_transition_to(next) {
            *self = next;
            TransitionResult::Success(next)
        } else {
            TransitionResult::Invalid {
                from: *self,
                to: next,
            }
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Opening => "opening",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_happy_path() {
        let mut state = Opening;
        assert_eq!(state.transition(Open), TransitionResult::Success(Open));
        assert_eq!(state.transition(Closing), TransitionResult::Success(Closing));
        assert_eq!(state.transition(Closed), TransitionResult::Success(Closed));
        assert!(state.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [Closed, Failed] {
            for next in [Opening, Open, Closing, Closed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let mut state = Open;
        let result = state.transition(Opening);
        assert_eq!(result, TransitionResult::Invalid { from: Open, to: Opening });
        assert_eq!(state, Open);
    }

    #[test]
    fn test_any_live_state_can_fail() {
        for live in [Opening, Open, Closing] {
            assert!(live.is_live());
            assert!(live.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_pending_open_can_be_aborted() {
        assert!(Opening.can_transition_to(Closing));
        assert!(!Opening.can_transition_to(Closed));
    }
}
