//! The session lifecycle state machine.

use std::fmt;

/// The lifecycle states of a session, in order.
///
/// A session only ever moves forward through these states; once
/// `Disconnected` is reached it never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// The connection exists but no handshake has happened yet.
    New = 0,
    /// The `p2p` hello exchange completed.
    HandshakeComplete = 1,
    /// Capabilities were agreed and all protocol handlers are installed.
    Initialized = 2,
    /// A disconnect was requested locally.
    DisconnectRequested = 3,
    /// The disconnect message was sent, awaiting transport close.
    Disconnecting = 4,
    /// The transport is closed and all handlers are disposed.
    Disconnected = 5,
}

/// Error returned when a state transition would move backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid session state transition: {from:?} -> {to:?}")]
pub struct InvalidStateTransition {
    /// The current state.
    pub from: SessionState,
    /// The rejected target state.
    pub to: SessionState,
}

/// Tracks the current session state and latches the best state the session
/// ever reached.
#[derive(Debug, Clone, Copy)]
pub struct SessionStateTracker {
    current: SessionState,
    best: SessionState,
}

impl Default for SessionStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateTracker {
    /// Creates a tracker in the [`SessionState::New`] state.
    pub const fn new() -> Self {
        Self { current: SessionState::New, best: SessionState::New }
    }

    /// The current state.
    pub const fn current(&self) -> SessionState {
        self.current
    }

    /// The maximum state ever observed.
    pub const fn best_state_reached(&self) -> SessionState {
        self.best
    }

    /// Advances the state.
    ///
    /// Transitions are monotonically non-decreasing; re-entering the current
    /// state is a no-op. An abrupt transport close may skip intermediate
    /// states, e.g. `Initialized -> Disconnected`.
    pub fn advance(&mut self, to: SessionState) -> Result<(), InvalidStateTransition> {
        if to < self.current {
            return Err(InvalidStateTransition { from: self.current, to })
        }
        self.current = to;
        if to > self.best {
            self.best = to;
        }
        Ok(())
    }

    /// Returns `true` if a disconnect was requested or completed.
    pub const fn is_disconnecting(&self) -> bool {
        matches!(
            self.current,
            SessionState::DisconnectRequested |
                SessionState::Disconnecting |
                SessionState::Disconnected
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_advance_forward() {
        let mut tracker = SessionStateTracker::new();
        for state in [
            SessionState::HandshakeComplete,
            SessionState::Initialized,
            SessionState::DisconnectRequested,
            SessionState::Disconnecting,
            SessionState::Disconnected,
        ] {
            tracker.advance(state).unwrap();
            assert_eq!(tracker.current(), state);
        }
        assert_eq!(tracker.best_state_reached(), SessionState::Disconnected);
    }

    #[test]
    fn backward_transitions_are_rejected() {
        let mut tracker = SessionStateTracker::new();
        tracker.advance(SessionState::Initialized).unwrap();
        let err = tracker.advance(SessionState::HandshakeComplete).unwrap_err();
        assert_eq!(err.from, SessionState::Initialized);
        // the failed transition left the state untouched
        assert_eq!(tracker.current(), SessionState::Initialized);
    }

    #[test]
    fn abrupt_close_skips_states() {
        let mut tracker = SessionStateTracker::new();
        tracker.advance(SessionState::HandshakeComplete).unwrap();
        tracker.advance(SessionState::Initialized).unwrap();
        // transport died without a disconnect exchange
        tracker.advance(SessionState::Disconnected).unwrap();
        assert!(tracker.is_disconnecting());
        assert_eq!(tracker.best_state_reached(), SessionState::Disconnected);
    }

    #[test]
    fn reentering_the_same_state_is_a_noop() {
        let mut tracker = SessionStateTracker::new();
        tracker.advance(SessionState::DisconnectRequested).unwrap();
        tracker.advance(SessionState::DisconnectRequested).unwrap();
        assert_eq!(tracker.current(), SessionState::DisconnectRequested);
    }
}
