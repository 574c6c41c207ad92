use thiserror::Error;

use crate::messages::PowerState;

/// Why a retry session ended without an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    Transport,
    Abandoned,
}

/// Lifecycle of one retry session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sending,
    WaitingForAck { resends: u32 },
    Resolved(PowerState),
    Failed(FailureReason),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionStateError {
    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

impl SessionState {
    /// Validates and returns the next state.
    pub fn transition(&self, next: SessionState) -> Result<SessionState, SessionStateError> {
        use SessionState::*;
        let allowed = match (self, &next) {
            (Idle, Sending) => true,
            (Sending, WaitingForAck { resends: 0 }) => true,
            (Sending, Failed(FailureReason::Transport)) => true,
            (WaitingForAck { resends }, WaitingForAck { resends: to }) => *to == resends + 1,
            (WaitingForAck { .. }, Resolved(_)) => true,
            (WaitingForAck { .. }, Failed(FailureReason::Timeout | FailureReason::Abandoned)) => {
                true
            }
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(SessionStateError::InvalidTransition {
                from: self.clone(),
                to: next,
            })
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Resolved(_) | SessionState::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let state = SessionState::Idle
            .transition(SessionState::Sending)
            .unwrap()
            .transition(SessionState::WaitingForAck { resends: 0 })
            .unwrap()
            .transition(SessionState::WaitingForAck { resends: 1 })
            .unwrap()
            .transition(SessionState::Resolved(PowerState::On))
            .unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn terminal_states_do_not_move() {
        let resolved = SessionState::Resolved(PowerState::Off);
        assert!(resolved
            .transition(SessionState::WaitingForAck { resends: 0 })
            .is_err());
        let failed = SessionState::Failed(FailureReason::Timeout);
        assert!(failed
            .transition(SessionState::Resolved(PowerState::On))
            .is_err());
    }

    #[test]
    fn resend_counter_must_advance_by_one() {
        let waiting = SessionState::WaitingForAck { resends: 2 };
        assert!(waiting
            .transition(SessionState::WaitingForAck { resends: 4 })
            .is_err());
    }

    #[test]
    fn cannot_resolve_before_sending() {
        assert!(SessionState::Idle
            .transition(SessionState::Resolved(PowerState::On))
            .is_err());
    }
}
