//! Retry-until-acknowledged request sessions.
//!
//! A [`RetrySession`] sends one command frame, resends the identical frame on
//! a fixed interval and ends in exactly one of two ways: a notification
//! matching its [`CorrelationKey`] arrives, or the deadline passes. Timers and
//! the pending-request registration are released on every exit path.
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::codec::Command;
use crate::events::{CorrelationKey, EventDispatcher};
use crate::messages::PowerState;
use crate::transport::{DatagramTransport, TransportError};

pub mod state;
use state::{FailureReason, SessionState, SessionStateError};

/// Resend cadence and overall deadline of a retry session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Must be non-zero.
    pub resend_interval: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Upper bound on resends before the deadline: `floor(timeout / interval)`.
    pub fn max_resends(&self) -> u32 {
        if self.resend_interval.is_zero() {
            return 0;
        }
        (self.timeout.as_nanos() / self.resend_interval.as_nanos()) as u32
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Errors that end a retry session without an acknowledgment.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("request timed out after {waited:?} ({resends} resends)")]
    RequestTimeout { waited: Duration, resends: u32 },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("pending request discarded before acknowledgment")]
    Abandoned,
    #[error(transparent)]
    State(#[from] SessionStateError),
}

/// One in-flight command waiting for its acknowledgment.
pub struct RetrySession<'a, T: ?Sized> {
    transport: &'a T,
    dispatcher: &'a EventDispatcher,
    policy: RetryPolicy,
    target: SocketAddr,
    frame: Vec<u8>,
    key: CorrelationKey,
    state: SessionState,
}

impl<'a, T> RetrySession<'a, T>
where
    T: DatagramTransport + ?Sized,
{
    pub fn new(
        transport: &'a T,
        dispatcher: &'a EventDispatcher,
        policy: RetryPolicy,
        target: SocketAddr,
        command: Command,
        key: CorrelationKey,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            policy,
            target,
            frame: command.encode(),
            key,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Drives the session to completion and returns the acknowledged state.
    pub async fn run(mut self) -> Result<PowerState, SessionError> {
        let dispatcher = self.dispatcher;
        // Registered before the first send so an immediate reply is not missed.
        let mut registration = dispatcher.register(self.key);

        self.transition(SessionState::Sending)?;
        let started = Instant::now();
        if let Err(err) = self.transport.send_to(&self.frame, self.target).await {
            warn!(peer = %self.target, error = %err, "initial send failed");
            self.transition(SessionState::Failed(FailureReason::Transport))?;
            return Err(err.into());
        }
        self.transition(SessionState::WaitingForAck { resends: 0 })?;

        let deadline = time::sleep_until(started + self.policy.timeout);
        tokio::pin!(deadline);
        let mut ticker = time::interval_at(
            started + self.policy.resend_interval,
            self.policy.resend_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                ack = registration.acknowledged() => {
                    let resends = self.resends();
                    return match ack {
                        Some(state) => {
                            self.transition(SessionState::Resolved(state))?;
                            debug!(key = ?self.key, %state, resends, "request acknowledged");
                            Ok(state)
                        }
                        None => {
                            self.transition(SessionState::Failed(FailureReason::Abandoned))?;
                            Err(SessionError::Abandoned)
                        }
                    };
                }
                _ = &mut deadline => {
                    let resends = self.resends();
                    self.transition(SessionState::Failed(FailureReason::Timeout))?;
                    debug!(key = ?self.key, resends, "request timed out");
                    return Err(SessionError::RequestTimeout {
                        waited: started.elapsed(),
                        resends,
                    });
                }
                _ = ticker.tick() => {
                    let resends = self.resends() + 1;
                    debug!(key = ?self.key, resends, "resending command");
                    if let Err(err) = self.transport.send_to(&self.frame, self.target).await {
                        warn!(peer = %self.target, error = %err, "resend failed");
                    }
                    self.transition(SessionState::WaitingForAck { resends })?;
                }
            }
        }
    }

    fn resends(&self) -> u32 {
        match self.state {
            SessionState::WaitingForAck { resends } => resends,
            _ => 0,
        }
    }

    fn transition(&mut self, next: SessionState) -> Result<(), SessionStateError> {
        self.state = self.state.transition(next)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_resends_is_floor_of_ratio() {
        assert_eq!(RetryPolicy::default().max_resends(), 20);
        let policy = RetryPolicy {
            resend_interval: Duration::from_millis(300),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.max_resends(), 3);
    }
}
