//! Lifecycle of one call: Idle → Active → HalfClosed → Closed.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use skein_types::{CallError, ProtocolViolation};
use tokio_util::sync::CancellationToken;

/// Where a call is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Opened, nothing exchanged yet.
    Idle,
    /// At least one message sent or received.
    Active,
    /// One direction finished, the other still open.
    HalfClosed,
    /// Both directions done and the terminal status assigned.
    Closed,
}

#[derive(Debug)]
struct StateInner {
    phase: CallPhase,
    send_done: bool,
    recv_done: bool,
    outcome: Option<Result<(), CallError>>,
}

/// State shared by every task touching one call.
///
/// `closed` is the both-directions-done flag, readable without the lock.
/// `token` fires exactly when the call reaches its terminal status, or
/// earlier if the parent token is cancelled, and wakes every waiter in
/// either direction.
#[derive(Debug)]
pub(crate) struct CallState {
    inner: Mutex<StateInner>,
    closed: AtomicBool,
    token: CancellationToken,
}

impl CallState {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                phase: CallPhase::Idle,
                send_done: false,
                recv_done: false,
                outcome: None,
            }),
            closed: AtomicBool::new(false),
            token,
        }
    }

    pub(crate) fn phase(&self) -> CallPhase {
        self.inner.lock().phase
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn outcome(&self) -> Option<Result<(), CallError>> {
        self.inner.lock().outcome.clone()
    }

    pub(crate) fn recv_done(&self) -> bool {
        self.inner.lock().recv_done
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Check that a message may be sent and move Idle → Active.
    pub(crate) fn begin_send(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock();
        if inner.outcome.is_some() {
            return Err(ProtocolViolation::StreamClosed.into());
        }
        if inner.send_done {
            return Err(ProtocolViolation::SendAfterHalfClose.into());
        }
        if inner.phase == CallPhase::Idle {
            inner.phase = CallPhase::Active;
        }
        Ok(())
    }

    pub(crate) fn mark_received(&self) {
        let mut inner = self.inner.lock();
        if inner.phase == CallPhase::Idle {
            inner.phase = CallPhase::Active;
        }
    }

    /// Close the sending direction. Returns `true` the first time, when a
    /// half-close must go out on the wire.
    pub(crate) fn close_send(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.outcome.is_some() || inner.send_done {
            return false;
        }
        inner.send_done = true;
        inner.phase = CallPhase::HalfClosed;
        true
    }

    /// The peer finished sending.
    pub(crate) fn close_recv(&self) {
        let mut inner = self.inner.lock();
        if inner.outcome.is_some() || inner.recv_done {
            return;
        }
        inner.recv_done = true;
        inner.phase = CallPhase::HalfClosed;
    }

    /// Assign the terminal status. Only the first caller wins; it gets
    /// `true` back and the shared token fires.
    pub(crate) fn complete(&self, outcome: Result<(), CallError>) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.outcome.is_some() {
                return false;
            }
            inner.outcome = Some(outcome);
            inner.send_done = true;
            inner.recv_done = true;
            inner.phase = CallPhase::Closed;
        }
        self.closed.store(true, Ordering::Release);
        self.token.cancel();
        true
    }

    /// Error to report after the token fired.
    ///
    /// If nothing completed the call yet, the parent token was cancelled, so
    /// the call completes as `Cancelled`. Returns `None` if the call had
    /// completed successfully.
    pub(crate) fn interruption(&self) -> Option<CallError> {
        self.complete(Err(CallError::Cancelled));
        match self.outcome() {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let state = CallState::new(CancellationToken::new());
        assert_eq!(state.phase(), CallPhase::Idle);
        state.begin_send().unwrap();
        assert_eq!(state.phase(), CallPhase::Active);
        assert!(state.close_send());
        assert!(!state.close_send());
        assert_eq!(state.phase(), CallPhase::HalfClosed);
        assert_eq!(
            state.begin_send(),
            Err(CallError::Protocol(ProtocolViolation::SendAfterHalfClose))
        );
        assert!(state.complete(Ok(())));
        assert!(state.is_closed());
        assert!(state.token().is_cancelled());
        assert_eq!(state.phase(), CallPhase::Closed);
        assert_eq!(
            state.begin_send(),
            Err(CallError::Protocol(ProtocolViolation::StreamClosed))
        );
    }

    #[test]
    fn first_terminal_status_wins() {
        let state = CallState::new(CancellationToken::new());
        assert!(state.complete(Err(CallError::DeadlineExceeded)));
        assert!(!state.complete(Err(CallError::Cancelled)));
        assert_eq!(state.interruption(), Some(CallError::DeadlineExceeded));
    }

    #[test]
    fn parent_cancellation_becomes_cancelled() {
        let parent = CancellationToken::new();
        let state = CallState::new(parent.child_token());
        parent.cancel();
        assert!(state.token().is_cancelled());
        assert_eq!(state.interruption(), Some(CallError::Cancelled));
        assert!(state.is_closed());
    }
}
