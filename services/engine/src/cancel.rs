//! Group-wide stop signals.
//!
//! A group can be stopped two ways:
//!
//! - **halt**: no new deployment may start. Work already claimed runs to
//!   its own conclusion.
//! - **abort**: like halt, and every wait in flight (backoff sleeps, health
//!   polling, dependency waits) is interrupted with the abort reason.
//!
//! Both are level-triggered and sticky.

use std::sync::Arc;

use tokio::sync::watch;

use crate::model::{Failure, FailureReason};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SignalState {
    halted: bool,
    aborted: Option<FailureReason>,
}

/// The controlling side, held by the orchestrator and the engine registry.
#[derive(Debug, Clone)]
pub struct GroupSignal {
    tx: Arc<watch::Sender<SignalState>>,
}

/// The observing side, handed to workers.
#[derive(Debug, Clone)]
pub struct GroupToken {
    rx: watch::Receiver<SignalState>,
}

impl GroupSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SignalState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn token(&self) -> GroupToken {
        GroupToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Stops new deployments from starting.
    pub fn halt(&self) {
        self.tx.send_if_modified(|state| {
            let changed = !state.halted;
            state.halted = true;
            changed
        });
    }

    /// Stops new deployments and interrupts waits. The first reason wins.
    pub fn abort(&self, reason: FailureReason) {
        self.tx.send_if_modified(|state| {
            if state.aborted.is_some() {
                return false;
            }
            state.halted = true;
            state.aborted = Some(reason);
            true
        });
    }

    pub fn is_halted(&self) -> bool {
        self.tx.borrow().halted
    }

    pub fn abort_reason(&self) -> Option<FailureReason> {
        self.tx.borrow().aborted
    }
}

impl Default for GroupSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupToken {
    /// A token that is never signalled. Used for standalone deployments.
    pub fn detached() -> Self {
        GroupSignal::new().token()
    }

    /// Returns the reason a new deployment must not start, if any.
    pub fn should_start(&self) -> Option<FailureReason> {
        let state = *self.rx.borrow();
        match (state.aborted, state.halted) {
            (Some(reason), _) => Some(reason),
            (None, true) => Some(FailureReason::Halted),
            (None, false) => None,
        }
    }

    pub fn abort_reason(&self) -> Option<FailureReason> {
        self.rx.borrow().aborted
    }

    /// Resolves once the group is aborted.
    ///
    /// Never resolves if the controlling side is dropped without aborting.
    pub async fn aborted(&mut self) -> FailureReason {
        loop {
            if let Some(reason) = self.rx.borrow_and_update().aborted {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleeps for `duration` unless the group is aborted first.
    pub async fn sleep(&mut self, duration: std::time::Duration) -> Result<(), FailureReason> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            reason = self.aborted() => Err(reason),
        }
    }
}

/// The failure recorded on a deployment stopped before it was claimed.
pub fn not_started(reason: FailureReason) -> Failure {
    let detail = match reason {
        FailureReason::Halted => "not started: an earlier deployment in the group failed",
        FailureReason::Cancelled => "not started: the group was cancelled",
        FailureReason::GroupTimeout => "not started: the group exceeded its time budget",
        _ => "not started",
    };
    Failure::new(reason, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_halt_blocks_new_starts() {
        let signal = GroupSignal::new();
        let token = signal.token();
        assert_eq!(token.should_start(), None);

        signal.halt();
        assert_eq!(token.should_start(), Some(FailureReason::Halted));
        assert_eq!(token.abort_reason(), None);
    }

    #[test]
    fn test_first_abort_reason_wins() {
        let signal = GroupSignal::new();
        let token = signal.token();
        signal.abort(FailureReason::Cancelled);
        signal.abort(FailureReason::GroupTimeout);

        assert_eq!(token.should_start(), Some(FailureReason::Cancelled));
        assert!(signal.is_halted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_interrupts_sleep() {
        let signal = GroupSignal::new();
        let mut token = signal.token();

        let sleeper = tokio::spawn(async move { token.sleep(Duration::from_secs(600)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        signal.abort(FailureReason::GroupTimeout);

        assert_eq!(sleeper.await.unwrap(), Err(FailureReason::GroupTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_abort() {
        let mut token = GroupToken::detached();
        assert_eq!(token.sleep(Duration::from_secs(5)).await, Ok(()));
    }
}
