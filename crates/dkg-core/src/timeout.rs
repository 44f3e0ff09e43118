//! Per-phase timeout supervision
//!
//! Exactly one live timer per session. Arming replaces any existing timer
//! (cancel-then-replace), so two timers can never race for one session.
//! A deadline does not act on session state directly: it is delivered as a
//! [`PhaseDeadline`] value into the same queue the coordinator drains for
//! participant traffic, and the coordinator decides there whether the
//! session is still in the timed phase.

use crate::types::{Phase, PhaseTimeouts, SessionId};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Deadline event for one session phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseDeadline {
    pub session_id: SessionId,
    pub phase: Phase,
}

/// Owns the one-timer-per-session invariant
pub struct TimeoutSupervisor<E> {
    tx: mpsc::UnboundedSender<E>,
    timeouts: PhaseTimeouts,
    timers: HashMap<SessionId, JoinHandle<()>>,
}

impl<E: From<PhaseDeadline> + Send + 'static> TimeoutSupervisor<E> {
    /// Create a supervisor emitting deadline events into `tx`
    pub fn new(tx: mpsc::UnboundedSender<E>, timeouts: PhaseTimeouts) -> Self {
        Self {
            tx,
            timeouts,
            timers: HashMap::new(),
        }
    }

    /// Arm the deadline for a phase, replacing any live timer for the
    /// session. Terminal phases have no deadline and only cancel.
    pub fn arm(&mut self, session_id: &SessionId, phase: Phase) {
        self.cancel(session_id);

        let Some(duration) = self.timeouts.for_phase(phase) else {
            return;
        };

        let tx = self.tx.clone();
        let deadline = PhaseDeadline {
            session_id: session_id.clone(),
            phase,
        };
        debug!(session_id = %session_id, phase = %phase, ?duration, "Arming phase deadline");

        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // Receiver gone means the coordinator is shutting down
            let _ = tx.send(deadline.into());
        });
        self.timers.insert(session_id.clone(), handle);
    }

    /// Cancel the session's timer; a no-op when none is live
    pub fn cancel(&mut self, session_id: &SessionId) {
        if let Some(handle) = self.timers.remove(session_id) {
            handle.abort();
        }
    }

    /// Number of live timers
    pub fn live_timers(&self) -> usize {
        self.timers.len()
    }
}

impl<E> Drop for TimeoutSupervisor<E> {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn short_timeouts() -> PhaseTimeouts {
        PhaseTimeouts {
            joining: Duration::from_secs(5),
            round1: Duration::from_secs(3),
            round2: Duration::from_secs(5),
            finalizing: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel::<PhaseDeadline>();
        let mut supervisor = TimeoutSupervisor::new(tx, short_timeouts());

        supervisor.arm(&"s1".to_string(), Phase::Round1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.phase, Phase::Round1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel::<PhaseDeadline>();
        let mut supervisor = TimeoutSupervisor::new(tx, short_timeouts());

        supervisor.arm(&"s1".to_string(), Phase::Round1);
        supervisor.cancel(&"s1".to_string());
        assert_eq!(supervisor.live_timers(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_replaces_prior_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel::<PhaseDeadline>();
        let mut supervisor = TimeoutSupervisor::new(tx, short_timeouts());

        supervisor.arm(&"s1".to_string(), Phase::Joining);
        supervisor.arm(&"s1".to_string(), Phase::Round1);
        assert_eq!(supervisor.live_timers(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.phase, Phase::Round1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_without_timer_is_noop() {
        let (tx, _rx) = mpsc::unbounded_channel::<PhaseDeadline>();
        let mut supervisor = TimeoutSupervisor::new(tx, short_timeouts());
        supervisor.cancel(&"nope".to_string());
        assert_eq!(supervisor.live_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_phase_only_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel::<PhaseDeadline>();
        let mut supervisor = TimeoutSupervisor::new(tx, short_timeouts());

        supervisor.arm(&"s1".to_string(), Phase::Round2);
        supervisor.arm(&"s1".to_string(), Phase::Completed);
        assert_eq!(supervisor.live_timers(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_sessions() {
        let (tx, mut rx) = mpsc::unbounded_channel::<PhaseDeadline>();
        let mut supervisor = TimeoutSupervisor::new(tx, short_timeouts());

        supervisor.arm(&"a".to_string(), Phase::Finalizing);
        supervisor.arm(&"b".to_string(), Phase::Round2);
        supervisor.cancel(&"b".to_string());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id, "a");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
