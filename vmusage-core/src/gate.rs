//! Run gate shared by the usage and compaction services.
//!
//! At most one run of a service is in flight. A trigger that arrives while a
//! run is in flight is either dropped or remembered as exactly one follow-up
//! run, never queued more than once.

use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

#[derive(Debug, Default)]
struct GateState {
    running: bool,
    queued: bool,
}

#[derive(Debug)]
pub(crate) struct RunGate {
    state: Mutex<GateState>,
    running: watch::Sender<bool>,
}

impl RunGate {
    pub(crate) fn new() -> Self {
        let (running, _) = watch::channel(false);
        Self { state: Mutex::new(GateState::default()), running }
    }

    /// Claim the gate. Returns `true` if the caller must start a run.
    ///
    /// When a run is already in flight and `queue_if_busy` is set, one
    /// follow-up run is recorded instead.
    pub(crate) fn try_start(&self, queue_if_busy: bool) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.running {
            state.queued |= queue_if_busy;
            return false;
        }
        state.running = true;
        self.running.send_replace(true);
        true
    }

    /// Finish a run. Returns `true` if a follow-up run was queued, in which
    /// case the gate stays claimed and the caller must run again.
    pub(crate) fn finish(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.queued {
            state.queued = false;
            return true;
        }
        state.running = false;
        self.running.send_replace(false);
        false
    }

    /// Release the gate and forget any queued run.
    pub(crate) fn abort(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = GateState::default();
        self.running.send_replace(false);
    }

    pub(crate) fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Wait until no run is in flight.
    pub(crate) async fn idle(&self) {
        let mut rx = self.running.subscribe();
        // The sender lives in self, so wait_for cannot fail here.
        let _ = rx.wait_for(|running| !*running).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_coalesces_to_one_follow_up() {
        let gate = RunGate::new();
        assert!(gate.try_start(true));
        assert!(!gate.try_start(true));
        assert!(!gate.try_start(true));

        assert!(gate.finish(), "one queued run expected");
        assert!(gate.is_running());
        assert!(!gate.finish(), "only one follow-up run expected");
        assert!(!gate.is_running());
    }

    #[test]
    fn test_unqueued_trigger_is_dropped() {
        let gate = RunGate::new();
        assert!(gate.try_start(false));
        assert!(!gate.try_start(false));
        assert!(!gate.finish());
        assert!(gate.try_start(false));
    }

    #[test]
    fn test_abort_forgets_queue() {
        let gate = RunGate::new();
        assert!(gate.try_start(true));
        assert!(!gate.try_start(true));
        gate.abort();
        assert!(!gate.is_running());
        assert!(gate.try_start(false));
        assert!(!gate.finish());
    }

    #[tokio::test]
    async fn test_idle_waits_for_finish() {
        let gate = Arc::new(RunGate::new());
        assert!(gate.try_start(false));

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.idle().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.finish();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
