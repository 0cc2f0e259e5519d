//! Input-change scheduling
//!
//! Advisory state for hosts that re-run a workflow whenever its inputs
//! change. Performs no I/O: the host feeds signatures in and acts on the
//! returned [`Action`].

pub mod signature;

pub use signature::{compute_signature, fragment, Signature, SEQUENCE_SAMPLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Inputs unchanged
    None,
    Start,
    /// Run in flight; start again once it finishes
    QueueRerun,
    /// Run in flight; cancel it and start again
    CancelAndRestart,
}

#[derive(Debug, Clone, Default)]
pub struct OnInputChangeScheduler {
    last_signature: Signature,
    rerun_requested: bool,
}

impl OnInputChangeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_signature(&self) -> &Signature {
        &self.last_signature
    }

    pub fn rerun_requested(&self) -> bool {
        self.rerun_requested
    }

    /// Re-seed with a known signature (or none) and clear the rerun flag
    pub fn reset(&mut self, signature: Option<Signature>) {
        self.last_signature = signature.unwrap_or_default();
        self.rerun_requested = false;
    }

    pub fn notify_inputs(
        &mut self,
        signature: Signature,
        is_running: bool,
        restart_on_change: bool,
    ) -> Action {
        if signature == self.last_signature {
            return Action::None;
        }
        self.last_signature = signature;

        if !is_running {
            self.rerun_requested = false;
            return Action::Start;
        }

        self.rerun_requested = true;
        if restart_on_change {
            Action::CancelAndRestart
        } else {
            Action::QueueRerun
        }
    }

    /// Return and clear the rerun flag
    pub fn consume_rerun_requested(&mut self) -> bool {
        std::mem::take(&mut self.rerun_requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_signature_starts() {
        let mut scheduler = OnInputChangeScheduler::new();
        assert_eq!(scheduler.notify_inputs("a".into(), false, false), Action::Start);
        assert_eq!(scheduler.notify_inputs("a".into(), false, false), Action::None);
        assert!(!scheduler.consume_rerun_requested());
    }

    #[test]
    fn test_change_while_running_queues_or_restarts() {
        let mut scheduler = OnInputChangeScheduler::new();
        scheduler.notify_inputs("a".into(), false, false);

        assert_eq!(scheduler.notify_inputs("b".into(), true, false), Action::QueueRerun);
        assert!(scheduler.rerun_requested());
        assert_eq!(
            scheduler.notify_inputs("c".into(), true, true),
            Action::CancelAndRestart
        );
        assert!(scheduler.consume_rerun_requested());
        assert!(!scheduler.consume_rerun_requested());
    }

    #[test]
    fn test_repeat_while_running_keeps_flag() {
        let mut scheduler = OnInputChangeScheduler::new();
        scheduler.notify_inputs("a".into(), false, false);
        assert_eq!(scheduler.notify_inputs("b".into(), true, false), Action::QueueRerun);
        assert_eq!(scheduler.notify_inputs("b".into(), true, false), Action::None);
        assert!(scheduler.rerun_requested());

        scheduler.consume_rerun_requested();
        assert_eq!(scheduler.notify_inputs("b".into(), true, true), Action::None);
        assert!(!scheduler.rerun_requested());
    }

    #[test]
    fn test_start_clears_pending_rerun() {
        let mut scheduler = OnInputChangeScheduler::new();
        scheduler.notify_inputs("a".into(), true, false);
        assert!(scheduler.rerun_requested());
        assert_eq!(scheduler.notify_inputs("b".into(), false, false), Action::Start);
        assert!(!scheduler.rerun_requested());
    }

    #[test]
    fn test_reset() {
        let mut scheduler = OnInputChangeScheduler::new();
        scheduler.notify_inputs("a".into(), true, false);
        scheduler.reset(Some("a".into()));
        assert!(!scheduler.rerun_requested());
        assert_eq!(scheduler.notify_inputs("a".into(), false, false), Action::None);

        scheduler.reset(None);
        assert!(scheduler.last_signature().is_empty());
        assert_eq!(scheduler.notify_inputs("a".into(), false, false), Action::Start);
    }
}
