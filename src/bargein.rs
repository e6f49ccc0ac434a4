//! Debounced barge-in handling.
//!
//! Cancelling the assistant the instant VAD fires loses whole sentences to
//! microphone noise and tail coughs.  Instead, `speech_started` arms a
//! debounce timer that `speech_stopped` can cancel; only an uninterrupted
//! run of speech confirms the barge-in.  Two guards apply before the timer
//! is even armed: the greeting phase is never interruptible, and an
//! utterance with little audio left is allowed to finish.
//!
//! The controller is a pure decision core; the orchestrator owns the actual
//! timer and reports expiry back with the generation it was armed with, so a
//! stale timer that raced its own cancellation is ignored.

use crate::call::Phase;

#[derive(Debug, PartialEq, Eq)]
pub enum BargeDecision {
    /// Do nothing; reason is the log marker.
    Ignore(&'static str),
    /// Arm (or re-arm) the debounce timer for this generation.
    Debounce { generation: u64, delay_ms: u64 },
    /// `smart_cancel` is off: interrupt immediately.
    ConfirmNow,
}

#[derive(Debug)]
pub struct BargeInController {
    debounce_ms: u64,
    min_remain_ms: u64,
    smart_cancel: bool,
    pending: bool,
    generation: u64,
}

impl BargeInController {
    pub fn new(debounce_ms: u64, min_remain_ms: u64, smart_cancel: bool) -> Self {
        Self {
            debounce_ms,
            min_remain_ms,
            smart_cancel,
            pending: false,
            generation: 0,
        }
    }

    pub fn on_speech_started(&mut self, phase: Phase, remaining_ms: u64) -> BargeDecision {
        if phase == Phase::Greeting {
            return BargeDecision::Ignore("greeting_phase");
        }
        if remaining_ms < self.min_remain_ms {
            return BargeDecision::Ignore("audio_almost_finished");
        }
        if !self.smart_cancel {
            self.pending = false;
            return BargeDecision::ConfirmNow;
        }
        self.pending = true;
        self.generation += 1;
        BargeDecision::Debounce {
            generation: self.generation,
            delay_ms: self.debounce_ms,
        }
    }

    /// Returns true when a pending debounce was cancelled.
    pub fn on_speech_stopped(&mut self) -> bool {
        if self.pending {
            self.pending = false;
            self.generation += 1;
            true
        } else {
            false
        }
    }

    /// Timer expiry for `generation`.  Returns true when this confirms a
    /// barge-in; stale generations (cancelled or re-armed since) are ignored.
    pub fn on_timer_fired(&mut self, generation: u64) -> bool {
        if self.pending && generation == self.generation {
            self.pending = false;
            true
        } else {
            false
        }
    }

    pub fn pending(&self) -> bool {
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BargeInController {
        BargeInController::new(1_000, 2_000, true)
    }

    #[test]
    fn greeting_phase_is_never_interruptible() {
        let mut c = controller();
        assert_eq!(
            c.on_speech_started(Phase::Greeting, 10_000),
            BargeDecision::Ignore("greeting_phase")
        );
        assert!(!c.pending());
    }

    #[test]
    fn nearly_finished_audio_is_left_alone() {
        let mut c = controller();
        // sent 4000, played 2500 -> 1500 remaining, under the 2000 guard
        assert_eq!(
            c.on_speech_started(Phase::Normal, 1_500),
            BargeDecision::Ignore("audio_almost_finished")
        );
    }

    #[test]
    fn speech_stopped_within_debounce_cancels() {
        let mut c = controller();
        let decision = c.on_speech_started(Phase::Normal, 2_000);
        let generation = match decision {
            BargeDecision::Debounce { generation, delay_ms } => {
                assert_eq!(delay_ms, 1_000);
                generation
            }
            other => panic!("unexpected decision {other:?}"),
        };
        assert!(c.on_speech_stopped());
        // the stale timer fire must not confirm
        assert!(!c.on_timer_fired(generation));
    }

    #[test]
    fn uninterrupted_speech_confirms_on_expiry() {
        let mut c = controller();
        let generation = match c.on_speech_started(Phase::Normal, 5_000) {
            BargeDecision::Debounce { generation, .. } => generation,
            other => panic!("unexpected decision {other:?}"),
        };
        assert!(c.on_timer_fired(generation));
        // a second fire of the same generation is inert
        assert!(!c.on_timer_fired(generation));
    }

    #[test]
    fn restart_invalidates_the_earlier_timer() {
        let mut c = controller();
        let first = match c.on_speech_started(Phase::Normal, 5_000) {
            BargeDecision::Debounce { generation, .. } => generation,
            other => panic!("unexpected decision {other:?}"),
        };
        let second = match c.on_speech_started(Phase::Normal, 5_000) {
            BargeDecision::Debounce { generation, .. } => generation,
            other => panic!("unexpected decision {other:?}"),
        };
        assert_ne!(first, second);
        assert!(!c.on_timer_fired(first));
        assert!(c.on_timer_fired(second));
    }

    #[test]
    fn dumb_cancel_mode_confirms_immediately() {
        let mut c = BargeInController::new(1_000, 2_000, false);
        assert_eq!(
            c.on_speech_started(Phase::Normal, 5_000),
            BargeDecision::ConfirmNow
        );
        // greeting gate still applies
        assert_eq!(
            c.on_speech_started(Phase::Greeting, 5_000),
            BargeDecision::Ignore("greeting_phase")
        );
    }
}
