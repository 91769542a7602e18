//! Firmware update state tracking.

use tracing::{info, warn};

use crate::events::UpdatePhase;

impl UpdatePhase {
    /// Whether the update may move from `self` to `next`.
    ///
    /// Any phase may fail into `Error`; `Error` only leads back to `Idle`.
    pub fn can_transition_to(self, next: UpdatePhase) -> bool {
        use UpdatePhase::*;
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, Idle)
                | (Validating, EnterBootloader)
                | (EnterBootloader, Erasing)
                | (Erasing, Programming)
                | (Programming, Resetting)
                | (EnterBootloader, Resetting)
                | (Erasing, Resetting)
                | (Resetting, Idle)
                | (Error, Idle)
        ) || (next == Error && self != Error)
    }
}

/// Runtime state of one firmware update.
#[derive(Debug)]
pub struct UpdateSession {
    /// Current phase.
    pub phase: UpdatePhase,
    /// Line speed to restore once the bootloader is done.
    pub saved_baud: Option<u32>,
    /// Blocks written so far.
    pub block: usize,
    /// Data records in the image.
    pub total_blocks: usize,
    /// The enter-bootloader request has gone out.
    pub bootloader_entered: bool,
}

impl Default for UpdateSession {
    fn default() -> Self {
        Self {
            phase: UpdatePhase::Idle,
            saved_baud: None,
            block: 0,
            total_blocks: 0,
            bootloader_entered: false,
        }
    }
}

impl UpdateSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to `to`, returning the phase left behind.
    pub fn goto_phase(&mut self, to: UpdatePhase) -> UpdatePhase {
        let from = self.phase;
        if !from.can_transition_to(to) {
            warn!(from = %from, to = %to, "Unexpected phase transition");
        }
        info!(from = %from, to = %to, "Phase transition");
        self.phase = to;
        from
    }

    /// Count one more block as written.
    pub fn advance_block(&mut self) {
        self.block += 1;
    }

    /// Forget everything but the phase, ready for the next update.
    pub fn reset(&mut self) {
        self.saved_baud = None;
        self.block = 0;
        self.total_blocks = 0;
        self.bootloader_entered = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use UpdatePhase::*;
        let path = [
            Idle,
            Validating,
            EnterBootloader,
            Erasing,
            Programming,
            Resetting,
            Idle,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_error_edges() {
        use UpdatePhase::*;
        assert!(Programming.can_transition_to(Error));
        assert!(Validating.can_transition_to(Error));
        assert!(Error.can_transition_to(Idle));
        assert!(!Error.can_transition_to(Error));
        assert!(!Error.can_transition_to(Programming));
        assert!(!Idle.can_transition_to(Programming));
    }

    #[test]
    fn test_goto_phase_returns_previous() {
        let mut session = UpdateSession::new();
        assert_eq!(session.goto_phase(UpdatePhase::Validating), UpdatePhase::Idle);
        assert_eq!(session.phase, UpdatePhase::Validating);
    }

    #[test]
    fn test_block_counter_and_reset() {
        let mut session = UpdateSession::new();
        session.total_blocks = 4;
        session.bootloader_entered = true;
        session.advance_block();
        assert_eq!(session.block, 1);
        session.reset();
        assert!(!session.bootloader_entered);
        assert_eq!(session.block, 0);
        assert_eq!(session.total_blocks, 0);
    }
}
