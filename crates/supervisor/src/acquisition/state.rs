//! Acquisition state machine

use std::fmt;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquisitionState {
    Idle,
    Searching,
    Binding,
    Verifying,
    /// Verified binding; the only state in which data may be announced
    Active,
    /// Terminal for this attempt
    Failed,
}

impl AcquisitionState {
    /// Legal forward transitions. Each attempt only moves forward, so no
    /// state can be visited twice.
    pub fn can_transition_to(self, next: AcquisitionState) -> bool {
        use AcquisitionState::*;
        matches!(
            (self, next),
            (Idle, Searching)
                | (Idle, Failed)
                | (Searching, Binding)
                | (Searching, Failed)
                | (Binding, Verifying)
                | (Binding, Failed)
                | (Verifying, Active)
                | (Verifying, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AcquisitionState::Active | AcquisitionState::Failed)
    }
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionState::Idle => write!(f, "Idle"),
            AcquisitionState::Searching => write!(f, "Searching"),
            AcquisitionState::Binding => write!(f, "Binding"),
            AcquisitionState::Verifying => write!(f, "Verifying"),
            AcquisitionState::Active => write!(f, "Active"),
            AcquisitionState::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("illegal acquisition transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: AcquisitionState,
    pub to: AcquisitionState,
}

/// State of a single acquisition attempt, with its full history
#[derive(Debug, Clone)]
pub struct AttemptTracker {
    attempt: u32,
    history: Vec<AcquisitionState>,
}

impl AttemptTracker {
    pub fn new(attempt: u32) -> Self {
        Self {
            attempt,
            history: vec![AcquisitionState::Idle],
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn state(&self) -> AcquisitionState {
        self.history
            .last()
            .copied()
            .unwrap_or(AcquisitionState::Idle)
    }

    pub fn history(&self) -> &[AcquisitionState] {
        &self.history
    }

    pub fn advance(&mut self, next: AcquisitionState) -> Result<(), InvalidTransition> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(InvalidTransition {
                from: current,
                to: next,
            });
        }
        info!("Attempt {}: {} -> {}", self.attempt, current, next);
        self.history.push(next);
        Ok(())
    }

    /// Move to `Failed` unless the attempt already ended
    pub fn fail(&mut self) {
        if !self.state().is_terminal() {
            self.history.push(AcquisitionState::Failed);
            info!("Attempt {}: -> Failed", self.attempt);
        }
    }

    pub fn into_history(self) -> Vec<AcquisitionState> {
        self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AcquisitionState::*;

    #[test]
    fn test_happy_path() {
        let mut tracker = AttemptTracker::new(1);
        for next in [Searching, Binding, Verifying, Active] {
            tracker.advance(next).unwrap();
        }
        assert_eq!(tracker.history(), &[Idle, Searching, Binding, Verifying, Active]);
        assert!(tracker.state().is_terminal());
    }

    #[test]
    fn test_rejects_skips_and_reversals() {
        let mut tracker = AttemptTracker::new(1);
        assert!(tracker.advance(Binding).is_err());
        tracker.advance(Searching).unwrap();
        assert!(tracker.advance(Searching).is_err());
        assert!(tracker.advance(Active).is_err());
        tracker.advance(Failed).unwrap();
        assert_eq!(
            tracker.advance(Searching),
            Err(InvalidTransition {
                from: Failed,
                to: Searching
            })
        );
    }

    #[test]
    fn test_fail_is_idempotent() {
        let mut tracker = AttemptTracker::new(2);
        tracker.advance(Searching).unwrap();
        tracker.advance(Binding).unwrap();
        tracker.fail();
        tracker.fail();
        assert_eq!(tracker.history(), &[Idle, Searching, Binding, Failed]);
    }

    #[test]
    fn test_active_is_never_failed() {
        let mut tracker = AttemptTracker::new(1);
        for next in [Searching, Binding, Verifying, Active] {
            tracker.advance(next).unwrap();
        }
        tracker.fail();
        assert_eq!(tracker.state(), Active);
    }

    #[test]
    fn test_terminal_states_have_no_successors() {
        let all = [Idle, Searching, Binding, Verifying, Active, Failed];
        for next in all {
            assert!(!Active.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }
}
