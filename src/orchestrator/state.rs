//! Pass state machine for one compilation plan entry
//!
//! `Init → Pass(1) → … → Pass(n) → {Converged | Aborted}`. The machine only
//! counts passes and validates transitions; deciding *why* to move is the
//! driver's job.

use serde::{Deserialize, Serialize};

/// Check if a state is terminal (no further transitions possible)
pub trait TerminalState {
    fn is_terminal(&self) -> bool;
}

/// Why a plan stopped without converging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// An engine or auxiliary processor failed outright
    ToolHardFailure,
    /// The engine still asked for another pass after the last allowed one
    PassBudgetExhausted,
    /// The same auxiliary processor was requested on two consecutive passes
    AuxNotConverging,
    /// Cancelled by a signal or the submission budget
    Cancelled,
}

impl AbortReason {
    /// Whether output produced so far may still be delivered.
    pub fn is_soft(&self) -> bool {
        !matches!(self, AbortReason::ToolHardFailure)
    }
}

/// Pass state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PassState {
    Init,
    Pass { n: u32 },
    Converged { passes: u32 },
    Aborted { reason: AbortReason, passes: u32 },
}

impl TerminalState for PassState {
    fn is_terminal(&self) -> bool {
        matches!(self, PassState::Converged { .. } | PassState::Aborted { .. })
    }
}

impl PassState {
    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: PassState) -> bool {
        match (self, target) {
            (PassState::Init, PassState::Pass { n: 1 }) => true,
            // Cancellation or setup failure before any pass ran
            (PassState::Init, PassState::Aborted { passes: 0, .. }) => true,

            (PassState::Pass { n }, PassState::Pass { n: next }) => next == n + 1,
            (PassState::Pass { n }, PassState::Converged { passes }) => passes == *n,
            (PassState::Pass { n }, PassState::Aborted { passes, .. }) => passes == *n,

            _ => false,
        }
    }

    /// Number of engine passes started so far.
    pub fn passes(&self) -> u32 {
        match self {
            PassState::Init => 0,
            PassState::Pass { n } => *n,
            PassState::Converged { passes } | PassState::Aborted { passes, .. } => *passes,
        }
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            PassState::Aborted { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PassStateError {
    #[error("Invalid pass transition from {from:?} to {to:?}")]
    InvalidTransition { from: PassState, to: PassState },

    #[error("Plan is in terminal state {0:?}")]
    TerminalState(PassState),
}

/// Drives [`PassState`] for one entry, bounded by `max_passes`.
#[derive(Debug, Clone)]
pub struct PassMachine {
    state: PassState,
    max_passes: u32,
    history: Vec<PassState>,
}

impl PassMachine {
    pub fn new(max_passes: u32) -> Self {
        Self {
            state: PassState::Init,
            max_passes: max_passes.max(1),
            history: vec![PassState::Init],
        }
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    pub fn max_passes(&self) -> u32 {
        self.max_passes
    }

    /// Every state visited, oldest first.
    pub fn history(&self) -> &[PassState] {
        &self.history
    }

    /// Whether another pass may still be started.
    pub fn has_budget(&self) -> bool {
        self.state.passes() < self.max_passes
    }

    /// Moves to the next pass, or to `Aborted(PassBudgetExhausted)` when the
    /// budget is spent. Returns the resulting state.
    pub fn next_pass(&mut self) -> Result<PassState, PassStateError> {
        let passes = self.state.passes();
        if passes >= self.max_passes {
            return self.transition(PassState::Aborted {
                reason: AbortReason::PassBudgetExhausted,
                passes,
            });
        }
        self.transition(PassState::Pass { n: passes + 1 })
    }

    pub fn converge(&mut self) -> Result<PassState, PassStateError> {
        let passes = self.state.passes();
        self.transition(PassState::Converged { passes })
    }

    pub fn abort(&mut self, reason: AbortReason) -> Result<PassState, PassStateError> {
        let passes = self.state.passes();
        self.transition(PassState::Aborted { reason, passes })
    }

    fn transition(&mut self, target: PassState) -> Result<PassState, PassStateError> {
        if self.state.is_terminal() {
            return Err(PassStateError::TerminalState(self.state));
        }
        if !self.state.can_transition_to(target) {
            return Err(PassStateError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        self.history.push(target);
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!PassState::Init.is_terminal());
        assert!(!PassState::Pass { n: 2 }.is_terminal());
        assert!(PassState::Converged { passes: 2 }.is_terminal());
        assert!(PassState::Aborted {
            reason: AbortReason::Cancelled,
            passes: 0
        }
        .is_terminal());
    }

    #[test]
    fn test_valid_transitions() {
        assert!(PassState::Init.can_transition_to(PassState::Pass { n: 1 }));
        assert!(PassState::Pass { n: 1 }.can_transition_to(PassState::Pass { n: 2 }));
        assert!(PassState::Pass { n: 3 }.can_transition_to(PassState::Converged { passes: 3 }));
        assert!(!PassState::Init.can_transition_to(PassState::Converged { passes: 0 }));
        assert!(!PassState::Pass { n: 1 }.can_transition_to(PassState::Pass { n: 3 }));
        assert!(!PassState::Converged { passes: 1 }.can_transition_to(PassState::Pass { n: 2 }));
    }

    #[test]
    fn test_machine_converges() {
        let mut m = PassMachine::new(5);
        m.next_pass().unwrap();
        m.next_pass().unwrap();
        assert_eq!(m.converge().unwrap(), PassState::Converged { passes: 2 });
        assert_eq!(m.history().len(), 4);
        assert!(matches!(m.next_pass(), Err(PassStateError::TerminalState(_))));
    }

    #[test]
    fn test_machine_exhausts_budget_at_exactly_max() {
        let mut m = PassMachine::new(5);
        for n in 1..=5 {
            assert_eq!(m.next_pass().unwrap(), PassState::Pass { n });
        }
        assert!(!m.has_budget());
        assert_eq!(
            m.next_pass().unwrap(),
            PassState::Aborted {
                reason: AbortReason::PassBudgetExhausted,
                passes: 5
            }
        );
    }

    #[test]
    fn test_abort_before_first_pass() {
        let mut m = PassMachine::new(5);
        let state = m.abort(AbortReason::Cancelled).unwrap();
        assert_eq!(state.passes(), 0);
        assert_eq!(state.abort_reason(), Some(AbortReason::Cancelled));
    }

    #[test]
    fn test_zero_budget_is_clamped() {
        assert_eq!(PassMachine::new(0).max_passes(), 1);
    }

    #[test]
    fn test_soft_reasons() {
        assert!(AbortReason::PassBudgetExhausted.is_soft());
        assert!(!AbortReason::ToolHardFailure.is_soft());
    }
}
