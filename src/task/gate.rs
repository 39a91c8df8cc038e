#![forbid(unsafe_code)]

use crate::task::state::{Phase, TaskRunState};

/// Unlock policy. Sequential mode opens tasks one at a time in catalog
/// order; `unlock_all` opens everything up front and never gates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateController {
    unlock_all: bool,
}

impl GateController {
    #[must_use]
    pub fn new(unlock_all: bool) -> Self {
        Self { unlock_all }
    }

    #[must_use]
    pub fn unlock_all(self) -> bool {
        self.unlock_all
    }

    #[must_use]
    pub fn initial_phase(self, index: usize) -> Phase {
        if self.unlock_all || index == 0 {
            Phase::Ready
        } else {
            Phase::Locked
        }
    }

    #[must_use]
    pub fn initial_states(self, len: usize) -> Vec<TaskRunState> {
        (0..len)
            .map(|i| TaskRunState::new(self.initial_phase(i)))
            .collect()
    }

    /// Applies a terminal outcome of task `index`. Returns the index of the
    /// task that was unlocked, if any. Unlocks are never undone.
    pub fn on_completion(
        self,
        states: &mut [TaskRunState],
        index: usize,
        success: bool,
    ) -> Option<usize> {
        if !success || self.unlock_all {
            return None;
        }
        let next = index.checked_add(1)?;
        let st = states.get_mut(next)?;
        st.unlock().then_some(next)
    }
}
