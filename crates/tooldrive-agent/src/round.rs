//! Per-turn round bookkeeping.

use tooldrive_tools::gateway::ToolResultCache;

/// Consecutive reuse-only rounds that end a run.
pub const MAX_REUSE_ONLY_ROUNDS: u32 = 3;

#[derive(Debug, Default)]
pub struct RoundState {
    pub round: u32,
    pub cache: ToolResultCache,
    reuse_only_rounds: u32,
}

impl RoundState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the next round and return its 1-based number.
    pub fn begin(&mut self) -> u32 {
        self.round += 1;
        self.round
    }

    /// Close a tool round. Returns true when the run should stop because
    /// no tool actually ran for [`MAX_REUSE_ONLY_ROUNDS`] rounds in a row.
    pub fn finish(&mut self, executed_fresh: bool) -> bool {
        if executed_fresh {
            self.reuse_only_rounds = 0;
            return false;
        }
        self.reuse_only_rounds += 1;
        self.reuse_only_rounds >= MAX_REUSE_ONLY_ROUNDS
    }

    pub fn reuse_only_rounds(&self) -> u32 {
        self.reuse_only_rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_counter_resets_on_fresh_round() {
        let mut state = RoundState::new();
        assert!(!state.finish(false));
        assert!(!state.finish(false));
        assert!(!state.finish(true));
        assert_eq!(state.reuse_only_rounds(), 0);
        assert!(!state.finish(false));
        assert!(!state.finish(false));
        assert!(state.finish(false));
    }

    #[test]
    fn test_begin_counts_rounds() {
        let mut state = RoundState::new();
        assert_eq!(state.begin(), 1);
        assert_eq!(state.begin(), 2);
        assert_eq!(state.round, 2);
    }
}
