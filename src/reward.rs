//! Reward computation: a pure, deterministic function of
//! `(old_state, new_state, execution_result)`.
//!
//! Grounded on `original_source/core/lats/reward.py`, which this follows
//! weight-for-weight; `spec.md` §4.2 pins the same defaults.

use crate::state::{ExecutionResult, TestState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RewardConfig {
    pub coverage_weight: f64,
    pub compile_reward: f64,
    pub compile_penalty: f64,
    pub condition_weight: f64,
    pub suite_size_penalty: f64,
    pub early_bonus: f64,
    pub clip_min: f64,
    pub clip_max: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            coverage_weight: 10.0,
            compile_reward: 2.0,
            compile_penalty: -1.0,
            condition_weight: 0.5,
            suite_size_penalty: -0.1,
            early_bonus: 3.0,
            clip_min: -5.0,
            clip_max: 15.0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RewardFunction {
    pub config: RewardConfig,
}

impl RewardFunction {
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    /// Weighted sum of coverage delta, compile bonus/penalty, condition
    /// delta, suite-size penalty, and an early bonus — clipped to
    /// `[clip_min, clip_max]`.
    pub fn compute(&self, old: &TestState, new: &TestState, result: &ExecutionResult) -> f64 {
        let c = &self.config;
        let coverage_delta = new.current_coverage - old.current_coverage;
        let mut reward = c.coverage_weight * coverage_delta;

        reward += if result.compiled {
            c.compile_reward
        } else {
            c.compile_penalty
        };

        let condition_delta =
            old.uncovered_conditions.len() as f64 - new.uncovered_conditions.len() as f64;
        reward += c.condition_weight * condition_delta;

        reward += c.suite_size_penalty * new.suite_names.len() as f64;

        let parent_was_empty = old.suite_names.is_empty();
        if parent_was_empty && result.compiled && coverage_delta > 0.0 {
            reward += c.early_bonus;
        }

        reward.clamp(c.clip_min, c.clip_max)
    }

    /// Reserved for the final best-node summary; never backpropagated.
    pub fn terminal_bonus(&self, state: &TestState) -> f64 {
        if state.current_coverage >= state.coverage_target {
            5.0 + 10.0 * (state.current_coverage - state.coverage_target)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(coverage: f64, suite: Vec<&str>, uncovered: usize) -> TestState {
        let mut s = TestState::new_root("fn f()", "f.rs::f", "", 0.95, vec![], vec![]);
        s.current_coverage = coverage;
        s.suite_names = suite.into_iter().map(String::from).collect();
        s.uncovered_conditions = (0..uncovered)
            .map(|i| crate::state::ConditionInfo::new(format!("c{i}"), true, true))
            .collect();
        s
    }

    fn result(compiled: bool, suite_len: usize) -> ExecutionResult {
        ExecutionResult {
            new_test_name: "test_001".into(),
            compiled,
            error: if compiled { None } else { Some("boom".into()) },
            suite_names: (0..suite_len).map(|i| format!("t{i}")).collect(),
            statement_coverage: 0.0,
            branch_coverage: 0.0,
            mcdc_coverage: 0.0,
            conditions_now_covered: vec![],
        }
    }

    #[test]
    fn reward_is_always_clipped() {
        let rf = RewardFunction::default();
        let old = state(0.0, vec![], 0);
        let new = state(1.0, vec!["a"; 200], 0);
        let r = rf.compute(&old, &new, &result(true, 200));
        assert!(r >= -5.0 && r <= 15.0);
    }

    #[test]
    fn early_bonus_applies_only_when_parent_suite_empty_and_progress_made() {
        let rf = RewardFunction::default();
        let old_empty = state(0.0, vec![], 2);
        let new_improved = state(0.3, vec!["t0"], 1);
        let with_bonus = rf.compute(&old_empty, &new_improved, &result(true, 1));

        let old_nonempty = state(0.2, vec!["t0"], 2);
        let new_improved2 = state(0.3, vec!["t0", "t1"], 1);
        let without_bonus = rf.compute(&old_nonempty, &new_improved2, &result(true, 2));

        assert!(with_bonus > without_bonus - 0.01);
    }

    #[test]
    fn compile_failure_penalizes() {
        let rf = RewardFunction::default();
        let old = state(0.2, vec!["t0"], 2);
        let failed = result(false, 1);
        let new = state(0.2, vec!["t0"], 2);
        let r = rf.compute(&old, &new, &failed);
        assert!(r < 0.0);
    }

    #[test]
    fn terminal_bonus_is_zero_below_target() {
        let rf = RewardFunction::default();
        let mut s = state(0.5, vec![], 3);
        s.coverage_target = 0.95;
        assert_eq!(rf.terminal_bonus(&s), 0.0);
    }

    #[test]
    fn terminal_bonus_scales_with_overshoot() {
        let rf = RewardFunction::default();
        let mut s = state(1.0, vec![], 0);
        s.coverage_target = 0.95;
        let bonus = rf.terminal_bonus(&s);
        assert!((bonus - (5.0 + 10.0 * 0.05)).abs() < 1e-9);
    }
}
