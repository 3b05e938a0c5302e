//! Node state: the immutable-per-node snapshot of a suite's coverage.
//!
//! `TestState` is what a `TreeNode` wraps. It carries both the context fixed
//! at the root (function signature/path/context, coverage target) and the
//! fields that evolve one execution at a time (suite names, coverage,
//! residual conditions, error log, learned rules).

use std::collections::HashMap;
use serde::{Deserialize, Serialize};

/// An obligation to cover a Boolean sub-expression under MC/DC.
///
/// Equality and hashing are over all four fields, including
/// `parent_decision` — this is a deliberate deviation from some prior
/// implementations that hash only `(expression, need_true, need_false)`;
/// see `DESIGN.md`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConditionInfo {
    pub expression: String,
    pub need_true: bool,
    pub need_false: bool,
    pub parent_decision: Option<String>,
}

impl ConditionInfo {
    pub fn new(expression: impl Into<String>, need_true: bool, need_false: bool) -> Self {
        Self {
            expression: expression.into(),
            need_true,
            need_false,
            parent_decision: None,
        }
    }

    pub fn with_parent_decision(mut self, parent_decision: impl Into<String>) -> Self {
        self.parent_decision = Some(parent_decision.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoverageKind {
    Statement,
    Branch,
    Mcdc,
}

/// Per-kind coverage ratios, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CoverageBreakdown {
    pub statement: f64,
    pub branch: f64,
    pub mcdc: f64,
}

impl Default for CoverageBreakdown {
    fn default() -> Self {
        Self {
            statement: 0.0,
            branch: 0.0,
            mcdc: 0.0,
        }
    }
}

/// The outcome of submitting one candidate test to the coverage executor.
///
/// Coverage values are cumulative over the whole suite, never per-test. If
/// `compiled` is false, `suite_names` MUST equal the pre-call suite — the
/// failed test is never appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub new_test_name: String,
    pub compiled: bool,
    pub error: Option<String>,
    pub suite_names: Vec<String>,
    pub statement_coverage: f64,
    pub branch_coverage: f64,
    pub mcdc_coverage: f64,
    pub conditions_now_covered: Vec<ConditionInfo>,
}

impl ExecutionResult {
    pub fn failed(reason: impl Into<String>, suite_names: Vec<String>, new_test_name: impl Into<String>) -> Self {
        Self {
            new_test_name: new_test_name.into(),
            compiled: false,
            error: Some(reason.into()),
            suite_names,
            statement_coverage: 0.0,
            branch_coverage: 0.0,
            mcdc_coverage: 0.0,
            conditions_now_covered: Vec::new(),
        }
    }
}

/// A node's snapshot: immutable context fields copied unchanged from the
/// root, plus fields that evolve with each accepted test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestState {
    // Immutable context, set once at root and copied into every descendant.
    pub function_signature: String,
    pub function_path: String,
    pub context: String,
    pub coverage_target: f64,

    // Evolving fields.
    pub suite_names: Vec<String>,
    pub current_coverage: f64,
    pub coverage_breakdown: CoverageBreakdown,
    pub uncovered_conditions: Vec<ConditionInfo>,
    pub execution_errors: Vec<String>,
    pub learned_rules: Vec<String>,
}

impl TestState {
    pub fn new_root(
        function_signature: impl Into<String>,
        function_path: impl Into<String>,
        context: impl Into<String>,
        coverage_target: f64,
        uncovered_conditions: Vec<ConditionInfo>,
        learned_rules: Vec<String>,
    ) -> Self {
        Self {
            function_signature: function_signature.into(),
            function_path: function_path.into(),
            context: context.into(),
            coverage_target,
            suite_names: Vec::new(),
            current_coverage: 0.0,
            coverage_breakdown: CoverageBreakdown::default(),
            uncovered_conditions,
            execution_errors: Vec::new(),
            learned_rules,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current_coverage >= self.coverage_target || self.uncovered_conditions.is_empty()
    }

    pub fn suite_size(&self) -> usize {
        self.suite_names.len()
    }

    pub fn coverage_progress(&self) -> f64 {
        if self.coverage_target <= 0.0 {
            1.0
        } else {
            (self.current_coverage / self.coverage_target).min(1.0)
        }
    }

    /// Construct a child state from this (parent) state and the
    /// `ExecutionResult` of the candidate that produced the child. This is
    /// the single, explicit realization of `spec.md` §3's `clone_with` rule.
    pub fn clone_with(&self, result: &ExecutionResult) -> Self {
        let mut uncovered = self.uncovered_conditions.clone();
        if !result.conditions_now_covered.is_empty() {
            let covered: std::collections::HashSet<&ConditionInfo> =
                result.conditions_now_covered.iter().collect();
            uncovered.retain(|c| !covered.contains(c));
        }

        let mut errors = self.execution_errors.clone();
        if !result.compiled {
            if let Some(err) = &result.error {
                errors.push(err.clone());
            }
        }

        Self {
            function_signature: self.function_signature.clone(),
            function_path: self.function_path.clone(),
            context: self.context.clone(),
            coverage_target: self.coverage_target,
            suite_names: result.suite_names.clone(),
            current_coverage: result.mcdc_coverage,
            coverage_breakdown: CoverageBreakdown {
                statement: result.statement_coverage,
                branch: result.branch_coverage,
                mcdc: result.mcdc_coverage,
            },
            uncovered_conditions: uncovered,
            execution_errors: errors,
            // Children may diverge from here on; never alias the parent's list.
            learned_rules: self.learned_rules.clone(),
        }
    }

    pub fn add_learned_rule(&mut self, rule: impl Into<String>) {
        let rule = rule.into();
        if !rule.is_empty() && !self.learned_rules.contains(&rule) {
            self.learned_rules.push(rule);
        }
    }
}

/// Convenience alias used by prompt rendering to summarize coverage by kind.
pub fn coverage_by_kind(breakdown: &CoverageBreakdown) -> HashMap<&'static str, f64> {
    let mut map = HashMap::new();
    map.insert("statement", breakdown.statement);
    map.insert("branch", breakdown.branch);
    map.insert("mcdc", breakdown.mcdc);
    map
}
