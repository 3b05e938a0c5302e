//! The MCTS controller: orchestrates selection, expansion+simulation,
//! backpropagation, best-node tracking, and termination.
//!
//! Grounded on `original_source/core/lats/mcts_controller.py` for the exact
//! algorithm, and on the teacher's `engine.rs::search()` for the async loop
//! shape (cache-check style state machine, `should_continue` gate).
//! This is the largest module in the crate, matching `spec.md` §2's ~40%
//! share of core.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::executor::Executor;
use crate::llm::{extract_json, LmClient};
use crate::prompt::PromptManager;
use crate::reward::RewardFunction;
use crate::session::SessionContext;
use crate::state::{ConditionInfo, TestState};
use crate::tree::{ActionKind, NodeId, Tree};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MCTSConfig {
    pub max_iterations: u32,
    pub exploration_coef: f64,
    pub max_depth: u32,
    pub expansion_k: usize,
    pub min_k: usize,
    pub max_k: usize,
    pub adaptive_k: bool,
    pub enable_pruning: bool,
    pub prune_threshold: f64,
    pub beam_width: usize,
    pub coverage_target: f64,
    pub max_no_progress_iters: u32,
    pub verbose: bool,
    pub default_max_tokens: u32,
}

impl Default for MCTSConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            exploration_coef: std::f64::consts::SQRT_2,
            max_depth: 50,
            expansion_k: 3,
            min_k: 1,
            max_k: 5,
            adaptive_k: true,
            enable_pruning: true,
            prune_threshold: -2.0,
            beam_width: 5,
            coverage_target: 0.95,
            max_no_progress_iters: 10,
            verbose: false,
            default_max_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchStats {
    pub iterations: u32,
    pub nodes_created: usize,
    pub no_progress_count: u32,
}

/// What the search loop returns: the tree itself (for inspection/tests) and
/// the id of the best node found.
pub struct SearchOutcome {
    pub tree: Tree,
    pub best_node: NodeId,
    pub stats: SearchStats,
}

pub struct MCTSController {
    config: MCTSConfig,
    reward_fn: RewardFunction,
    executor: Arc<dyn Executor>,
    llm: Arc<dyn LmClient>,
    prompt_manager: Arc<PromptManager>,
}

struct Candidate {
    name: String,
    code: String,
}

impl MCTSController {
    pub fn new(
        config: MCTSConfig,
        reward_fn: RewardFunction,
        executor: Arc<dyn Executor>,
        llm: Arc<dyn LmClient>,
        prompt_manager: Arc<PromptManager>,
    ) -> Self {
        Self {
            config,
            reward_fn,
            executor,
            llm,
            prompt_manager,
        }
    }

    /// Run one full search. If `initial_state` is absent, the root is
    /// constructed from the executor's condition inventory.
    pub async fn search(
        &self,
        session: &mut SessionContext,
        initial_state: Option<TestState>,
    ) -> SearchOutcome {
        let root_state = match initial_state {
            Some(state) => state,
            None => {
                let conditions = self.executor.get_conditions(&session.function_path).await;
                TestState::new_root(
                    session.function_signature.clone(),
                    session.function_path.clone(),
                    session.context.clone(),
                    session.coverage_target,
                    conditions,
                    session.learned_rules.clone(),
                )
            }
        };

        let mut tree = Tree::new(root_state);
        let root_id = tree.root_id();
        let mut best_node = root_id;
        let mut no_progress_count: u32 = 0;
        let mut last_best_coverage = tree.get(root_id).state.current_coverage;
        let mut iterations_run = 0u32;

        for iteration in 0..self.config.max_iterations {
            iterations_run = iteration + 1;

            if self.should_terminate(&tree, best_node, session, no_progress_count) {
                iterations_run = iteration;
                break;
            }

            let leaf = match self.select(&tree, root_id) {
                Some(leaf) => leaf,
                None => break,
            };

            if tree.get(leaf).is_terminal() {
                self.update_best(&mut tree, &mut best_node, leaf);
                break;
            }

            let rewards = self.expand_and_simulate(&mut tree, leaf, session).await;
            if rewards.is_empty() {
                continue;
            }

            let best_reward = rewards.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            self.backpropagate(&mut tree, leaf, best_reward);
            self.update_best_from_children(&mut tree, &mut best_node, leaf);

            let current_best_coverage = tree.get(best_node).state.current_coverage;
            if current_best_coverage > last_best_coverage {
                no_progress_count = 0;
                last_best_coverage = current_best_coverage;
            } else {
                no_progress_count += 1;
            }
        }

        let nodes_created = tree.len();
        SearchOutcome {
            tree,
            best_node,
            stats: SearchStats {
                iterations: iterations_run,
                nodes_created,
                no_progress_count,
            },
        }
    }

    /// `spec.md` §4.7's termination conditions that are checked explicitly
    /// inside the loop body (the remaining two — selection returning null,
    /// and `iteration == max_iterations` — are enforced by the `for` loop
    /// bounds and the `select` call site in `search`).
    fn should_terminate(
        &self,
        tree: &Tree,
        best_node: NodeId,
        session: &SessionContext,
        no_progress_count: u32,
    ) -> bool {
        tree.get(best_node).state.current_coverage >= session.coverage_target
            || no_progress_count >= self.config.max_no_progress_iters
            || session.budget_exceeded()
    }

    /// Descend from root via `best_child(exploration_coef)` until hitting a
    /// terminal node, a not-fully-expanded node, or a childless node.
    /// Hitting `max_depth` instead yields no selection at all (`None`), per
    /// `spec.md:163`'s "selection returned null" termination condition.
    fn select(&self, tree: &Tree, root_id: NodeId) -> Option<NodeId> {
        let mut current = root_id;
        loop {
            let node = tree.get(current);
            if node.depth >= self.config.max_depth {
                return None;
            }
            if node.is_terminal() || !node.is_fully_expanded() || node.children.is_empty() {
                return Some(current);
            }
            current = tree.best_child(current, self.config.exploration_coef)?;
        }
    }

    fn adaptive_k(&self, state: &TestState) -> usize {
        if !self.config.adaptive_k {
            return self.config.expansion_k;
        }
        let progress = state.coverage_progress();
        if progress < 0.3 {
            self.config.max_k
        } else if progress < 0.7 {
            self.config.expansion_k
        } else {
            self.config.min_k
        }
    }

    fn adaptive_temperature(coverage: f64) -> f64 {
        if coverage < 0.3 {
            0.9
        } else if coverage < 0.7 {
            0.7
        } else {
            0.5
        }
    }

    fn recent_errors(&self, tree: &Tree, node_id: NodeId, max_errors: usize) -> Vec<String> {
        let children = &tree.get(node_id).children;
        children
            .iter()
            .rev()
            .take(10)
            .flat_map(|&child_id| tree.get(child_id).state.execution_errors.iter().cloned())
            .take(max_errors)
            .collect()
    }

    /// The hardest single step: decide K and prompt mode, call the LM,
    /// parse and deduplicate candidates, execute each, prune, beam-limit,
    /// and attach survivors as children of `leaf`.
    async fn expand_and_simulate(
        &self,
        tree: &mut Tree,
        leaf: NodeId,
        session: &mut SessionContext,
    ) -> Vec<f64> {
        let leaf_state = tree.get(leaf).state.clone();
        let k = self.adaptive_k(&leaf_state);
        let temperature = Self::adaptive_temperature(leaf_state.current_coverage);

        let candidates = self
            .generate_candidates(tree, leaf, &leaf_state, session, k, temperature)
            .await;
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut valid_children: Vec<(TestState, f64, bool)> = Vec::new();
        for candidate in &candidates {
            let result = self
                .executor
                .execute(
                    &leaf_state.function_path,
                    &candidate.code,
                    &candidate.name,
                    &leaf_state.suite_names,
                )
                .await;
            let child_state = leaf_state.clone_with(&result);
            let reward = self.reward_fn.compute(&leaf_state, &child_state, &result);

            if self.config.enable_pruning && reward < self.config.prune_threshold {
                continue;
            }
            valid_children.push((child_state, reward, !result.compiled));
        }

        if valid_children.len() > self.config.beam_width {
            valid_children.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            valid_children.truncate(self.config.beam_width);
        }

        let mut rewards = Vec::with_capacity(valid_children.len());
        let mut saw_failure = false;
        for (child_state, reward, failed) in valid_children {
            saw_failure |= failed;
            let child_id = tree.add_child(leaf, child_state, ActionKind::ExpandBatch);
            tree.get_mut(child_id).update(reward);
            rewards.push(reward);
        }

        if saw_failure {
            self.maybe_reflect(tree, leaf, session).await;
        }

        rewards
    }

    async fn generate_candidates(
        &self,
        tree: &Tree,
        leaf: NodeId,
        leaf_state: &TestState,
        session: &mut SessionContext,
        k: usize,
        temperature: f64,
    ) -> Vec<Candidate> {
        let is_initialize = leaf_state.current_coverage == 0.0;
        let is_targeted =
            leaf_state.uncovered_conditions.len() <= 3 && leaf_state.current_coverage > 0.5;

        let prompt = if is_initialize {
            self.prompt_manager.render_initialize(
                &leaf_state.function_signature,
                &session.function_code,
                &leaf_state.context,
                &leaf_state.uncovered_conditions,
                &session.learned_rules,
                k,
            )
        } else if is_targeted {
            let target = leaf_state
                .uncovered_conditions
                .first()
                .map(|c| c.expression.clone())
                .unwrap_or_default();
            self.prompt_manager.render_targeted(
                &leaf_state.function_signature,
                &target,
                &[],
                &leaf_state.execution_errors,
                &session.learned_rules,
            )
        } else {
            let recent_errors = self.recent_errors(tree, leaf, 5);
            self.prompt_manager.render_batch(
                &leaf_state.function_signature,
                &leaf_state.suite_names,
                &leaf_state.uncovered_conditions,
                &session.learned_rules,
                &recent_errors,
                k,
            )
        };

        let prompt_tokens = (prompt.len() as u64).div_ceil(4);
        let response = match self
            .llm
            .generate(&prompt, temperature, self.config.default_max_tokens, None)
            .await
        {
            Ok(text) => text,
            Err(_) => return Vec::new(),
        };
        let completion_tokens = (response.len() as u64).div_ceil(4);
        session.add_token_usage(prompt_tokens, completion_tokens);

        let parsed = match extract_json(&response) {
            Ok(value) => value,
            Err(_) => return Vec::new(),
        };

        let raw_tests = if let Some(tests) = parsed.get("tests").and_then(|v| v.as_array()) {
            tests.clone()
        } else if let Some(array) = parsed.as_array() {
            array.clone()
        } else {
            return Vec::new();
        };

        let mut candidates = Vec::new();
        for (i, entry) in raw_tests.iter().take(k).enumerate() {
            let code = match entry.get("code").and_then(|v| v.as_str()) {
                Some(c) => c.to_string(),
                None => continue,
            };
            let name = entry
                .get("name")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| {
                    format!("test_{:03}", leaf_state.suite_names.len() + i + 1)
                });
            candidates.push(Candidate { name, code });
        }

        self.deduplicate_candidates(candidates, &leaf_state.suite_names)
    }

    /// Reject any candidate whose trimmed-code hash repeats within this
    /// batch, or whose name collides with the current suite or an earlier
    /// candidate in the same batch. This hash is distinct from
    /// `ExecutorClient`'s raw-body fingerprint cache — see `executor.rs`.
    fn deduplicate_candidates(&self, candidates: Vec<Candidate>, existing_names: &[String]) -> Vec<Candidate> {
        let mut seen_hashes: HashSet<u64> = HashSet::new();
        let mut seen_names: HashSet<String> = existing_names.iter().cloned().collect();
        let mut kept = Vec::new();

        for candidate in candidates {
            let hash = trimmed_code_hash(&candidate.code);
            if seen_hashes.contains(&hash) || seen_names.contains(&candidate.name) {
                continue;
            }
            seen_hashes.insert(hash);
            seen_names.insert(candidate.name.clone());
            kept.push(candidate);
        }

        kept
    }

    /// Best-effort reflection: ask the LM for a short rule describing how
    /// to avoid a failure just observed. Failures here are swallowed — this
    /// is strictly additive and must never affect the main loop's control
    /// flow (see `SPEC_FULL.md` §4.8).
    async fn maybe_reflect(&self, tree: &Tree, leaf: NodeId, session: &mut SessionContext) {
        let node = tree.get(leaf);
        let Some(last_error) = node.state.execution_errors.last() else {
            return;
        };
        let target_condition = node
            .state
            .uncovered_conditions
            .first()
            .map(|c| c.expression.clone())
            .unwrap_or_default();
        let prompt = self.prompt_manager.render_reflection(
            &target_condition,
            "",
            last_error,
            &session.learned_rules,
        );
        if let Ok(rule) = self.llm.generate(&prompt, 0.3, 256, None).await {
            let trimmed = rule.trim();
            if !trimmed.is_empty() {
                session.add_learned_rule(trimmed.to_string());
            }
        }
    }

    /// From `leaf.parent` up to the root, call `update(best_reward)` on
    /// each ancestor. The leaf itself was already updated once per child at
    /// insertion time in `expand_and_simulate` — it is not touched here.
    fn backpropagate(&self, tree: &mut Tree, leaf: NodeId, best_reward: f64) {
        for ancestor in tree.ancestors(leaf) {
            tree.get_mut(ancestor).update(best_reward);
        }
    }

    /// Pareto rule: strictly higher coverage wins; equal coverage with a
    /// strictly smaller suite wins; otherwise the incumbent is kept.
    fn update_best(&self, tree: &Tree, best_node: &mut NodeId, candidate: NodeId) {
        let incumbent = &tree.get(*best_node).state;
        let challenger = &tree.get(candidate).state;
        if is_better(challenger, incumbent) {
            *best_node = candidate;
        }
    }

    fn update_best_from_children(&self, tree: &Tree, best_node: &mut NodeId, leaf: NodeId) {
        for &child in &tree.get(leaf).children {
            self.update_best(tree, best_node, child);
        }
    }
}

fn is_better(challenger: &TestState, incumbent: &TestState) -> bool {
    if challenger.current_coverage > incumbent.current_coverage {
        true
    } else if challenger.current_coverage == incumbent.current_coverage {
        challenger.suite_names.len() < incumbent.suite_names.len()
    } else {
        false
    }
}

fn trimmed_code_hash(code: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    code.trim().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ExecutionResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct MockExecutor {
        coverage_sequence: StdMutex<Vec<f64>>,
    }

    #[async_trait]
    impl Executor for MockExecutor {
        async fn execute(
            &self,
            _function_path: &str,
            _test_body: &str,
            test_name: &str,
            existing_names: &[String],
        ) -> crate::state::ExecutionResult {
            let coverage = {
                let mut seq = self.coverage_sequence.lock().unwrap();
                if seq.is_empty() {
                    0.5
                } else {
                    seq.remove(0)
                }
            };
            let mut suite_names = existing_names.to_vec();
            suite_names.push(test_name.to_string());
            ExecutionResult {
                new_test_name: test_name.to_string(),
                compiled: true,
                error: None,
                suite_names,
                statement_coverage: coverage,
                branch_coverage: coverage,
                mcdc_coverage: coverage,
                conditions_now_covered: vec![],
            }
        }

        async fn get_conditions(&self, _function_path: &str) -> Vec<ConditionInfo> {
            vec![ConditionInfo::new("x > 0", true, true)]
        }
    }

    struct MockLm {
        call_count: AtomicUsize,
    }

    #[async_trait]
    impl LmClient for MockLm {
        async fn generate(
            &self,
            _prompt: &str,
            _temperature: f64,
            _max_tokens: u32,
            _system_message: Option<&str>,
        ) -> crate::error::LatsResult<String> {
            let n = self.call_count.fetch_add(1, Ordering::SeqCst);
            Ok(format!(
                r#"{{"tests":[{{"name":"test_{:03}","code":"fn test_{:03}() {{}}"}}]}}"#,
                n + 1,
                n + 1
            ))
        }
    }

    fn make_session() -> SessionContext {
        SessionContext::new("s1", "fn f()", "f.rs::f", "", "", 0.95, 100, 100_000)
    }

    #[tokio::test]
    async fn immediate_success_in_one_iteration() {
        let executor = Arc::new(MockExecutor {
            coverage_sequence: StdMutex::new(vec![0.96]),
        });
        let llm = Arc::new(MockLm {
            call_count: AtomicUsize::new(0),
        });
        let prompt_manager = Arc::new(PromptManager::new(None));
        let config = MCTSConfig {
            max_iterations: 10,
            coverage_target: 0.95,
            ..Default::default()
        };
        let controller = MCTSController::new(config, RewardFunction::default(), executor, llm, prompt_manager);
        let mut session = make_session();
        session.coverage_target = 0.95;

        let outcome = controller.search(&mut session, None).await;
        let best = outcome.tree.get(outcome.best_node);
        assert_eq!(best.state.current_coverage, 0.96);
        assert_eq!(best.state.suite_names.len(), 1);
    }

    #[tokio::test]
    async fn no_progress_triggers_early_stop() {
        let executor = Arc::new(MockExecutor {
            coverage_sequence: StdMutex::new(vec![0.30; 50]),
        });
        let llm = Arc::new(MockLm {
            call_count: AtomicUsize::new(0),
        });
        let prompt_manager = Arc::new(PromptManager::new(None));
        let config = MCTSConfig {
            max_iterations: 100,
            max_no_progress_iters: 5,
            expansion_k: 1,
            adaptive_k: false,
            coverage_target: 0.95,
            ..Default::default()
        };
        let controller = MCTSController::new(config, RewardFunction::default(), executor, llm, prompt_manager);
        let mut session = make_session();
        session.coverage_target = 0.95;

        let outcome = controller.search(&mut session, None).await;
        assert!(outcome.stats.iterations < 100);
        assert_eq!(outcome.tree.get(outcome.best_node).state.current_coverage, 0.30);
    }

    #[test]
    fn adaptive_k_staging_matches_spec() {
        let controller = MCTSController::new(
            MCTSConfig {
                min_k: 1,
                expansion_k: 3,
                max_k: 5,
                coverage_target: 0.95,
                adaptive_k: true,
                ..Default::default()
            },
            RewardFunction::default(),
            Arc::new(MockExecutor {
                coverage_sequence: StdMutex::new(vec![]),
            }),
            Arc::new(MockLm {
                call_count: AtomicUsize::new(0),
            }),
            Arc::new(PromptManager::new(None)),
        );

        let mut state = TestState::new_root("fn f()", "f.rs::f", "", 0.95, vec![], vec![]);
        state.current_coverage = 0.10;
        assert_eq!(controller.adaptive_k(&state), 5);
        state.current_coverage = 0.50;
        assert_eq!(controller.adaptive_k(&state), 3);
        state.current_coverage = 0.85;
        assert_eq!(controller.adaptive_k(&state), 1);
    }

    #[test]
    fn best_node_tie_break_prefers_smaller_suite() {
        let mut a = TestState::new_root("fn f()", "f.rs::f", "", 0.95, vec![], vec![]);
        a.current_coverage = 0.80;
        a.suite_names = vec!["t1".into(), "t2".into(), "t3".into()];

        let mut b = TestState::new_root("fn f()", "f.rs::f", "", 0.95, vec![], vec![]);
        b.current_coverage = 0.80;
        b.suite_names = vec!["t1".into(), "t2".into(), "t3".into(), "t4".into()];

        assert!(is_better(&a, &b));
        assert!(!is_better(&b, &a));
    }

    #[test]
    fn pruning_keeps_backprop_reward_as_max_of_survivors() {
        // Candidates with rewards +4, -3, +1 and prune_threshold=-2:
        // the -3 candidate is pruned, backprop reward is max(+4, +1) = +4.
        let rewards = [4.0_f64, -3.0, 1.0];
        let prune_threshold = -2.0;
        let survivors: Vec<f64> = rewards.into_iter().filter(|r| *r >= prune_threshold).collect();
        assert_eq!(survivors.len(), 2);
        let best = survivors.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(best, 4.0);
    }

    #[test]
    fn deduplicate_candidates_rejects_repeated_hash_and_name() {
        let controller = MCTSController::new(
            MCTSConfig::default(),
            RewardFunction::default(),
            Arc::new(MockExecutor {
                coverage_sequence: StdMutex::new(vec![]),
            }),
            Arc::new(MockLm {
                call_count: AtomicUsize::new(0),
            }),
            Arc::new(PromptManager::new(None)),
        );
        let candidates = vec![
            Candidate {
                name: "test_001".into(),
                code: "fn test_001() { assert!(true); }".into(),
            },
            Candidate {
                name: "test_002".into(),
                code: "  fn test_001() { assert!(true); }  ".into(), // same trimmed body as above
            },
            Candidate {
                name: "test_001".into(), // name collision with a kept candidate
                code: "fn test_003() { assert!(false); }".into(),
            },
            Candidate {
                name: "test_004".into(),
                code: "fn test_004() { assert!(true); }".into(),
            },
        ];
        let existing = vec!["test_000".to_string()];
        let kept = controller.deduplicate_candidates(candidates, &existing);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].name, "test_001");
        assert_eq!(kept[1].name, "test_004");
    }
}
