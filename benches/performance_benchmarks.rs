//! Performance benchmarks for the synchronous, hot-path parts of the
//! search: UCB1/best-child selection and reward computation. The LM and
//! executor calls are the only suspension points (`spec.md` §5) and are
//! deliberately excluded — they're dominated by outbound network latency,
//! not anything this crate controls.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lats_service::reward::RewardFunction;
use lats_service::state::{ConditionInfo, ExecutionResult, TestState};
use lats_service::tree::{ActionKind, Tree};

fn build_wide_tree(children: usize) -> (Tree, lats_service::tree::NodeId) {
    let root_state = TestState::new_root(
        "fn target(x: i32) -> bool",
        "src/lib.rs::target",
        "",
        0.95,
        (0..20)
            .map(|i| ConditionInfo::new(format!("cond_{i}"), true, true))
            .collect(),
        vec![],
    );
    let mut tree = Tree::new(root_state);
    let root = tree.root_id();
    for i in 0..children {
        let child_state = TestState::new_root(
            "fn target(x: i32) -> bool",
            "src/lib.rs::target",
            "",
            0.95,
            vec![],
            vec![],
        );
        let child = tree.add_child(root, child_state, ActionKind::ExpandBatch);
        tree.get_mut(child).update((i % 7) as f64 - 2.0);
    }
    tree.get_mut(root).update(5.0);
    (tree, root)
}

fn bench_best_child(c: &mut Criterion) {
    let (tree, root) = build_wide_tree(64);
    c.bench_function("best_child_ucb1_64_children", |b| {
        b.iter(|| black_box(tree.best_child(root, 1.414)))
    });
}

fn bench_reward_compute(c: &mut Criterion) {
    let reward_fn = RewardFunction::default();
    let old = TestState::new_root("fn f()", "f.rs::f", "", 0.95, vec![], vec![]);
    let mut new = old.clone();
    new.current_coverage = 0.4;
    new.suite_names = vec!["t1".into(), "t2".into()];
    let result = ExecutionResult {
        new_test_name: "t2".into(),
        compiled: true,
        error: None,
        suite_names: new.suite_names.clone(),
        statement_coverage: 0.4,
        branch_coverage: 0.4,
        mcdc_coverage: 0.4,
        conditions_now_covered: vec![],
    };

    c.bench_function("reward_compute", |b| {
        b.iter(|| black_box(reward_fn.compute(&old, &new, &result)))
    });
}

criterion_group!(benches, bench_best_child, bench_reward_compute);
criterion_main!(benches);
