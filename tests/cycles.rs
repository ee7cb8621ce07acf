//! Dependency cycles are reported as errors instead of deadlocking the round.

use std::collections::HashMap;
use std::sync::Arc;

use evalgraph::{EvalError, Evaluator, Key, NodeState};
use parking_lot::RwLock;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct Node(u32);

impl Key for Node {
    type Kind = ();

    fn kind(&self) {}
}

type Edges = Arc<RwLock<HashMap<u32, Vec<u32>>>>;

/// Every node's value is its own number plus the values of its edges.
fn graph_evaluator(edges: &Edges, parallelism: usize) -> Evaluator<Node, u64> {
    let edges = edges.clone();
    Evaluator::<Node, u64>::builder()
        .parallelism(parallelism)
        .function_fn((), move |key, env| {
            let deps = edges.read().get(&key.0).cloned().unwrap_or_default();
            let values = env.get_values(deps.into_iter().map(Node));
            env.check_missing()?;
            Ok(u64::from(key.0) + values.into_iter().flatten().map(|v| *v).sum::<u64>())
        })
        .build()
        .unwrap()
}

fn edges(list: &[(u32, &[u32])]) -> Edges {
    Arc::new(RwLock::new(
        list.iter().map(|(from, to)| (*from, to.to_vec())).collect(),
    ))
}

fn nodes(ids: &[u32]) -> Vec<Node> {
    ids.iter().copied().map(Node).collect()
}

// =============================================================================
// Detection
// =============================================================================

#[test]
fn test_three_node_cycle_fails_every_member() {
    let edges = edges(&[(1, &[2]), (2, &[3]), (3, &[1])]);
    let mut evaluator = graph_evaluator(&edges, 4);

    let result = evaluator.evaluate([Node(1)]).unwrap();

    let info = result.error(&Node(1)).and_then(EvalError::cycle).unwrap();
    assert_eq!(info.cycle, nodes(&[1, 2, 3]));

    let second = evaluator.error(&Node(2)).unwrap();
    assert_eq!(second.cycle().unwrap().cycle, nodes(&[2, 3, 1]));
    assert_eq!(evaluator.state(&Node(3)), Some(NodeState::Error));
    assert_eq!(result.cycles().count(), 1);
    assert!(evaluator.graph().check_consistency().is_ok());
}

#[test]
fn test_self_cycle() {
    let edges = edges(&[(5, &[5])]);
    let mut evaluator = graph_evaluator(&edges, 2);

    let result = evaluator.evaluate([Node(5)]).unwrap();

    match result.error(&Node(5)) {
        Some(EvalError::Cycle { key, info }) => {
            assert_eq!(*key, Node(5));
            assert_eq!(info.cycle, nodes(&[5]));
        }
        other => panic!("expected cycle error, got {:?}", other),
    }
}

#[test]
fn test_every_member_reports_a_cycle_through_itself() {
    // 1 -> 2 -> 3 -> {2, 1}: the component holds two cycles, and 1 is only on the longer one.
    let edges = edges(&[(1, &[2]), (2, &[3]), (3, &[2, 1])]);
    let mut evaluator = graph_evaluator(&edges, 4);

    let result = evaluator.evaluate([Node(1)]).unwrap();

    let cycle = |id: u32| evaluator.error(&Node(id)).unwrap().cycle().unwrap().cycle.clone();
    assert_eq!(cycle(1), nodes(&[1, 2, 3]));
    assert_eq!(cycle(2), nodes(&[2, 3]));
    assert_eq!(cycle(3), nodes(&[3, 2]));
    assert_eq!(result.cycles().count(), 1);
}

#[test]
fn test_dependents_of_a_cycle_fail_with_cycle_root() {
    let edges = edges(&[(0, &[1]), (1, &[2]), (2, &[3]), (3, &[1])]);
    let mut evaluator = graph_evaluator(&edges, 4);

    let result = evaluator.evaluate([Node(0)]).unwrap();

    let error = result.error(&Node(0)).unwrap();
    match error {
        EvalError::Dependency { dependency, .. } => assert_eq!(*dependency, Node(1)),
        other => panic!("expected dependency error, got {:?}", other),
    }
    assert!(error.is_cycle());
    assert_eq!(error.chain(), vec![&Node(0), &Node(1)]);
    assert_eq!(error.cycle().unwrap().cycle, nodes(&[1, 2, 3]));
}

#[test]
fn test_acyclic_branches_still_complete() {
    let edges = edges(&[(30, &[31, 32]), (31, &[]), (32, &[30])]);
    let mut evaluator = graph_evaluator(&edges, 4);

    let result = evaluator.evaluate([Node(30)]).unwrap();

    assert_eq!(
        result.error(&Node(30)).and_then(EvalError::cycle).unwrap().cycle,
        nodes(&[30, 32])
    );
    assert_eq!(evaluator.value(&Node(31)).as_deref(), Some(&31));
}

#[test]
fn test_disjoint_cycles_in_one_round() {
    let edges = edges(&[(10, &[11]), (11, &[10]), (20, &[21]), (21, &[20]), (40, &[])]);
    let mut evaluator = graph_evaluator(&edges, 4);

    let result = evaluator
        .evaluate([Node(10), Node(20), Node(40)])
        .unwrap();

    assert_eq!(result.cycles().count(), 2);
    assert_eq!(
        result.error(&Node(10)).and_then(EvalError::cycle).unwrap().cycle,
        nodes(&[10, 11])
    );
    assert_eq!(
        result.error(&Node(20)).and_then(EvalError::cycle).unwrap().cycle,
        nodes(&[20, 21])
    );
    assert_eq!(result.value(&Node(40)).map(|v| **v), Some(40));
}

// =============================================================================
// Recovery and scale
// =============================================================================

#[test]
fn test_cycle_errors_are_retried_after_edges_change() {
    let edges = edges(&[(1, &[2]), (2, &[3]), (3, &[1])]);
    let mut evaluator = graph_evaluator(&edges, 4);
    assert!(evaluator.evaluate([Node(1)]).unwrap().has_error());

    edges.write().insert(3, vec![]);
    let result = evaluator.evaluate([Node(1)]).unwrap();

    assert_eq!(result.value(&Node(1)).map(|v| **v), Some(6));
    assert_eq!(evaluator.value(&Node(3)).as_deref(), Some(&3));
    assert!(evaluator.graph().check_consistency().is_ok());
}

#[test]
fn test_long_chain_does_not_overflow() {
    let depth = 10_000;
    let list: Vec<(u32, Vec<u32>)> = (0..depth).map(|i| (i, vec![i + 1])).collect();
    let edges: Edges = Arc::new(RwLock::new(list.into_iter().collect()));
    let mut evaluator = graph_evaluator(&edges, 4);

    let result = evaluator.evaluate([Node(0)]).unwrap();

    let expected: u64 = (0..=u64::from(depth)).sum();
    assert_eq!(result.value(&Node(0)).map(|v| **v), Some(expected));
    assert_eq!(evaluator.graph().len(), depth as usize + 1);
}

#[test]
fn test_long_cycle_is_detected() {
    let length = 2_000;
    let list: Vec<(u32, Vec<u32>)> = (0..length).map(|i| (i, vec![(i + 1) % length])).collect();
    let edges: Edges = Arc::new(RwLock::new(list.into_iter().collect()));
    let mut evaluator = graph_evaluator(&edges, 4);

    let result = evaluator.evaluate([Node(0)]).unwrap();

    let info = result.error(&Node(0)).and_then(EvalError::cycle).unwrap();
    assert_eq!(info.cycle.len(), length as usize);
    assert_eq!(info.cycle[0], Node(0));
    assert_eq!(info.cycle[1], Node(1));
}
