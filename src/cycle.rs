//! Cycle detection over the waits-for graph of stuck nodes.

use std::collections::VecDeque;

use crate::{CycleInfo, Key};

/// Strongly connected components of `nodes` that contain a cycle.
///
/// `edges[i]` lists the successors of `nodes[i]` as indices into `nodes`. Components are
/// reported in the order Tarjan's algorithm closes them, with members in discovery order.
/// The traversal is iterative, so deep graphs do not exhaust the stack.
pub(crate) fn cyclic_components(edges: &[Vec<usize>]) -> Vec<Vec<usize>> {
    const UNVISITED: usize = usize::MAX;

    let n = edges.len();
    let mut index = vec![UNVISITED; n];
    let mut lowlink = vec![0; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0;
    let mut components = Vec::new();

    for start in 0..n {
        if index[start] != UNVISITED {
            continue;
        }
        index[start] = next_index;
        lowlink[start] = next_index;
        next_index += 1;
        stack.push(start);
        on_stack[start] = true;
        let mut calls: Vec<(usize, usize)> = vec![(start, 0)];

        while let Some(frame) = calls.last_mut() {
            let v = frame.0;
            if let Some(&w) = edges[v].get(frame.1) {
                frame.1 += 1;
                if index[w] == UNVISITED {
                    index[w] = next_index;
                    lowlink[w] = next_index;
                    next_index += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    calls.push((w, 0));
                } else if on_stack[w] {
                    lowlink[v] = lowlink[v].min(index[w]);
                }
                continue;
            }

            calls.pop();
            if let Some(&(parent, _)) = calls.last() {
                lowlink[parent] = lowlink[parent].min(lowlink[v]);
            }
            if lowlink[v] != index[v] {
                continue;
            }
            let mut component = Vec::new();
            while let Some(w) = stack.pop() {
                on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            if component.len() > 1 || edges[v].contains(&v) {
                component.sort_by_key(|&w| index[w]);
                components.push(component);
            }
        }
    }
    components
}

/// Describe the cycle through each member of the cyclic `component`, in member order.
///
/// A member's cycle is the shortest one through it, found by a breadth-first search that stays
/// inside the component, and starts at the member itself.
pub(crate) fn describe_component<K: Key>(
    component: &[usize],
    edges: &[Vec<usize>],
    keys: &[K],
) -> Vec<CycleInfo<K>> {
    const UNSEEN: usize = usize::MAX;

    let local: ahash::HashMap<usize, usize> = component
        .iter()
        .enumerate()
        .map(|(at, &node)| (node, at))
        .collect();
    let mut parent = vec![UNSEEN; component.len()];
    let mut queue = VecDeque::new();
    let mut infos = Vec::with_capacity(component.len());

    for start in 0..component.len() {
        parent.fill(UNSEEN);
        queue.clear();
        queue.push_back(start);
        // The node whose edge closes the cycle back to `start`.
        let mut closing = start;
        'search: while let Some(at) = queue.pop_front() {
            for &next in edges[component[at]].iter().filter_map(|w| local.get(w)) {
                if next == start {
                    closing = at;
                    break 'search;
                }
                if parent[next] == UNSEEN {
                    parent[next] = at;
                    queue.push_back(next);
                }
            }
        }

        let mut cycle = Vec::new();
        let mut at = closing;
        while at != start {
            cycle.push(keys[component[at]].clone());
            at = parent[at];
        }
        cycle.push(keys[component[start]].clone());
        cycle.reverse();
        infos.push(CycleInfo { cycle });
    }
    infos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Hash, PartialEq, Eq)]
    struct K(char);

    impl Key for K {
        type Kind = ();

        fn kind(&self) {}
    }

    #[test]
    fn finds_a_three_node_cycle() {
        // a -> b -> c -> a, d -> a
        let edges = vec![vec![1], vec![2], vec![0], vec![0]];
        assert_eq!(cyclic_components(&edges), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn self_loops_count_and_acyclic_nodes_do_not() {
        let edges = vec![vec![0], vec![2], vec![]];
        assert_eq!(cyclic_components(&edges), vec![vec![0]]);
    }

    #[test]
    fn deep_chains_do_not_recurse() {
        let n = 100_000;
        let mut edges: Vec<Vec<usize>> = (0..n).map(|i| vec![i + 1]).collect();
        edges[n - 1] = vec![0];
        let components = cyclic_components(&edges);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].len(), n);
    }

    #[test]
    fn describe_rotates_the_cycle_to_the_member() {
        let keys = vec![K('a'), K('b'), K('c')];
        let edges = vec![vec![1], vec![2], vec![0]];

        let infos = describe_component(&[0, 1, 2], &edges, &keys);
        assert_eq!(infos[1].cycle, vec![K('b'), K('c'), K('a')]);
        assert_eq!(infos[0].cycle, vec![K('a'), K('b'), K('c')]);
    }

    #[test]
    fn describe_finds_a_cycle_through_every_member() {
        // a -> b, b -> c, c -> b, c -> a: following first edges from a never returns to a.
        let keys = vec![K('a'), K('b'), K('c')];
        let edges = vec![vec![1], vec![2], vec![1, 0]];
        let components = cyclic_components(&edges);
        assert_eq!(components, vec![vec![0, 1, 2]]);

        let infos = describe_component(&components[0], &edges, &keys);
        assert_eq!(infos[0].cycle, vec![K('a'), K('b'), K('c')]);
        assert_eq!(infos[1].cycle, vec![K('b'), K('c')]);
        assert_eq!(infos[2].cycle, vec![K('c'), K('b')]);
        for (info, key) in infos.iter().zip(&keys) {
            assert_eq!(info.cycle.first(), Some(key));
        }
    }

    #[test]
    fn describe_handles_self_loops() {
        let keys = vec![K('a')];
        let edges = vec![vec![0]];

        let infos = describe_component(&[0], &edges, &keys);
        assert_eq!(infos[0].cycle, vec![K('a')]);
    }
}
