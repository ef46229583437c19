//! Expansion order
//!
//! Kahn's algorithm over resource declarations with:
//! - a min-heap on declaration ordinal, so independent declarations keep
//!   template order
//! - cycle detection that names only the declarations on a cycle, not the
//!   ones merely stuck behind it

use std::collections::BinaryHeap;

use crate::error::{ExpandError, Result};

/// One declaration in the dependency graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    /// Position in the template's resource list
    pub ordinal: usize,
    /// Used in cycle errors; the resource id when it is known
    pub label: String,
    /// Indices (into the node slice) this node must come after
    pub depends_on: Vec<usize>,
}

/// Wrapper for BinaryHeap to get min-heap behaviour on ordinal
#[derive(Debug, Eq, PartialEq)]
struct MinHeapEntry {
    ordinal: usize,
    node: usize,
}

impl Ord for MinHeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .ordinal
            .cmp(&self.ordinal)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for MinHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Topologically sort `nodes`, returning node indices in expansion order
pub fn expansion_order(nodes: &[DependencyNode]) -> Result<Vec<usize>> {
    let n = nodes.len();

    // dependents[i] = nodes that must come after i
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree: Vec<usize> = vec![0; n];
    for (idx, node) in nodes.iter().enumerate() {
        let mut seen = Vec::with_capacity(node.depends_on.len());
        for &dep in &node.depends_on {
            if dep >= n || seen.contains(&dep) {
                continue;
            }
            seen.push(dep);
            dependents[dep].push(idx);
            in_degree[idx] += 1;
        }
    }

    let mut heap: BinaryHeap<MinHeapEntry> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &degree)| degree == 0)
        .map(|(idx, _)| MinHeapEntry {
            ordinal: nodes[idx].ordinal,
            node: idx,
        })
        .collect();

    let mut sorted: Vec<usize> = Vec::with_capacity(n);
    while let Some(entry) = heap.pop() {
        sorted.push(entry.node);
        for &next in &dependents[entry.node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                heap.push(MinHeapEntry {
                    ordinal: nodes[next].ordinal,
                    node: next,
                });
            }
        }
    }

    if sorted.len() == n {
        return Ok(sorted);
    }

    let mut remaining: Vec<bool> = vec![true; n];
    for &idx in &sorted {
        remaining[idx] = false;
    }
    let cycle = cycle_members(nodes, &dependents, remaining);
    Err(ExpandError::CyclicDependency {
        ids: cycle.iter().map(|&i| nodes[i].label.clone()).collect(),
    })
}

/// Strip nodes that only sit downstream of a cycle: repeatedly drop any
/// remaining node that no other remaining node depends on.
fn cycle_members(
    nodes: &[DependencyNode],
    dependents: &[Vec<usize>],
    mut remaining: Vec<bool>,
) -> Vec<usize> {
    loop {
        let prunable: Vec<usize> = (0..nodes.len())
            .filter(|&i| remaining[i] && !dependents[i].iter().any(|&d| remaining[d]))
            .collect();
        if prunable.is_empty() {
            break;
        }
        for i in prunable {
            remaining[i] = false;
        }
    }

    let mut members: Vec<usize> = (0..nodes.len()).filter(|&i| remaining[i]).collect();
    members.sort_by_key(|&i| nodes[i].ordinal);
    members
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(ordinal: usize, label: &str, depends_on: &[usize]) -> DependencyNode {
        DependencyNode {
            ordinal,
            label: label.to_string(),
            depends_on: depends_on.to_vec(),
        }
    }

    #[test]
    fn test_empty() {
        assert_eq!(expansion_order(&[]).unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn test_reordering_by_dependency() {
        // C depends on B depends on A, declared C, B, A
        let nodes = vec![node(0, "c", &[1]), node(1, "b", &[2]), node(2, "a", &[])];
        assert_eq!(expansion_order(&nodes).unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_stable_sort_preserves_declaration_order() {
        let nodes = vec![node(0, "x", &[]), node(1, "y", &[]), node(2, "z", &[0])];
        assert_eq!(expansion_order(&nodes).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_duplicate_edges_counted_once() {
        let nodes = vec![node(0, "a", &[]), node(1, "b", &[0, 0])];
        assert_eq!(expansion_order(&nodes).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_cycle_names_only_participants() {
        // a <-> b, c depends on a
        let nodes = vec![node(0, "a", &[1]), node(1, "b", &[0]), node(2, "c", &[0])];
        let err = expansion_order(&nodes).unwrap_err();
        assert_eq!(
            err,
            ExpandError::CyclicDependency {
                ids: vec!["a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let nodes = vec![node(0, "solo", &[0])];
        assert!(matches!(
            expansion_order(&nodes),
            Err(ExpandError::CyclicDependency { .. })
        ));
    }
}
