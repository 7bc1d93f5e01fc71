//! Stable topological ordering (Kahn's algorithm).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Orders nodes `0..n` so that each node follows all of its prerequisites.
///
/// `prerequisites[i]` lists the nodes that must come before `i`. Among nodes
/// that are ready at the same time, the lower index goes first.
///
/// On failure returns one cycle as a node path whose first and last entries
/// are the same node.
pub(crate) fn stable_order(prerequisites: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = prerequisites.len();
    let mut indegree: Vec<usize> = prerequisites.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (node, prereqs) in prerequisites.iter().enumerate() {
        for &p in prereqs {
            dependents[p].push(node);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &dependent in &dependents[node] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    Err(find_cycle(prerequisites, &indegree))
}

/// Walks prerequisite edges among unprocessed nodes until one repeats.
///
/// Every unprocessed node still has an unprocessed prerequisite, so the walk
/// always closes a cycle.
fn find_cycle(prerequisites: &[Vec<usize>], indegree: &[usize]) -> Vec<usize> {
    let Some(start) = indegree.iter().position(|d| *d > 0) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        let Some(&next) = prerequisites[current].iter().find(|p| indegree[**p] > 0) else {
            return path;
        };

        if let Some(&pos) = seen.get(&next) {
            let mut cycle: Vec<usize> = path[pos..].to_vec();
            cycle.push(next);
            // Report in dependency direction: prerequisite -> dependent.
            cycle.reverse();
            return cycle;
        }

        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orders_prerequisites_first() {
        // 0 <- 2, 1 <- 2, 2 <- 3
        let prereqs = vec![vec![], vec![], vec![0, 1], vec![2]];
        assert_eq!(stable_order(&prereqs), Ok(vec![0, 1, 2, 3]));
    }

    #[test]
    fn test_ties_broken_by_index() {
        // 0 depends on 2; 1 is independent
        let prereqs = vec![vec![2], vec![], vec![]];
        assert_eq!(stable_order(&prereqs), Ok(vec![1, 2, 0]));
    }

    #[test]
    fn test_cycle_reported() {
        // 0 -> 1 -> 2 -> 0, plus an independent 3
        let prereqs = vec![vec![2], vec![0], vec![1], vec![]];
        let cycle = stable_order(&prereqs).unwrap_err();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
        assert!(!cycle.contains(&3));
    }

    #[test]
    fn test_self_loop() {
        let prereqs = vec![vec![0]];
        assert_eq!(stable_order(&prereqs).unwrap_err(), vec![0, 0]);
    }
}
