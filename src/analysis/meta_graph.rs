//! Derived vertex/edge graphs.
//!
//! A [`MetaGraph`] is an adjacency map over any ordered vertex type. The
//! allocation analyses build one over instructions (operand -> user edges)
//! and derive consumer closures and their transposes from it; the matcher
//! uses one over pattern node ids to check pattern connectivity. Ordered
//! maps keep every traversal deterministic.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::ir::{InstId, Module};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaGraph<V: Ord + Copy> {
    edges: BTreeMap<V, BTreeSet<V>>,
}

impl<V: Ord + Copy> Default for MetaGraph<V> {
    fn default() -> Self {
        Self { edges: BTreeMap::new() }
    }
}

impl<V: Ord + Copy> MetaGraph<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// One vertex per entry of `vertices`, with out-edges from `successors`.
    pub fn from_vertices<I, F>(vertices: I, mut successors: F) -> Self
    where
        I: IntoIterator<Item = V>,
        F: FnMut(V) -> BTreeSet<V>,
    {
        let edges = vertices.into_iter().map(|v| (v, successors(v))).collect();
        Self { edges }
    }

    pub fn add_vertex(&mut self, v: V) {
        self.edges.entry(v).or_default();
    }

    pub fn add_edge(&mut self, from: V, to: V) {
        self.edges.entry(from).or_default().insert(to);
        self.edges.entry(to).or_default();
    }

    pub fn contains(&self, v: V) -> bool {
        self.edges.contains_key(&v)
    }

    pub fn get(&self, v: V) -> Option<&BTreeSet<V>> {
        self.edges.get(&v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (V, &BTreeSet<V>)> {
        self.edges.iter().map(|(v, e)| (*v, e))
    }

    pub fn vertices(&self) -> impl Iterator<Item = V> + '_ {
        self.edges.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn find_vertices(&self, mut pred: impl FnMut(V) -> bool) -> BTreeSet<V> {
        self.vertices().filter(|&v| pred(v)).collect()
    }

    /// Vertices reachable from `v` through vertices satisfying `pred`.
    ///
    /// With `inclusive`, the first vertex on each path that fails `pred` is
    /// reported too, but traversal does not continue through it.
    pub fn find_consumers(&self, v: V, mut pred: impl FnMut(V) -> bool, inclusive: bool) -> BTreeSet<V> {
        let mut consumers = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([v]);
        visited.insert(v);
        while let Some(current) = queue.pop_front() {
            let Some(next) = self.edges.get(&current) else {
                continue;
            };
            for &n in next {
                if !visited.insert(n) {
                    continue;
                }
                if pred(n) {
                    consumers.insert(n);
                    queue.push_back(n);
                } else if inclusive {
                    consumers.insert(n);
                }
            }
        }
        consumers
    }

    /// Every edge reversed. Only vertices with at least one incoming edge in
    /// `self` become keys of the result.
    pub fn transpose(&self) -> Self {
        let mut result = Self::new();
        for (&from, targets) in &self.edges {
            for &to in targets {
                result.edges.entry(to).or_default().insert(from);
            }
        }
        result
    }

    /// Shortest path from `src` to `dst`, both included.
    pub fn shortest_path(&self, src: V, dst: V) -> Option<Vec<V>> {
        let mut parent: BTreeMap<V, V> = BTreeMap::new();
        let mut queue = VecDeque::from([src]);
        let mut visited = BTreeSet::from([src]);
        while let Some(current) = queue.pop_front() {
            if current == dst {
                let mut path = vec![dst];
                let mut at = dst;
                while let Some(&p) = parent.get(&at) {
                    path.push(p);
                    at = p;
                }
                path.reverse();
                return Some(path);
            }
            for &n in self.edges.get(&current).into_iter().flatten() {
                if visited.insert(n) {
                    parent.insert(n, current);
                    queue.push_back(n);
                }
            }
        }
        None
    }

    /// Whether every vertex of `path` satisfies `ok(vertex, index, len)`.
    pub fn is_path_ok(path: &[V], mut ok: impl FnMut(V, usize, usize) -> bool) -> bool {
        path.iter().enumerate().all(|(i, &v)| ok(v, i, path.len()))
    }

    /// Whether every vertex can reach every other ignoring edge direction.
    pub fn is_weakly_connected(&self) -> bool {
        let undirected = {
            let mut g = self.clone();
            for (&from, targets) in &self.edges {
                for &to in targets {
                    g.add_edge(to, from);
                }
            }
            g
        };
        let Some(first) = self.vertices().next() else {
            return true;
        };
        undirected.find_consumers(first, |_| true, false).len() + 1 == self.len()
    }
}

impl MetaGraph<InstId> {
    /// Operand -> user graph over everything the root reaches through operands.
    pub fn from_operands(module: &Module, root: InstId) -> Self {
        let mut graph = Self::new();
        let mut stack = vec![root];
        graph.add_vertex(root);
        while let Some(id) = stack.pop() {
            for &op in module.inst(id).operands() {
                if !graph.contains(op) {
                    stack.push(op);
                }
                graph.add_edge(op, id);
            }
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1 -> 2 -> 3 -> 4, 1 -> 5 -> 4
    fn diamond() -> MetaGraph<u32> {
        let mut g = MetaGraph::new();
        g.add_edge(1, 2);
        g.add_edge(2, 3);
        g.add_edge(3, 4);
        g.add_edge(1, 5);
        g.add_edge(5, 4);
        g
    }

    #[test]
    fn test_find_consumers_stops_at_boundary() {
        let g = diamond();
        let all = g.find_consumers(1, |_| true, false);
        assert_eq!(all, BTreeSet::from([2, 3, 4, 5]));

        let exclusive = g.find_consumers(1, |v| v != 3 && v != 5, false);
        assert_eq!(exclusive, BTreeSet::from([2]));

        let inclusive = g.find_consumers(1, |v| v != 3 && v != 5, true);
        assert_eq!(inclusive, BTreeSet::from([2, 3, 5]));
    }

    #[test]
    fn test_transpose_and_paths() {
        let g = diamond();
        let t = g.transpose();
        assert_eq!(t.get(4), Some(&BTreeSet::from([3, 5])));
        assert!(!t.contains(1));
        assert_eq!(g.shortest_path(1, 4), Some(vec![1, 5, 4]));
        assert_eq!(g.shortest_path(4, 1), None);
        assert_eq!(g.shortest_path(2, 2), Some(vec![2]));
    }

    #[test]
    fn test_path_predicate() {
        assert!(MetaGraph::<u32>::is_path_ok(&[2, 4, 6], |v, _, _| v % 2 == 0));
        assert!(MetaGraph::<u32>::is_path_ok(&[2, 4, 7], |v, i, n| v % 2 == 0 || i + 1 == n));
        assert!(!MetaGraph::<u32>::is_path_ok(&[2, 3, 6], |v, _, _| v % 2 == 0));
    }

    #[test]
    fn test_weak_connectivity() {
        assert!(diamond().is_weakly_connected());
        let mut g = diamond();
        g.add_vertex(9);
        assert!(!g.is_weakly_connected());
    }
}
