//! Reference dominator computation.
//!
//! The classic Allen-Cocke iterative scheme over explicit dominator sets:
//! `dom(v) = {v} + intersection of dom(p) over the predecessors of v`,
//! repeated to fixpoint. Quadratic and only used as a test oracle for the
//! BFS-numbered iterative algorithm in [`crate::cfg::graph`].

use smallvec::SmallVec;

use crate::common::int_set::IntSet;

#[derive(Debug)]
pub struct SimpleCfg {
    successors: Vec<SmallVec<[usize; 2]>>,
    predecessors: Vec<Vec<usize>>,
    reach_order: Vec<usize>,
    dominators: Vec<Option<IntSet>>,
}

impl SimpleCfg {
    pub fn new(successors: Vec<SmallVec<[usize; 2]>>) -> Self {
        let count = successors.len();
        SimpleCfg {
            successors,
            predecessors: vec![Vec::new(); count],
            reach_order: Vec::new(),
            dominators: vec![None; count],
        }
    }

    pub fn analyze(&mut self) {
        if self.successors.is_empty() {
            return;
        }
        self.compute_reachability();
        for &node in &self.reach_order {
            for &successor in &self.successors[node] {
                self.predecessors[successor].push(node);
            }
        }
        self.dominators[0] = Some(IntSet::singleton(0));
        let mut changed = true;
        while changed {
            changed = false;
            for index in 1..self.reach_order.len() {
                let node = self.reach_order[index];
                let mut new_set: Option<IntSet> = None;
                for &predecessor in &self.predecessors[node] {
                    let Some(predecessor_set) = &self.dominators[predecessor] else {
                        continue;
                    };
                    match &mut new_set {
                        None => new_set = Some(predecessor_set.clone()),
                        Some(set) => set.intersect_with(predecessor_set),
                    }
                }
                let Some(mut new_set) = new_set else { continue };
                new_set.insert(node);
                if self.dominators[node].as_ref() != Some(&new_set) {
                    self.dominators[node] = Some(new_set);
                    changed = true;
                }
            }
        }
    }

    /// The full dominator set of `node`, or `None` if it is unreachable.
    pub fn dominators(&self, node: usize) -> Option<&IntSet> {
        self.dominators[node].as_ref()
    }

    fn compute_reachability(&mut self) {
        let mut reached = vec![false; self.successors.len()];
        let mut queue = vec![0];
        reached[0] = true;
        let mut head = 0;
        while head < queue.len() {
            let node = queue[head];
            head += 1;
            for &successor in &self.successors[node] {
                if !reached[successor] {
                    reached[successor] = true;
                    queue.push(successor);
                }
            }
        }
        self.reach_order = queue;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_diamond_sets() {
        let mut cfg = SimpleCfg::new(vec![smallvec![1, 2], smallvec![3], smallvec![3], smallvec![]]);
        cfg.analyze();
        let dom3 = cfg.dominators(3).unwrap();
        assert_eq!(dom3.iter().collect::<Vec<_>>(), vec![0, 3]);
        let dom1 = cfg.dominators(1).unwrap();
        assert_eq!(dom1.iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_unreachable_has_no_set() {
        let mut cfg = SimpleCfg::new(vec![smallvec![2], smallvec![2], smallvec![]]);
        cfg.analyze();
        assert!(cfg.dominators(1).is_none());
        assert!(cfg.dominators(2).is_some());
    }

    #[test]
    fn test_loop_sets() {
        let mut cfg = SimpleCfg::new(vec![smallvec![1], smallvec![2], smallvec![1, 3], smallvec![]]);
        cfg.analyze();
        let dom3 = cfg.dominators(3).unwrap();
        assert_eq!(dom3.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }
}
