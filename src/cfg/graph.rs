//! Control-flow graph analysis.
//!
//! `analyze` computes, in order: a BFS spanning tree rooted at node 0 (each
//! reached node is numbered by its enqueue index), a post-order traversal of
//! that tree, predecessor lists, immediate dominators (Cooper, Harvey and
//! Kennedy's iterative dataflow over the BFS numbering), and dominator-tree
//! depths. Unreachable nodes keep the sentinel BFS number and stay out of
//! every predecessor list.

use smallvec::SmallVec;

/// Sentinel BFS number for nodes not reached from the root.
pub const UNREACHABLE: usize = usize::MAX;

/// Sentinel for an immediate dominator that has not been computed.
const UNSET: usize = usize::MAX;

#[derive(Debug, Clone)]
struct Node {
    successors: SmallVec<[usize; 2]>,
    predecessors: Vec<usize>,
    bfs_number: usize,
    bfs_parent: usize,
    idom: usize,
    depth: usize,
}

#[derive(Debug, Clone)]
pub struct Cfg {
    nodes: Vec<Node>,
    bfs_order: Vec<usize>,
    post_order: Vec<usize>,
}

impl Cfg {
    /// Build a graph over `successors.len()` nodes. Node 0 is the root; each
    /// node has at most two successors.
    pub fn new(successors: Vec<SmallVec<[usize; 2]>>) -> Self {
        let nodes = successors
            .into_iter()
            .map(|successors| Node {
                successors,
                predecessors: Vec::new(),
                bfs_number: UNREACHABLE,
                bfs_parent: UNSET,
                idom: UNSET,
                depth: 0,
            })
            .collect();
        Cfg { nodes, bfs_order: Vec::new(), post_order: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn successors(&self, node: usize) -> &[usize] {
        &self.nodes[node].successors
    }

    pub fn predecessors(&self, node: usize) -> &[usize] {
        &self.nodes[node].predecessors
    }

    pub fn is_reachable(&self, node: usize) -> bool {
        self.nodes[node].bfs_number != UNREACHABLE
    }

    /// BFS number of `node`, or `None` if it is unreachable.
    pub fn bfs_number(&self, node: usize) -> Option<usize> {
        match self.nodes[node].bfs_number {
            UNREACHABLE => None,
            number => Some(number),
        }
    }

    /// Post-order of the BFS spanning tree.
    pub fn post_order(&self) -> &[usize] {
        &self.post_order
    }

    /// Run every analysis in dependency order.
    pub fn analyze(&mut self) {
        self.compute_bfs();
        self.compute_post_order();
        self.compute_predecessors();
        self.compute_immediate_dominators();
        self.compute_depths();
    }

    /// Current immediate dominator of `node`. The root is its own idom.
    pub fn immediate_dominator(&self, node: usize) -> usize {
        self.nodes[node].idom
    }

    /// Number of strict dominators above `node`.
    pub fn dominator_tree_depth(&self, node: usize) -> usize {
        self.nodes[node].depth
    }

    /// Yields `node`, `idom(node)`, `idom(idom(node))`, ..., producing the
    /// root exactly once. Empty for unreachable nodes.
    pub fn dominator_iter(&self, node: usize) -> DominatorIter<'_> {
        let start = if self.is_reachable(node) { Some(node) } else { None };
        DominatorIter { cfg: self, next: start }
    }

    fn compute_bfs(&mut self) {
        if self.nodes.is_empty() {
            return;
        }
        let mut queue = vec![0];
        self.nodes[0].bfs_number = 0;
        let mut head = 0;
        while head < queue.len() {
            let node = queue[head];
            head += 1;
            for index in 0..self.nodes[node].successors.len() {
                let successor = self.nodes[node].successors[index];
                if self.nodes[successor].bfs_number == UNREACHABLE {
                    self.nodes[successor].bfs_number = queue.len();
                    self.nodes[successor].bfs_parent = node;
                    queue.push(successor);
                }
            }
        }
        self.bfs_order = queue;
    }

    fn compute_post_order(&mut self) {
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for &node in &self.bfs_order {
            let parent = self.nodes[node].bfs_parent;
            if parent != UNSET {
                children[parent].push(node);
            }
        }
        let mut order = Vec::with_capacity(self.bfs_order.len());
        if !self.bfs_order.is_empty() {
            let mut stack: Vec<(usize, usize)> = vec![(0, 0)];
            while let Some(top) = stack.last_mut() {
                let (node, next_child) = *top;
                if next_child < children[node].len() {
                    top.1 += 1;
                    stack.push((children[node][next_child], 0));
                } else {
                    order.push(node);
                    stack.pop();
                }
            }
        }
        self.post_order = order;
    }

    fn compute_predecessors(&mut self) {
        for node in &mut self.nodes {
            node.predecessors.clear();
        }
        for node in 0..self.nodes.len() {
            if self.nodes[node].bfs_number == UNREACHABLE {
                continue;
            }
            for index in 0..self.nodes[node].successors.len() {
                let successor = self.nodes[node].successors[index];
                self.nodes[successor].predecessors.push(node);
            }
        }
    }

    /// Iterative dataflow over the BFS numbering. Each round recomputes every
    /// non-root node's idom as the intersection of its predecessors with a
    /// known idom, repeating to fixpoint.
    fn compute_immediate_dominators(&mut self) {
        if self.nodes.is_empty() {
            return;
        }
        self.nodes[0].idom = 0;
        let order: Vec<usize> = self.bfs_order.iter().copied().skip(1).collect();
        let mut changed = true;
        while changed {
            changed = false;
            for &node in &order {
                let mut new_idom = UNSET;
                for index in 0..self.nodes[node].predecessors.len() {
                    let predecessor = self.nodes[node].predecessors[index];
                    if self.nodes[predecessor].idom == UNSET {
                        continue;
                    }
                    new_idom = if new_idom == UNSET {
                        predecessor
                    } else {
                        self.intersect(predecessor, new_idom)
                    };
                }
                if new_idom != UNSET && self.nodes[node].idom != new_idom {
                    self.nodes[node].idom = new_idom;
                    changed = true;
                }
            }
        }
    }

    /// Walk the finger with the larger BFS number (the deeper node, since
    /// dominators always carry smaller numbers) up its idom chain until the
    /// numbers meet; the unique numbering then makes the nodes meet too.
    fn intersect(&self, a: usize, b: usize) -> usize {
        let (mut a, mut b) = (a, b);
        while a != b {
            while self.nodes[a].bfs_number > self.nodes[b].bfs_number {
                a = self.nodes[a].idom;
            }
            while self.nodes[b].bfs_number > self.nodes[a].bfs_number {
                b = self.nodes[b].idom;
            }
        }
        a
    }

    fn compute_depths(&mut self) {
        for index in 0..self.bfs_order.len() {
            let node = self.bfs_order[index];
            let idom = self.nodes[node].idom;
            self.nodes[node].depth = if node == idom { 0 } else { self.nodes[idom].depth + 1 };
        }
    }
}

/// Finite, restartable walk up the dominator chain.
pub struct DominatorIter<'a> {
    cfg: &'a Cfg,
    next: Option<usize>,
}

impl Iterator for DominatorIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let node = self.next?;
        let idom = self.cfg.nodes[node].idom;
        self.next = if idom == node { None } else { Some(idom) };
        Some(node)
    }
}
