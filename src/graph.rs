//! Arena-allocated graph primitives for the workflow DAG.
//!
//! Nodes live in a single arena and are addressed by a stable [`NodeId`].
//! Parent/child adjacency is tracked in two maps rather than through
//! pointer-like back-references, so the structure never needs `Rc`/`RefCell`
//! to express the mutual parent-child linkage a workflow graph requires.

use rustc_hash::FxHashMap;

/// Stable index into the graph arena. Indices are never reused within a
/// single [`Graph`], so a `NodeId` remains valid for the graph's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Direction of traversal relative to a node: towards children or parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Follow child edges (forward, downstream).
    Children,
    /// Follow parent edges (backward, upstream).
    Parents,
}

/// An edge-labeled adjacency list: neighbor IDs in insertion order, paired
/// with the label attached when the edge was added.
#[derive(Debug, Clone, Default)]
struct Adjacency<L> {
    order: Vec<NodeId>,
    labels: FxHashMap<NodeId, L>,
}

impl<L: Clone> Adjacency<L> {
    fn insert(&mut self, id: NodeId, label: L) {
        if !self.labels.contains_key(&id) {
            self.order.push(id);
        }
        self.labels.insert(id, label);
    }

    fn remove(&mut self, id: NodeId) -> Option<L> {
        let label = self.labels.remove(&id);
        if label.is_some() {
            self.order.retain(|n| *n != id);
        }
        label
    }

    fn iter(&self) -> impl Iterator<Item = (NodeId, &L)> {
        self.order.iter().map(move |id| (*id, &self.labels[id]))
    }

    fn contains(&self, id: NodeId) -> bool {
        self.labels.contains_key(&id)
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// A graph arena carrying edge labels of type `L`.
///
/// Node payloads are not stored here; callers typically keep a side table
/// (e.g. `Job` objects) keyed by `NodeId` and use `Graph` purely for
/// structure and traversal.
#[derive(Debug, Clone, Default)]
pub struct Graph<L> {
    count: u32,
    parents: Vec<Adjacency<L>>,
    children: Vec<Adjacency<L>>,
}

impl<L: Clone> Graph<L> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            count: 0,
            parents: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Allocate a new, unconnected node and return its stable ID.
    pub fn add_node(&mut self) -> NodeId {
        let id = NodeId(self.count);
        self.count += 1;
        self.parents.push(Adjacency::default());
        self.children.push(Adjacency::default());
        id
    }

    /// Total number of nodes ever allocated.
    pub fn len(&self) -> usize {
        self.count as usize
    }

    /// Whether the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Add a parent edge `parent -> child` labeled `label`. The reciprocal
    /// child edge on `parent` is installed at the same time, so the two
    /// adjacency maps never drift apart.
    pub fn add_parent(&mut self, child: NodeId, parent: NodeId, label: L) {
        self.parents[child.index()].insert(parent, label.clone());
        self.children[parent.index()].insert(child, label);
    }

    /// Add a child edge `parent -> child` labeled `label`. Equivalent to
    /// `add_parent(child, parent, label)`.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId, label: L) {
        self.add_parent(child, parent, label);
    }

    /// Detach the parent edge `parent -> child`, if present, from both
    /// directions. Returns the edge label that was removed.
    pub fn rm_parent(&mut self, child: NodeId, parent: NodeId) -> Option<L> {
        let label = self.parents[child.index()].remove(parent);
        self.children[parent.index()].remove(child);
        label
    }

    /// Detach the child edge `parent -> child`. Equivalent to
    /// `rm_parent(child, parent)`.
    pub fn rm_child(&mut self, parent: NodeId, child: NodeId) -> Option<L> {
        self.rm_parent(child, parent)
    }

    /// Parents of `node` with their edge labels, in insertion order.
    pub fn parents(&self, node: NodeId) -> impl Iterator<Item = (NodeId, &L)> {
        self.parents[node.index()].iter()
    }

    /// Children of `node` with their edge labels, in insertion order.
    pub fn children(&self, node: NodeId) -> impl Iterator<Item = (NodeId, &L)> {
        self.children[node.index()].iter()
    }

    /// Number of parents of `node`.
    pub fn parent_count(&self, node: NodeId) -> usize {
        self.parents[node.index()].len()
    }

    /// Number of children of `node`.
    pub fn child_count(&self, node: NodeId) -> usize {
        self.children[node.index()].len()
    }

    fn neighbors(&self, node: NodeId, direction: Direction) -> &Adjacency<L> {
        match direction {
            Direction::Children => &self.children[node.index()],
            Direction::Parents => &self.parents[node.index()],
        }
    }

    /// Iteratively visit every node reachable from `seeds` following
    /// `direction`, each exactly once. Order is deterministic for a given
    /// input but otherwise unspecified (reverse-of-insertion stack order).
    pub fn dfs(&self, seeds: impl IntoIterator<Item = NodeId>, direction: Direction) -> Vec<NodeId> {
        let mut visited = rustc_hash::FxHashSet::default();
        let mut stack: Vec<NodeId> = seeds.into_iter().collect();
        let mut order = Vec::new();

        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            order.push(node);
            for (neighbor, _) in self.neighbors(node, direction).iter() {
                if !visited.contains(&neighbor) {
                    stack.push(neighbor);
                }
            }
        }

        order
    }

    /// Nodes reachable from `seeds` with no children among the reachable set.
    pub fn leafs(&self, seeds: impl IntoIterator<Item = NodeId>) -> Vec<NodeId> {
        self.dfs(seeds, Direction::Children)
            .into_iter()
            .filter(|n| self.child_count(*n) == 0)
            .collect()
    }

    /// Nodes reachable from `seeds` with no parents among the reachable set.
    pub fn roots(&self, seeds: impl IntoIterator<Item = NodeId>) -> Vec<NodeId> {
        self.dfs(seeds, Direction::Parents)
            .into_iter()
            .filter(|n| self.parent_count(*n) == 0)
            .collect()
    }

    /// Enumerate every simple cycle reachable from `seeds` following
    /// `direction`, each as a path whose first and last elements are equal.
    ///
    /// Uses iterative DFS with an on-stack marker: `tree` records, for every
    /// node pushed onto the current path, the branches not yet explored
    /// (`Some(_)`) or `None` once the node's subtree has been fully explored
    /// and popped. A cycle is found when an edge targets a node that is
    /// still `Some` in `tree` (i.e. currently on the path).
    pub fn cycles(
        &self,
        seeds: impl IntoIterator<Item = NodeId>,
        direction: Direction,
    ) -> Vec<Vec<NodeId>> {
        let mut found = Vec::new();
        let mut globally_done = rustc_hash::FxHashSet::default();

        for seed in seeds {
            if globally_done.contains(&seed) {
                continue;
            }

            let mut path = vec![seed];
            let mut tree: FxHashMap<NodeId, Option<Vec<NodeId>>> = FxHashMap::default();
            tree.insert(
                seed,
                Some(self.neighbors(seed, direction).order.clone()),
            );

            while let Some(&top) = path.last() {
                let branches = tree.get_mut(&top).unwrap();
                let Some(node) = branches.as_mut().and_then(|b| b.pop()) else {
                    tree.insert(top, None);
                    globally_done.insert(top);
                    path.pop();
                    continue;
                };

                match tree.get(&node) {
                    None => {
                        path.push(node);
                        tree.insert(
                            node,
                            Some(self.neighbors(node, direction).order.clone()),
                        );
                    }
                    Some(Some(_)) => {
                        // `node` is on the current path: closes a cycle.
                        let mut cycle = path.clone();
                        cycle.push(node);
                        found.push(cycle);
                    }
                    Some(None) => {
                        // Already fully explored in a previous subtree; skip.
                    }
                }
            }
        }

        found
    }
}
