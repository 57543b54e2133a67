use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use navgraph_core::error::{NavError, Result};
use navgraph_core::tree::{NavigationEdge, NavigationNode, NavigationTree};

/// Maximum nesting depth of sub-trees below a root tree.
pub const MAX_NESTING_DEPTH: usize = 5;

/// Shared, immutable view of one loaded tree.
pub type TreeHandle = Arc<IndexedTree>;

/// A validated navigation tree with adjacency indexes.
#[derive(Debug)]
pub struct IndexedTree {
    tree: NavigationTree,
    depth: usize,
    node_index: HashMap<String, usize>,
    edge_index: HashMap<String, usize>,
    /// source node id -> edge positions, in insertion order
    outgoing: HashMap<String, Vec<usize>>,
    /// target node id -> edge positions, in insertion order
    incoming: HashMap<String, Vec<usize>>,
}

impl IndexedTree {
    /// Validate a tree on its own and build its indexes.
    fn build(tree: NavigationTree, depth: usize) -> Result<Self> {
        let mut node_index = HashMap::new();
        for (pos, node) in tree.nodes.iter().enumerate() {
            if node_index.insert(node.id.clone(), pos).is_some() {
                return Err(integrity(&tree.id, format!("duplicate node id '{}'", node.id)));
            }
        }

        let mut edge_index = HashMap::new();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();

        for (pos, edge) in tree.edges.iter().enumerate() {
            if edge_index.insert(edge.id.clone(), pos).is_some() {
                return Err(integrity(&tree.id, format!("duplicate edge id '{}'", edge.id)));
            }
            for endpoint in [&edge.source, &edge.target] {
                if !node_index.contains_key(endpoint) {
                    return Err(integrity(
                        &tree.id,
                        format!("edge '{}' references unknown node '{}'", edge.id, endpoint),
                    ));
                }
            }
            validate_action_sets(&tree.id, edge)?;

            outgoing.entry(edge.source.clone()).or_default().push(pos);
            incoming.entry(edge.target.clone()).or_default().push(pos);
        }

        Ok(Self {
            tree,
            depth,
            node_index,
            edge_index,
            outgoing,
            incoming,
        })
    }

    pub fn id(&self) -> &str {
        &self.tree.id
    }

    pub fn tree(&self) -> &NavigationTree {
        &self.tree
    }

    /// Nesting depth; 0 for a root tree.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn parent_tree_id(&self) -> Option<&str> {
        self.tree.parent_tree_id.as_deref()
    }

    pub fn parent_node_id(&self) -> Option<&str> {
        self.tree.parent_node_id.as_deref()
    }

    pub fn nodes(&self) -> &[NavigationNode] {
        &self.tree.nodes
    }

    pub fn edges(&self) -> &[NavigationEdge] {
        &self.tree.edges
    }

    pub fn node(&self, node_id: &str) -> Option<&NavigationNode> {
        self.node_index.get(node_id).map(|&pos| &self.tree.nodes[pos])
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.node_index.contains_key(node_id)
    }

    pub fn edge(&self, edge_id: &str) -> Option<&NavigationEdge> {
        self.edge_index.get(edge_id).map(|&pos| &self.tree.edges[pos])
    }

    /// Edge at an insertion position.
    pub fn edge_at(&self, pos: usize) -> &NavigationEdge {
        &self.tree.edges[pos]
    }

    /// Positions of edges leaving `node_id`, in insertion order.
    pub fn outgoing(&self, node_id: &str) -> &[usize] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Positions of edges entering `node_id`, in insertion order.
    pub fn incoming(&self, node_id: &str) -> &[usize] {
        self.incoming.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn entry_node_id(&self) -> Option<&str> {
        self.tree.entry_node_id()
    }
}

fn integrity(tree_id: &str, message: String) -> NavError {
    NavError::GraphIntegrity(format!("tree '{}': {}", tree_id, message))
}

fn validate_action_sets(tree_id: &str, edge: &NavigationEdge) -> Result<()> {
    if edge.action_sets.is_empty() {
        return Err(integrity(
            tree_id,
            format!("edge '{}' has no action sets", edge.id),
        ));
    }
    let mut names = HashSet::new();
    for set in &edge.action_sets {
        if !names.insert(set.name.as_str()) {
            return Err(integrity(
                tree_id,
                format!("edge '{}' has duplicate action set '{}'", edge.id, set.name),
            ));
        }
    }
    if let Some(default) = &edge.default_action_set {
        if !names.contains(default.as_str()) {
            return Err(integrity(
                tree_id,
                format!(
                    "edge '{}' default action set '{}' does not exist",
                    edge.id, default
                ),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone)]
struct StoreInner {
    trees: HashMap<String, TreeHandle>,
    /// parent tree id -> child tree ids, in attach order
    children: HashMap<String, Vec<String>>,
}

/// In-memory store of navigation trees and their nesting.
///
/// Trees are immutable once loaded; reloading a tree id swaps in a new
/// `TreeHandle`, so executions holding the previous handle are unaffected.
#[derive(Debug, Default)]
pub struct GraphStore {
    inner: RwLock<StoreInner>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate, index and attach a tree.
    ///
    /// A nested tree requires its parent to be loaded already; its entry
    /// node is synced to mirror the parent node. Reloading a tree re-syncs
    /// every attached descendant.
    pub fn load(&self, tree: NavigationTree) -> Result<TreeHandle> {
        let mut inner = self.write();
        // Work on a copy so a failed load leaves the store untouched.
        let mut next = inner.clone();

        let tree_id = tree.id.clone();
        let old_parent = next
            .trees
            .get(&tree_id)
            .and_then(|t| t.parent_tree_id().map(String::from));

        let (tree, depth) = prepare_attachment(&next, tree)?;
        let handle = Arc::new(IndexedTree::build(tree, depth)?);

        if let Some(old_parent) = old_parent {
            if let Some(siblings) = next.children.get_mut(&old_parent) {
                siblings.retain(|c| c != &tree_id);
            }
        }
        if let Some(parent) = handle.parent_tree_id() {
            next.children
                .entry(parent.to_string())
                .or_default()
                .push(tree_id.clone());
        }
        next.trees.insert(tree_id.clone(), handle.clone());

        resync_children(&mut next, &tree_id)?;

        *inner = next;
        info!(
            tree_id = %tree_id,
            nodes = handle.nodes().len(),
            edges = handle.edges().len(),
            depth = handle.depth(),
            "Navigation tree loaded"
        );
        Ok(handle)
    }

    /// Remove a tree and every tree nested below it. Returns removed ids.
    pub fn detach(&self, tree_id: &str) -> Result<Vec<String>> {
        let mut inner = self.write();
        let parent = inner
            .trees
            .get(tree_id)
            .ok_or_else(|| NavError::UnknownTree(tree_id.to_string()))?
            .parent_tree_id()
            .map(String::from);

        if let Some(parent) = parent {
            if let Some(siblings) = inner.children.get_mut(&parent) {
                siblings.retain(|c| c != tree_id);
            }
        }

        let mut removed = Vec::new();
        let mut queue = VecDeque::from([tree_id.to_string()]);
        while let Some(id) = queue.pop_front() {
            inner.trees.remove(&id);
            if let Some(children) = inner.children.remove(&id) {
                queue.extend(children);
            }
            removed.push(id);
        }

        info!(tree_id = %tree_id, removed = removed.len(), "Navigation tree detached");
        Ok(removed)
    }

    pub fn tree(&self, tree_id: &str) -> Result<TreeHandle> {
        self.read()
            .trees
            .get(tree_id)
            .cloned()
            .ok_or_else(|| NavError::UnknownTree(tree_id.to_string()))
    }

    pub fn nodes(&self, tree_id: &str) -> Result<Vec<NavigationNode>> {
        Ok(self.tree(tree_id)?.nodes().to_vec())
    }

    pub fn edges(&self, tree_id: &str) -> Result<Vec<NavigationEdge>> {
        Ok(self.tree(tree_id)?.edges().to_vec())
    }

    /// Ids of all loaded trees, sorted.
    pub fn tree_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().trees.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The sub-tree attached at `node_id` of `tree_id`, if any.
    pub fn resolve_nested(&self, tree_id: &str, node_id: &str) -> Option<TreeHandle> {
        self.subtrees_at(tree_id, node_id).into_iter().next()
    }

    /// All sub-trees attached at `node_id` of `tree_id`, in attach order.
    pub fn subtrees_at(&self, tree_id: &str, node_id: &str) -> Vec<TreeHandle> {
        let inner = self.read();
        inner
            .children
            .get(tree_id)
            .into_iter()
            .flatten()
            .filter_map(|child| inner.trees.get(child))
            .filter(|child| child.parent_node_id() == Some(node_id))
            .cloned()
            .collect()
    }

    /// The tree a nested tree hangs off, if any.
    pub fn parent_of(&self, tree_id: &str) -> Result<Option<TreeHandle>> {
        let tree = self.tree(tree_id)?;
        match tree.parent_tree_id() {
            Some(parent) => self.tree(parent).map(Some),
            None => Ok(None),
        }
    }

    /// `tree_id` followed by its ancestors up to the root.
    pub fn ancestry(&self, tree_id: &str) -> Result<Vec<TreeHandle>> {
        let inner = self.read();
        let mut chain = Vec::new();
        let mut current = Some(tree_id.to_string());
        while let Some(id) = current {
            let tree = inner
                .trees
                .get(&id)
                .cloned()
                .ok_or_else(|| NavError::UnknownTree(id.clone()))?;
            current = tree.parent_tree_id().map(String::from);
            chain.push(tree);
        }
        Ok(chain)
    }

    /// Root of the hierarchy `tree_id` belongs to.
    pub fn root_of(&self, tree_id: &str) -> Result<TreeHandle> {
        self.ancestry(tree_id)?
            .pop()
            .ok_or_else(|| NavError::UnknownTree(tree_id.to_string()))
    }

    /// Find the tree holding `node_id`, searching `preferred` first and then
    /// the whole hierarchy breadth-first from its root, shallowest tree first.
    pub fn locate(&self, preferred: &TreeHandle, node_id: &str) -> Option<TreeHandle> {
        if preferred.contains_node(node_id) {
            return Some(preferred.clone());
        }
        let root = self.root_of(preferred.id()).ok()?;
        let inner = self.read();
        let mut queue = VecDeque::from([root]);
        while let Some(tree) = queue.pop_front() {
            if tree.contains_node(node_id) {
                return Some(tree);
            }
            if let Some(children) = inner.children.get(tree.id()) {
                queue.extend(children.iter().filter_map(|c| inner.trees.get(c).cloned()));
            }
        }
        None
    }
}

/// Check a tree's parent references and sync its entry node with the parent
/// node. Returns the synced tree and its depth.
fn prepare_attachment(
    inner: &StoreInner,
    mut tree: NavigationTree,
) -> Result<(NavigationTree, usize)> {
    let (parent_tree_id, parent_node_id) = match (&tree.parent_tree_id, &tree.parent_node_id) {
        (None, None) => return Ok((tree, 0)),
        (Some(t), Some(n)) => (t.clone(), n.clone()),
        _ => {
            return Err(integrity(
                &tree.id,
                "parent tree and parent node must be set together".into(),
            ))
        }
    };

    if parent_tree_id == tree.id {
        return Err(integrity(&tree.id, "tree cannot be nested under itself".into()));
    }

    let parent = inner.trees.get(&parent_tree_id).ok_or_else(|| {
        integrity(
            &tree.id,
            format!("parent tree '{}' is not loaded", parent_tree_id),
        )
    })?;

    // Walking up from the parent must never reach this tree.
    let mut cursor = parent.parent_tree_id().map(String::from);
    while let Some(id) = cursor {
        if id == tree.id {
            return Err(integrity(&tree.id, "nesting cycle detected".into()));
        }
        cursor = inner
            .trees
            .get(&id)
            .and_then(|t| t.parent_tree_id().map(String::from));
    }

    let depth = parent.depth() + 1;
    if depth > MAX_NESTING_DEPTH {
        return Err(integrity(
            &tree.id,
            format!("nesting depth {} exceeds {}", depth, MAX_NESTING_DEPTH),
        ));
    }

    let parent_node = parent.node(&parent_node_id).ok_or_else(|| {
        integrity(
            &tree.id,
            format!(
                "parent node '{}' does not exist in tree '{}'",
                parent_node_id, parent_tree_id
            ),
        )
    })?;

    sync_mirror_node(&mut tree, parent_node);
    Ok((tree, depth))
}

/// Make the sub-tree's entry node mirror the parent node.
fn sync_mirror_node(tree: &mut NavigationTree, parent_node: &NavigationNode) {
    match tree.nodes.iter_mut().find(|n| n.id == parent_node.id) {
        Some(mirror) => {
            mirror.label = parent_node.label.clone();
            mirror.kind = parent_node.kind;
            mirror.verifications = parent_node.verifications.clone();
        }
        None => tree.nodes.insert(0, parent_node.clone()),
    }
    debug!(tree_id = %tree.id, node_id = %parent_node.id, "Synced sub-tree entry node");
}

/// Rebuild every descendant of `tree_id` against the current version of
/// its parent.
fn resync_children(inner: &mut StoreInner, tree_id: &str) -> Result<()> {
    let children = inner.children.get(tree_id).cloned().unwrap_or_default();
    for child_id in children {
        let Some(child) = inner.trees.get(&child_id).cloned() else {
            continue;
        };
        let (tree, depth) = prepare_attachment(inner, child.tree().clone())?;
        let rebuilt = Arc::new(IndexedTree::build(tree, depth)?);
        inner.trees.insert(child_id.clone(), rebuilt);
        resync_children(inner, &child_id)?;
    }
    Ok(())
}
