use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::debug;

use navgraph_core::error::{NavError, Result};
use navgraph_core::tree::{Direction, NavigationEdge};

use super::store::{GraphStore, IndexedTree, TreeHandle};

/// One edge traversal of a computed path.
#[derive(Debug, Clone, Serialize)]
pub struct PathHop {
    /// Tree the edge belongs to.
    pub tree_id: String,
    pub edge: NavigationEdge,
    pub direction: Direction,
}

impl PathHop {
    /// Node the hop starts from.
    pub fn from_node(&self) -> &str {
        self.edge.origin(self.direction)
    }

    /// Node the hop arrives at.
    pub fn to_node(&self) -> &str {
        self.edge.destination(self.direction)
    }
}

/// Breadth-first pathfinding over navigation trees.
///
/// Every edge with an action set is a forward arc (source -> target); edges
/// whose action set defines reverse actions are also a reverse arc. Ties are
/// broken by edge insertion order, so the result is deterministic.
pub struct Pathfinder<'a> {
    store: &'a GraphStore,
}

impl<'a> Pathfinder<'a> {
    pub fn new(store: &'a GraphStore) -> Self {
        Self { store }
    }

    /// Compute the hops from `from` to `to`, crossing nested trees as needed.
    ///
    /// Node ids are resolved in `handle` first, then anywhere in its
    /// hierarchy. `from == to` yields an empty path.
    pub fn find_path(&self, handle: &TreeHandle, from: &str, to: &str) -> Result<Vec<PathHop>> {
        let from_tree = self.locate(handle, from)?;
        let to_tree = self.locate(handle, to)?;

        if from == to {
            return Ok(vec![]);
        }

        if from_tree.id() == to_tree.id() {
            return bfs(&from_tree, from, to).ok_or_else(|| unreachable(from, to));
        }

        let up = self.store.ancestry(from_tree.id())?;
        let down = self.store.ancestry(to_tree.id())?;
        let lca_pos_up = up
            .iter()
            .position(|t| down.iter().any(|d| d.id() == t.id()))
            .ok_or_else(|| unreachable(from, to))?;
        let lca_id = up[lca_pos_up].id().to_string();
        let lca_pos_down = down
            .iter()
            .position(|d| d.id() == lca_id)
            .ok_or_else(|| unreachable(from, to))?;

        let mut path = Vec::new();
        let mut current = from.to_string();

        // Ascend: leave each sub-tree through its mirrored parent node.
        for tree in &up[..lca_pos_up] {
            let exit = tree
                .parent_node_id()
                .ok_or_else(|| unreachable(from, to))?;
            path.extend(bfs(tree, &current, exit).ok_or_else(|| unreachable(from, to))?);
            current = exit.to_string();
        }

        // Descend: walk to the anchor node of each sub-tree on the way down.
        let mut tree = up[lca_pos_up].clone();
        for child in down[..lca_pos_down].iter().rev() {
            let anchor = child
                .parent_node_id()
                .ok_or_else(|| unreachable(from, to))?;
            path.extend(bfs(&tree, &current, anchor).ok_or_else(|| unreachable(from, to))?);
            current = anchor.to_string();
            tree = child.clone();
        }

        path.extend(bfs(&tree, &current, to).ok_or_else(|| unreachable(from, to))?);

        debug!(
            from = %from,
            to = %to,
            hops = path.len(),
            trees_crossed = lca_pos_up + lca_pos_down,
            "Cross-tree path computed"
        );
        Ok(path)
    }

    fn locate(&self, handle: &TreeHandle, node_id: &str) -> Result<TreeHandle> {
        self.store
            .locate(handle, node_id)
            .ok_or_else(|| NavError::UnknownNode {
                tree_id: handle.id().to_string(),
                node_id: node_id.to_string(),
            })
    }
}

fn unreachable(from: &str, to: &str) -> NavError {
    NavError::UnreachableNode {
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Arcs leaving `node` as (edge position, direction), in insertion order.
fn arcs(tree: &IndexedTree, node: &str) -> Vec<(usize, Direction)> {
    let mut arcs: Vec<(usize, Direction)> = tree
        .outgoing(node)
        .iter()
        .filter(|&&pos| tree.edge_at(pos).primary_action_set().is_some())
        .map(|&pos| (pos, Direction::Forward))
        .chain(
            tree.incoming(node)
                .iter()
                .filter(|&&pos| tree.edge_at(pos).is_bidirectional())
                .map(|&pos| (pos, Direction::Reverse)),
        )
        .filter(|&(pos, _)| {
            let edge = tree.edge_at(pos);
            edge.source != edge.target
        })
        .collect();
    arcs.sort_by_key(|&(pos, direction)| (pos, direction == Direction::Reverse));
    arcs
}

/// Shortest hop sequence within one tree, `None` when unreachable.
fn bfs(tree: &IndexedTree, from: &str, to: &str) -> Option<Vec<PathHop>> {
    if from == to {
        return Some(vec![]);
    }
    if !tree.contains_node(from) || !tree.contains_node(to) {
        return None;
    }

    // node -> (edge position, direction) used to reach it
    let mut came_from: HashMap<&str, (usize, Direction)> = HashMap::new();
    let mut queue = VecDeque::from([from]);

    while let Some(node) = queue.pop_front() {
        for (pos, direction) in arcs(tree, node) {
            let next = tree.edge_at(pos).destination(direction);
            if next == from || came_from.contains_key(next) {
                continue;
            }
            came_from.insert(next, (pos, direction));
            if next == to {
                return Some(rebuild(tree, &came_from, from, to));
            }
            queue.push_back(next);
        }
    }
    None
}

fn rebuild(
    tree: &IndexedTree,
    came_from: &HashMap<&str, (usize, Direction)>,
    from: &str,
    to: &str,
) -> Vec<PathHop> {
    let mut hops = Vec::new();
    let mut cursor = to;
    while cursor != from {
        let Some(&(pos, direction)) = came_from.get(cursor) else {
            break;
        };
        let edge = tree.edge_at(pos);
        hops.push(PathHop {
            tree_id: tree.id().to_string(),
            edge: edge.clone(),
            direction,
        });
        cursor = edge.origin(direction);
    }
    hops.reverse();
    hops
}

#[cfg(test)]
mod tests {
    use super::*;
    use navgraph_test_utils::{home_search_player_tree, one_way_edge, tree_with_nodes, two_way_edge};

    fn hops(path: &[PathHop]) -> Vec<(String, Direction)> {
        path.iter().map(|h| (h.edge.id.clone(), h.direction)).collect()
    }

    fn loaded(store: &GraphStore) -> TreeHandle {
        store.load(home_search_player_tree()).unwrap()
    }

    #[test]
    fn test_same_node_is_empty_path() {
        let store = GraphStore::new();
        let tv = loaded(&store);
        for node in ["home", "search", "player"] {
            assert!(Pathfinder::new(&store).find_path(&tv, node, node).unwrap().is_empty());
        }
    }

    #[test]
    fn test_forward_path() {
        let store = GraphStore::new();
        let tv = loaded(&store);
        let path = Pathfinder::new(&store).find_path(&tv, "home", "player").unwrap();
        assert_eq!(
            hops(&path),
            vec![
                ("home_search".to_string(), Direction::Forward),
                ("search_player".to_string(), Direction::Forward),
            ]
        );
        assert_eq!(path[0].from_node(), "home");
        assert_eq!(path[1].to_node(), "player");
    }

    #[test]
    fn test_bidirectional_edge_used_in_reverse() {
        let store = GraphStore::new();
        let tv = loaded(&store);
        let path = Pathfinder::new(&store).find_path(&tv, "search", "home").unwrap();
        assert_eq!(hops(&path), vec![("home_search".to_string(), Direction::Reverse)]);
        assert_eq!(path[0].from_node(), "search");
        assert_eq!(path[0].to_node(), "home");
    }

    #[test]
    fn test_directional_edge_not_reversed() {
        let store = GraphStore::new();
        let tv = loaded(&store);
        let err = Pathfinder::new(&store).find_path(&tv, "player", "home").unwrap_err();
        match err {
            NavError::UnreachableNode { from, to } => {
                assert_eq!(from, "player");
                assert_eq!(to, "home");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_node() {
        let store = GraphStore::new();
        let tv = loaded(&store);
        assert!(matches!(
            Pathfinder::new(&store).find_path(&tv, "home", "ghost"),
            Err(NavError::UnknownNode { .. })
        ));
    }

    #[test]
    fn test_shortest_path_wins() {
        let store = GraphStore::new();
        let tree = tree_with_nodes("tv", &["a", "b", "c", "d"])
            .with_edge(one_way_edge("ab", "a", "b"))
            .with_edge(one_way_edge("bc", "b", "c"))
            .with_edge(one_way_edge("cd", "c", "d"))
            .with_edge(one_way_edge("ad", "a", "d"));
        let tv = store.load(tree).unwrap();
        let path = Pathfinder::new(&store).find_path(&tv, "a", "d").unwrap();
        assert_eq!(hops(&path), vec![("ad".to_string(), Direction::Forward)]);
    }

    #[test]
    fn test_ties_broken_by_insertion_order() {
        let store = GraphStore::new();
        let tree = tree_with_nodes("tv", &["a", "b", "c", "d"])
            .with_edge(one_way_edge("a_c", "a", "c"))
            .with_edge(one_way_edge("a_b", "a", "b"))
            .with_edge(one_way_edge("b_d", "b", "d"))
            .with_edge(one_way_edge("c_d", "c", "d"));
        let tv = store.load(tree).unwrap();
        let path = Pathfinder::new(&store).find_path(&tv, "a", "d").unwrap();
        assert_eq!(
            hops(&path),
            vec![
                ("a_c".to_string(), Direction::Forward),
                ("c_d".to_string(), Direction::Forward),
            ]
        );
    }

    #[test]
    fn test_parallel_edges_prefer_first() {
        let store = GraphStore::new();
        let tree = tree_with_nodes("tv", &["a", "b"])
            .with_edge(one_way_edge("slow", "a", "b"))
            .with_edge(one_way_edge("fast", "a", "b"));
        let tv = store.load(tree).unwrap();
        let path = Pathfinder::new(&store).find_path(&tv, "a", "b").unwrap();
        assert_eq!(path[0].edge.id, "slow");
    }

    fn nested_store() -> (GraphStore, TreeHandle) {
        // tv: home <-> settings, home <-> apps
        // settings-tree (under settings): settings <-> network -> wifi
        // apps-tree (under apps): apps <-> netflix
        let store = GraphStore::new();
        let root = store
            .load(
                tree_with_nodes("tv", &["home", "settings", "apps"])
                    .with_edge(two_way_edge("home_settings", "home", "settings"))
                    .with_edge(two_way_edge("home_apps", "home", "apps")),
            )
            .unwrap();
        store
            .load(
                tree_with_nodes("settings-tree", &["network", "wifi"])
                    .with_edge(two_way_edge("settings_network", "settings", "network"))
                    .with_edge(one_way_edge("network_wifi", "network", "wifi"))
                    .nested_under("tv", "settings"),
            )
            .unwrap();
        store
            .load(
                tree_with_nodes("apps-tree", &["netflix"])
                    .with_edge(two_way_edge("apps_netflix", "apps", "netflix"))
                    .nested_under("tv", "apps"),
            )
            .unwrap();
        (store, root)
    }

    #[test]
    fn test_descend_into_subtree() {
        let (store, root) = nested_store();
        let path = Pathfinder::new(&store).find_path(&root, "home", "wifi").unwrap();
        assert_eq!(
            hops(&path),
            vec![
                ("home_settings".to_string(), Direction::Forward),
                ("settings_network".to_string(), Direction::Forward),
                ("network_wifi".to_string(), Direction::Forward),
            ]
        );
        assert_eq!(path[0].tree_id, "tv");
        assert_eq!(path[1].tree_id, "settings-tree");
    }

    #[test]
    fn test_ascend_and_descend_between_siblings() {
        let (store, root) = nested_store();
        let path = Pathfinder::new(&store).find_path(&root, "network", "netflix").unwrap();
        assert_eq!(
            hops(&path),
            vec![
                ("settings_network".to_string(), Direction::Reverse),
                ("home_settings".to_string(), Direction::Reverse),
                ("home_apps".to_string(), Direction::Forward),
                ("apps_netflix".to_string(), Direction::Forward),
            ]
        );
    }

    #[test]
    fn test_cross_tree_unreachable() {
        let (store, root) = nested_store();
        // wifi has no way back out of the settings tree
        let err = Pathfinder::new(&store).find_path(&root, "wifi", "home").unwrap_err();
        assert!(matches!(err, NavError::UnreachableNode { ref to, .. } if to == "home"));
    }

    #[test]
    fn test_path_from_subtree_handle() {
        let (store, _) = nested_store();
        let sub = store.tree("settings-tree").unwrap();
        let path = Pathfinder::new(&store).find_path(&sub, "network", "home").unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path.last().unwrap().to_node(), "home");
    }

    #[test]
    fn test_paths_never_repeat_an_edge() {
        let (store, root) = nested_store();
        let nodes = ["home", "settings", "apps", "network", "wifi", "netflix"];
        let finder = Pathfinder::new(&store);
        for from in nodes {
            for to in nodes {
                let Ok(path) = finder.find_path(&root, from, to) else {
                    continue;
                };
                let mut seen = std::collections::HashSet::new();
                for hop in &path {
                    assert!(
                        seen.insert((hop.tree_id.clone(), hop.edge.id.clone())),
                        "{from} -> {to} repeats {}",
                        hop.edge.id
                    );
                }
            }
        }
    }
}
