//! Navigation tree data model.
//!
//! A `NavigationTree` is a directed multigraph of device screens (nodes) and
//! transitions (edges). Trees may be nested: a sub-tree hangs off a node of its
//! parent tree and mirrors that node as its own entry point.

use serde::{Deserialize, Serialize};

/// Kind of device interaction an action performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Remote-control key press (IR/CEC/BT remote).
    #[default]
    Remote,
    Adb,
    Appium,
    Web,
    Desktop,
    Infrared,
    /// Pure delay, no device I/O.
    Wait,
}

/// A single device action, resolved into a typed variant at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub kind: ActionKind,
    /// Controller command, e.g. `press_key` or `click_element`.
    pub command: String,
    /// Opaque command parameters passed through to the controller.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Settle time after the action completes.
    #[serde(default)]
    pub wait_ms: u64,
}

impl Action {
    pub fn new(kind: ActionKind, command: impl Into<String>) -> Self {
        Self {
            kind,
            command: command.into(),
            params: serde_json::Value::Null,
            wait_ms: 0,
        }
    }

    /// Shorthand for a remote key press action.
    pub fn remote(command: impl Into<String>) -> Self {
        Self::new(ActionKind::Remote, command)
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_wait_ms(mut self, wait_ms: u64) -> Self {
        self.wait_ms = wait_ms;
        self
    }
}

/// Kind of check a verification performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationKind {
    #[default]
    Image,
    Text,
    Audio,
    Video,
    Adb,
    Appium,
}

/// A verification descriptor attached to a node. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    #[serde(default)]
    pub kind: VerificationKind,
    pub command: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Verification {
    pub fn new(kind: VerificationKind, command: impl Into<String>) -> Self {
        Self {
            kind,
            command: command.into(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Kind of screen a node represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Entry,
    Menu,
    #[default]
    Screen,
    Dialog,
}

/// A screen in the navigation tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationNode {
    /// Unique within its tree.
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub verifications: Vec<Verification>,
}

impl NavigationNode {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: NodeKind::default(),
            verifications: vec![],
        }
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_verification(mut self, verification: Verification) -> Self {
        self.verifications.push(verification);
        self
    }
}

/// Traversal direction of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// source -> target
    Forward,
    /// target -> source
    Reverse,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Reverse => write!(f, "reverse"),
        }
    }
}

/// A named bundle of action sequences attached to an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSet {
    pub name: String,
    #[serde(default)]
    pub forward_actions: Vec<Action>,
    /// Empty when the transition cannot be walked backwards.
    #[serde(default)]
    pub reverse_actions: Vec<Action>,
    /// Run once when a forward or reverse action fails.
    #[serde(default)]
    pub retry_actions: Vec<Action>,
    /// Recovery sequence run when the retry also fails.
    #[serde(default)]
    pub failure_actions: Vec<Action>,
}

impl ActionSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            forward_actions: vec![],
            reverse_actions: vec![],
            retry_actions: vec![],
            failure_actions: vec![],
        }
    }

    pub fn with_forward(mut self, actions: Vec<Action>) -> Self {
        self.forward_actions = actions;
        self
    }

    pub fn with_reverse(mut self, actions: Vec<Action>) -> Self {
        self.reverse_actions = actions;
        self
    }

    pub fn with_retry(mut self, actions: Vec<Action>) -> Self {
        self.retry_actions = actions;
        self
    }

    pub fn with_failure(mut self, actions: Vec<Action>) -> Self {
        self.failure_actions = actions;
        self
    }

    /// Whether a reverse path is defined.
    pub fn is_reversible(&self) -> bool {
        !self.reverse_actions.is_empty()
    }

    /// The main action list for a direction.
    pub fn actions(&self, direction: Direction) -> &[Action] {
        match direction {
            Direction::Forward => &self.forward_actions,
            Direction::Reverse => &self.reverse_actions,
        }
    }
}

/// A transition between two nodes of the same tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub action_sets: Vec<ActionSet>,
    /// Name of the action set used for traversal; the first set when unset.
    #[serde(default)]
    pub default_action_set: Option<String>,
}

impl NavigationEdge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            action_sets: vec![],
            default_action_set: None,
        }
    }

    pub fn with_action_set(mut self, set: ActionSet) -> Self {
        self.action_sets.push(set);
        self
    }

    pub fn with_default_action_set(mut self, name: impl Into<String>) -> Self {
        self.default_action_set = Some(name.into());
        self
    }

    /// The action set traversal uses.
    pub fn primary_action_set(&self) -> Option<&ActionSet> {
        match &self.default_action_set {
            Some(name) => self.action_sets.iter().find(|s| &s.name == name),
            None => self.action_sets.first(),
        }
    }

    /// Whether the edge may be walked target -> source.
    pub fn is_bidirectional(&self) -> bool {
        self.primary_action_set().is_some_and(ActionSet::is_reversible)
    }

    /// Node reached when walking this edge in `direction`.
    pub fn destination(&self, direction: Direction) -> &str {
        match direction {
            Direction::Forward => &self.target,
            Direction::Reverse => &self.source,
        }
    }

    /// Node the walk starts from in `direction`.
    pub fn origin(&self, direction: Direction) -> &str {
        match direction {
            Direction::Forward => &self.source,
            Direction::Reverse => &self.target,
        }
    }
}

/// A navigation tree for one device interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationTree {
    pub id: String,
    /// Owning user interface, e.g. `android_tv_home`.
    pub interface_name: String,
    #[serde(default)]
    pub nodes: Vec<NavigationNode>,
    #[serde(default)]
    pub edges: Vec<NavigationEdge>,
    #[serde(default)]
    pub parent_tree_id: Option<String>,
    /// Node of the parent tree this sub-tree hangs off.
    #[serde(default)]
    pub parent_node_id: Option<String>,
}

impl NavigationTree {
    pub fn new(id: impl Into<String>, interface_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            interface_name: interface_name.into(),
            nodes: vec![],
            edges: vec![],
            parent_tree_id: None,
            parent_node_id: None,
        }
    }

    pub fn with_node(mut self, node: NavigationNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: NavigationEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Attach this tree below `parent_node_id` of `parent_tree_id`.
    pub fn nested_under(
        mut self,
        parent_tree_id: impl Into<String>,
        parent_node_id: impl Into<String>,
    ) -> Self {
        self.parent_tree_id = Some(parent_tree_id.into());
        self.parent_node_id = Some(parent_node_id.into());
        self
    }

    pub fn is_nested(&self) -> bool {
        self.parent_tree_id.is_some()
    }

    pub fn node(&self, node_id: &str) -> Option<&NavigationNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Where navigation starts when no position is known: the mirrored
    /// parent node for sub-trees, otherwise the first `entry` node.
    pub fn entry_node_id(&self) -> Option<&str> {
        if let Some(parent_node) = &self.parent_node_id {
            return Some(parent_node.as_str());
        }
        self.nodes
            .iter()
            .find(|n| n.kind == NodeKind::Entry)
            .map(|n| n.id.as_str())
    }
}
