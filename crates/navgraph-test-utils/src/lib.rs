//! Shared test utilities for navgraph crates: tree fixtures and scripted
//! device/verification collaborators.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;

use navgraph_core::error::{NavError, Result};
use navgraph_core::traits::{DeviceController, VerificationProvider};
use navgraph_core::tree::{
    Action, ActionSet, NavigationEdge, NavigationNode, NavigationTree, NodeKind, Verification,
};
use navgraph_core::types::ActionOutcome;

// ---------------------------------------------------------------------------
// Tree fixtures
// ---------------------------------------------------------------------------

/// A tree with one node per id (label = id). The first node is the entry.
pub fn tree_with_nodes(tree_id: &str, node_ids: &[&str]) -> NavigationTree {
    let mut tree = NavigationTree::new(tree_id, "test_interface");
    for (i, id) in node_ids.iter().enumerate() {
        let kind = if i == 0 { NodeKind::Entry } else { NodeKind::Screen };
        tree = tree.with_node(NavigationNode::new(*id, *id).with_kind(kind));
    }
    tree
}

/// An edge without action sets.
pub fn edge(id: &str, source: &str, target: &str) -> NavigationEdge {
    NavigationEdge::new(id, source, target)
}

/// Forward command of the fixture edges.
pub fn forward_command(edge_id: &str) -> String {
    format!("{}_fwd", edge_id)
}

/// Reverse command of the fixture edges.
pub fn reverse_command(edge_id: &str) -> String {
    format!("{}_rev", edge_id)
}

/// A directional edge: one forward action `<id>_fwd`.
pub fn one_way_edge(id: &str, source: &str, target: &str) -> NavigationEdge {
    edge(id, source, target).with_action_set(
        ActionSet::new("default").with_forward(vec![Action::remote(forward_command(id))]),
    )
}

/// A bidirectional edge: forward `<id>_fwd`, reverse `<id>_rev`.
pub fn two_way_edge(id: &str, source: &str, target: &str) -> NavigationEdge {
    edge(id, source, target).with_action_set(
        ActionSet::new("default")
            .with_forward(vec![Action::remote(forward_command(id))])
            .with_reverse(vec![Action::remote(reverse_command(id))]),
    )
}

/// `home <-> search -> player`, the canonical fixture.
///
/// Edge ids: `home_search` (bidirectional), `search_player` (forward only).
pub fn home_search_player_tree() -> NavigationTree {
    tree_with_nodes("tv", &["home", "search", "player"])
        .with_edge(two_way_edge("home_search", "home", "search"))
        .with_edge(one_way_edge("search_player", "search", "player"))
}

// ---------------------------------------------------------------------------
// Scripted device controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Scripted {
    Outcome(ActionOutcome),
    Error(String),
}

/// Device controller that replays scripted outcomes per command.
///
/// Commands without a script (or with an exhausted one) succeed, unless they
/// were marked with [`fail_always`](Self::fail_always).
#[derive(Default)]
pub struct ScriptedController {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    always_fail: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue outcomes for a command, consumed one per call.
    pub fn script(&self, command: &str, outcomes: Vec<ActionOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .extend(outcomes.into_iter().map(Scripted::Outcome));
    }

    /// Queue a controller error for the next call of a command.
    pub fn script_error(&self, command: &str, message: &str) {
        self.scripts
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push_back(Scripted::Error(message.to_string()));
    }

    /// Every call of this command fails.
    pub fn fail_always(&self, command: &str) {
        self.always_fail.lock().unwrap().insert(command.to_string());
    }

    /// Commands executed so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of times a command was executed.
    pub fn call_count(&self, command: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    fn next_outcome(&self, command: &str) -> Scripted {
        self.calls.lock().unwrap().push(command.to_string());
        if self.always_fail.lock().unwrap().contains(command) {
            return Scripted::Outcome(
                ActionOutcome::failure(format!("{} failed", command))
                    .with_evidence(format!("/captures/{}.png", command)),
            );
        }
        self.scripts
            .lock()
            .unwrap()
            .get_mut(command)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Scripted::Outcome(ActionOutcome::success(format!("{} ok", command))))
    }
}

impl DeviceController for ScriptedController {
    fn execute(&self, action: &Action) -> BoxFuture<'_, Result<ActionOutcome>> {
        let command = action.command.clone();
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.next_outcome(&command) {
                Scripted::Outcome(outcome) => Ok(outcome),
                Scripted::Error(message) => Err(NavError::Device(message)),
            }
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Controller whose calls block until [`open`](Self::open) is called.
pub struct GatedController {
    inner: ScriptedController,
    gate_tx: watch::Sender<bool>,
    gate_rx: watch::Receiver<bool>,
    waiting: AtomicUsize,
}

impl GatedController {
    pub fn new() -> Self {
        let (gate_tx, gate_rx) = watch::channel(false);
        Self {
            inner: ScriptedController::new(),
            gate_tx,
            gate_rx,
            waiting: AtomicUsize::new(0),
        }
    }

    /// Release all current and future calls.
    pub fn open(&self) {
        let _ = self.gate_tx.send(true);
    }

    /// Calls currently blocked on the gate.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &ScriptedController {
        &self.inner
    }
}

impl Default for GatedController {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceController for GatedController {
    fn execute(&self, action: &Action) -> BoxFuture<'_, Result<ActionOutcome>> {
        let action = action.clone();
        Box::pin(async move {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let mut rx = self.gate_rx.clone();
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            self.inner.execute(&action).await
        })
    }
}

/// Controller that panics on every call, simulating a worker crash.
pub struct PanickingController;

impl DeviceController for PanickingController {
    fn execute(&self, action: &Action) -> BoxFuture<'_, Result<ActionOutcome>> {
        let command = action.command.clone();
        Box::pin(async move { crash(&command) })
    }
}

fn crash(command: &str) -> Result<ActionOutcome> {
    panic!("controller crashed on {}", command)
}

// ---------------------------------------------------------------------------
// Verification provider
// ---------------------------------------------------------------------------

/// Verification provider that passes everything except configured commands.
#[derive(Default)]
pub struct StaticVerifier {
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifications with this command fail.
    pub fn fail(&self, command: &str) {
        self.failing.lock().unwrap().insert(command.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl VerificationProvider for StaticVerifier {
    fn run(&self, verification: &Verification) -> BoxFuture<'_, Result<ActionOutcome>> {
        let command = verification.command.clone();
        Box::pin(async move {
            self.calls.lock().unwrap().push(command.clone());
            if self.failing.lock().unwrap().contains(&command) {
                Ok(ActionOutcome::failure(format!("{} not matched", command))
                    .with_evidence(format!("/captures/verify_{}.png", command)))
            } else {
                Ok(ActionOutcome::success(format!("{} matched", command)))
            }
        })
    }
}
