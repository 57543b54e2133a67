use serde::{Deserialize, Serialize};

use navgraph_core::error::{NavError, Result};
use navgraph_core::tree::Action;
use navgraph_core::types::ExecutionKind;

/// Navigate to `to` within the hierarchy of `tree_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigateRequest {
    pub tree_id: String,
    /// Starting node; the tracked position or the entry node when unset.
    #[serde(default)]
    pub from: Option<String>,
    pub to: String,
    /// Run the target node's verifications after the last hop.
    #[serde(default)]
    pub verify_target: bool,
}

impl NavigateRequest {
    pub fn new(tree_id: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            tree_id: tree_id.into(),
            from: None,
            to: to.into(),
            verify_target: false,
        }
    }

    pub fn from_node(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn verify_target(mut self) -> Self {
        self.verify_target = true;
        self
    }
}

/// A standalone sequence of device actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionBatch {
    #[serde(default = "default_batch_label")]
    pub label: String,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub retry_actions: Vec<Action>,
    #[serde(default)]
    pub failure_actions: Vec<Action>,
}

fn default_batch_label() -> String {
    "actions".to_string()
}

impl ActionBatch {
    pub fn new(label: impl Into<String>, actions: Vec<Action>) -> Self {
        Self {
            label: label.into(),
            actions,
            retry_actions: vec![],
            failure_actions: vec![],
        }
    }

    pub fn with_retry(mut self, actions: Vec<Action>) -> Self {
        self.retry_actions = actions;
        self
    }

    pub fn with_failure(mut self, actions: Vec<Action>) -> Self {
        self.failure_actions = actions;
        self
    }
}

/// Run the verifications of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub tree_id: String,
    pub node_id: String,
}

/// One step of a composite block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockStep {
    Navigate(NavigateRequest),
    Actions(ActionBatch),
    Verifications(VerifyRequest),
}

/// Work accepted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionRequest {
    Navigate(NavigateRequest),
    Actions(ActionBatch),
    Verifications(VerifyRequest),
    Block { steps: Vec<BlockStep> },
}

impl ExecutionRequest {
    pub fn kind(&self) -> ExecutionKind {
        match self {
            Self::Navigate(_) => ExecutionKind::Navigation,
            Self::Actions(_) => ExecutionKind::Actions,
            Self::Verifications(_) => ExecutionKind::Verifications,
            Self::Block { .. } => ExecutionKind::Block,
        }
    }

    /// Shape checks only; graph lookups happen on the worker.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Navigate(req) => check_navigate(req).map_err(invalid),
            Self::Actions(batch) => check_batch(batch).map_err(invalid),
            Self::Verifications(req) => check_verify(req).map_err(invalid),
            Self::Block { steps } => {
                if steps.is_empty() {
                    return Err(invalid("block has no steps"));
                }
                for (i, step) in steps.iter().enumerate() {
                    let checked = match step {
                        BlockStep::Navigate(req) => check_navigate(req),
                        BlockStep::Actions(batch) => check_batch(batch),
                        BlockStep::Verifications(req) => check_verify(req),
                    };
                    checked.map_err(|e| {
                        NavError::InvalidRequest(format!("step {}: {}", i, e))
                    })?;
                }
                Ok(())
            }
        }
    }
}

fn invalid(message: &str) -> NavError {
    NavError::InvalidRequest(message.to_string())
}

type Check = std::result::Result<(), &'static str>;

fn check_navigate(req: &NavigateRequest) -> Check {
    if req.tree_id.trim().is_empty() {
        return Err("tree_id is empty");
    }
    if req.to.trim().is_empty() {
        return Err("target node is empty");
    }
    if req.from.as_deref().is_some_and(|f| f.trim().is_empty()) {
        return Err("start node is empty");
    }
    Ok(())
}

fn check_batch(batch: &ActionBatch) -> Check {
    if batch.actions.is_empty() {
        return Err("action batch has no actions");
    }
    let all = batch
        .actions
        .iter()
        .chain(&batch.retry_actions)
        .chain(&batch.failure_actions);
    for action in all {
        if action.command.trim().is_empty() {
            return Err("action command is empty");
        }
    }
    Ok(())
}

fn check_verify(req: &VerifyRequest) -> Check {
    if req.tree_id.trim().is_empty() || req.node_id.trim().is_empty() {
        return Err("verification request needs tree_id and node_id");
    }
    Ok(())
}
