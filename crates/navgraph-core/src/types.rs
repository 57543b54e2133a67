use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tree::{ActionKind, Direction};

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a collaborator reports back for one action or verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
    /// Opaque evidence handle, e.g. a screenshot path.
    #[serde(default)]
    pub evidence_ref: Option<String>,
}

impl ActionOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            evidence_ref: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            evidence_ref: None,
        }
    }

    pub fn with_evidence(mut self, evidence_ref: impl Into<String>) -> Self {
        self.evidence_ref = Some(evidence_ref.into());
        self
    }
}

/// Which sequence of an action set an action belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionPhase {
    Main,
    Retry,
    Failure,
    Verification,
}

/// Record of one executed action or verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub phase: ActionPhase,
    /// `None` for verifications.
    pub kind: Option<ActionKind>,
    pub command: String,
    pub success: bool,
    pub message: String,
    pub evidence_ref: Option<String>,
    pub elapsed_ms: u64,
}

/// The graph element a step ran against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepTarget {
    Edge {
        tree_id: String,
        edge_id: String,
        from: String,
        to: String,
        direction: Direction,
    },
    Node {
        tree_id: String,
        node_id: String,
    },
    /// Standalone action batch not tied to the graph.
    Batch { label: String },
}

impl StepTarget {
    /// Metric key for this target; batches are not tracked.
    pub fn metric_key(&self) -> Option<MetricKey> {
        match self {
            Self::Edge {
                tree_id, edge_id, ..
            } => Some(MetricKey::edge(tree_id.clone(), edge_id.clone())),
            Self::Node { tree_id, node_id } => {
                Some(MetricKey::node(tree_id.clone(), node_id.clone()))
            }
            Self::Batch { .. } => None,
        }
    }
}

impl std::fmt::Display for StepTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Edge {
                edge_id,
                from,
                to,
                direction,
                ..
            } => write!(f, "edge {} ({} -> {}, {})", edge_id, from, to, direction),
            Self::Node { node_id, .. } => write!(f, "node {}", node_id),
            Self::Batch { label } => write!(f, "batch {}", label),
        }
    }
}

/// Outcome of running one edge, one node's verifications, or one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub target: StepTarget,
    pub success: bool,
    /// Whether the step only succeeded thanks to the retry sequence.
    #[serde(default)]
    pub recovered: bool,
    pub actions: Vec<ActionRecord>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Evidence of the failing action, or the last evidence captured.
    pub evidence_ref: Option<String>,
    pub error: Option<String>,
}

/// Whether a metric is tracked for a node or for an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricElement {
    Node,
    Edge,
}

/// Identifies one node or edge for metrics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    pub tree_id: String,
    pub element: MetricElement,
    pub id: String,
}

impl MetricKey {
    pub fn node(tree_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tree_id: tree_id.into(),
            element: MetricElement::Node,
            id: id.into(),
        }
    }

    pub fn edge(tree_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tree_id: tree_id.into(),
            element: MetricElement::Edge,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for MetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let element = match self.element {
            MetricElement::Node => "node",
            MetricElement::Edge => "edge",
        };
        write!(f, "{}:{}/{}", element, self.tree_id, self.id)
    }
}

/// Executions after which the volume term of the confidence score saturates.
pub const CONFIDENCE_VOLUME_SATURATION: u64 = 10;

/// Rolling execution statistics for one node or edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub total: u64,
    pub successes: u64,
    pub avg_execution_ms: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MetricPoint {
    /// Fold one outcome in. O(1): the mean is updated incrementally.
    pub fn observe(&mut self, success: bool, elapsed_ms: u64) {
        self.total += 1;
        if success {
            self.successes += 1;
        }
        self.avg_execution_ms += (elapsed_ms as f64 - self.avg_execution_ms) / self.total as f64;
        self.updated_at = Some(Utc::now());
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.successes as f64 / self.total as f64
    }

    /// `0.3 * min(total / 10, 1) + 0.7 * success_rate`
    pub fn confidence(&self) -> f64 {
        let volume = (self.total as f64 / CONFIDENCE_VOLUME_SATURATION as f64).min(1.0);
        0.3 * volume + 0.7 * self.success_rate()
    }
}

/// Kind of work an execution performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    Navigation,
    Actions,
    Verifications,
    Block,
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Navigation => write!(f, "navigation"),
            Self::Actions => write!(f, "actions"),
            Self::Verifications => write!(f, "verifications"),
            Self::Block => write!(f, "block"),
        }
    }
}

/// Lifecycle state of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Error,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An execution was accepted and its worker spawned.
    ExecutionStarted {
        execution_id: ExecutionId,
        kind: ExecutionKind,
    },
    /// One step of an execution finished.
    StepCompleted {
        execution_id: ExecutionId,
        index: usize,
        result: StepResult,
    },
    /// An execution settled in `completed`.
    ExecutionCompleted {
        execution_id: ExecutionId,
        steps: usize,
        elapsed_ms: u64,
    },
    /// An execution settled in `error`.
    ExecutionFailed {
        execution_id: ExecutionId,
        error: String,
    },
    /// A metric point changed; consumers flush it to storage.
    MetricUpdated { key: MetricKey, point: MetricPoint },
}
