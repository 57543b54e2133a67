use thiserror::Error;

#[derive(Debug, Error)]
pub enum NavError {
    // Graph errors
    #[error("Graph integrity error: {0}")]
    GraphIntegrity(String),

    #[error("Tree not loaded: {0}")]
    UnknownTree(String),

    #[error("Node '{node_id}' not found in tree '{tree_id}'")]
    UnknownNode { tree_id: String, node_id: String },

    #[error("Node '{to}' is unreachable from '{from}'")]
    UnreachableNode { from: String, to: String },

    // Execution errors
    #[error("Step failed: {target}: {message}")]
    StepFailure { target: String, message: String },

    #[error("Unknown execution: {0}")]
    UnknownExecution(String),

    #[error("Invalid execution request: {0}")]
    InvalidRequest(String),

    #[error("Worker fault: {0}")]
    WorkerFault(String),

    // Collaborator errors
    #[error("Device error: {0}")]
    Device(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NavError {
    /// Short machine-readable name of the error family.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GraphIntegrity(_) => "graph_integrity",
            Self::UnknownTree(_) => "unknown_tree",
            Self::UnknownNode { .. } => "unknown_node",
            Self::UnreachableNode { .. } => "unreachable_node",
            Self::StepFailure { .. } => "step_failure",
            Self::UnknownExecution(_) => "unknown_execution",
            Self::InvalidRequest(_) => "invalid_request",
            Self::WorkerFault(_) => "worker_fault",
            Self::Device(_) => "device",
            Self::Config(_) | Self::ConfigNotFound(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, NavError>;
