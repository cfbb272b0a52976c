// Error types for execution orchestration

use thiserror::Error;
use uuid::Uuid;

use crate::execution::{RunError, RunErrorKind};

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Errors that can occur while orchestrating an execution
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The caller is not allowed to run this workflow; raised before dispatch
    #[error("Permission denied for workflow {workflow_id}: {message}")]
    PermissionDenied { workflow_id: Uuid, message: String },

    /// A node in the graph failed
    #[error("Node '{node}' failed: {message}")]
    NodeExecution { node: String, message: String },

    /// The execution was cancelled (explicit stop or timeout)
    #[error("Execution {0} was cancelled")]
    Cancelled(Uuid),

    /// The job could not be enqueued or the queue connection failed
    #[error("Queue infrastructure error: {0}")]
    QueueInfrastructure(String),

    /// Operation against an unknown or already-reaped execution id
    #[error("Execution not found: {0}")]
    NotFound(Uuid),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ExecutionError {
    /// Create a permission-denied error
    pub fn permission_denied(workflow_id: Uuid, msg: impl Into<String>) -> Self {
        ExecutionError::PermissionDenied {
            workflow_id,
            message: msg.into(),
        }
    }

    /// Create a node execution error
    pub fn node(node: impl Into<String>, msg: impl Into<String>) -> Self {
        ExecutionError::NodeExecution {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a queue infrastructure error
    pub fn queue(msg: impl Into<String>) -> Self {
        ExecutionError::QueueInfrastructure(msg.into())
    }

    /// Whether this error represents cancellation rather than failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExecutionError::Cancelled(_))
    }

    /// The originating node, when the failure happened inside the graph
    pub fn node_name(&self) -> Option<&str> {
        match self {
            ExecutionError::NodeExecution { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Convert into the structured error payload stored on a failed run
    pub fn to_run_error(&self) -> RunError {
        let kind = match self {
            ExecutionError::NodeExecution { .. } => RunErrorKind::NodeExecution,
            ExecutionError::PermissionDenied { .. } => RunErrorKind::PermissionDenied,
            ExecutionError::Cancelled(_) => RunErrorKind::Cancelled,
            ExecutionError::QueueInfrastructure(_) => RunErrorKind::QueueInfrastructure,
            ExecutionError::NotFound(_) | ExecutionError::Internal(_) => RunErrorKind::Internal,
        };
        RunError {
            message: self.to_string(),
            node: self.node_name().map(str::to_string),
            kind,
        }
    }
}
