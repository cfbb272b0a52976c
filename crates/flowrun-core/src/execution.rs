// Execution domain model
// Decision: the three mutually exclusive input shapes (fresh run, resume payload,
// partial run) are a closed enum instead of overlapping optional fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a workflow execution
///
/// Transitions are monotonic except `waiting -> running`, which is allowed
/// when a test execution is resumed by a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    New,
    Running,
    Success,
    Error,
    Canceled,
    Waiting,
}

impl ExecutionStatus {
    /// Whether this status is terminal (no further transitions)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Error | ExecutionStatus::Canceled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::New => write!(f, "new"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Error => write!(f, "error"),
            ExecutionStatus::Canceled => write!(f, "canceled"),
            ExecutionStatus::Waiting => write!(f, "waiting"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ExecutionStatus::New),
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "error" => Ok(ExecutionStatus::Error),
            "canceled" => Ok(ExecutionStatus::Canceled),
            "waiting" => Ok(ExecutionStatus::Waiting),
            _ => Err(format!("Unknown execution status: {}", s)),
        }
    }
}

/// How an execution was triggered
///
/// Immutable once set. Manual executions are never dispatched to the job
/// queue because interactive UI feedback requires same-process delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Manual,
    Trigger,
    Webhook,
    Retry,
    Internal,
    Cli,
    Integrated,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Manual => write!(f, "manual"),
            ExecutionMode::Trigger => write!(f, "trigger"),
            ExecutionMode::Webhook => write!(f, "webhook"),
            ExecutionMode::Retry => write!(f, "retry"),
            ExecutionMode::Internal => write!(f, "internal"),
            ExecutionMode::Cli => write!(f, "cli"),
            ExecutionMode::Integrated => write!(f, "integrated"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ExecutionMode::Manual),
            "trigger" => Ok(ExecutionMode::Trigger),
            "webhook" => Ok(ExecutionMode::Webhook),
            "retry" => Ok(ExecutionMode::Retry),
            "internal" => Ok(ExecutionMode::Internal),
            "cli" => Ok(ExecutionMode::Cli),
            "integrated" => Ok(ExecutionMode::Integrated),
            _ => Err(format!("Unknown execution mode: {}", s)),
        }
    }
}

/// A node in the workflow graph, as far as orchestration cares:
/// enough identity for permission checks and error attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub name: String,
    pub node_type: String,
}

/// Per-workflow settings relevant to orchestration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Soft timeout in seconds; values <= 0 disable the timeout.
    /// When unset, the configured default applies.
    pub execution_timeout: Option<i64>,
}

/// The workflow to execute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowData {
    pub id: Uuid,
    pub name: String,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

/// What part of the workflow to run
///
/// Exactly one of these shapes applies to any execution; the engine entry
/// point is selected by a single match on this enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionPayload {
    /// Execute all nodes, optionally from an explicit start node towards a
    /// destination node
    RunAll {
        start_node: Option<String>,
        destination_node: Option<String>,
    },
    /// Resume from previously captured execution data (webhook/trigger
    /// payload, or a waiting execution picking back up)
    Resume { execution_data: serde_json::Value },
    /// Execute only the subgraph between the given start nodes and the
    /// destination node, reusing prior run data
    Partial {
        run_data: serde_json::Value,
        start_nodes: Vec<String>,
        destination_node: Option<String>,
    },
}

impl ExecutionPayload {
    /// Build a payload from the loose fields callers tend to have on hand.
    ///
    /// Precedence when several are present: a resume payload wins over
    /// partial-run inputs, which win over a full run. Partial requires at
    /// least one start node; without one the prior run data is ignored.
    pub fn from_parts(
        execution_data: Option<serde_json::Value>,
        run_data: Option<serde_json::Value>,
        start_nodes: Vec<String>,
        destination_node: Option<String>,
    ) -> Self {
        if let Some(execution_data) = execution_data {
            return ExecutionPayload::Resume { execution_data };
        }
        match run_data {
            Some(run_data) if !start_nodes.is_empty() => ExecutionPayload::Partial {
                run_data,
                start_nodes,
                destination_node,
            },
            _ => ExecutionPayload::RunAll {
                start_node: None,
                destination_node,
            },
        }
    }
}

/// Request to run a workflow
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub workflow: WorkflowData,
    pub mode: ExecutionMode,
    pub payload: ExecutionPayload,
    pub user_id: Option<Uuid>,
    /// When this execution retries an earlier one, the id being retried
    pub retry_of: Option<Uuid>,
}

impl ExecutionRequest {
    pub fn new(workflow: WorkflowData, mode: ExecutionMode, payload: ExecutionPayload) -> Self {
        Self {
            workflow,
            mode,
            payload,
            user_id: None,
            retry_of: None,
        }
    }
}

/// Kind of failure recorded on a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    NodeExecution,
    PermissionDenied,
    Cancelled,
    QueueInfrastructure,
    Internal,
}

/// Structured error payload carried on a failed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    /// Originating node, when the failure happened inside the graph
    pub node: Option<String>,
    pub kind: RunErrorKind,
}

/// The canonical result record of one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunData {
    pub finished: bool,
    pub mode: ExecutionMode,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    /// Node outputs; omitted when nobody downstream needs them
    pub data: Option<serde_json::Value>,
    pub error: Option<RunError>,
}

impl RunData {
    /// A successful run record
    pub fn success(
        mode: ExecutionMode,
        started_at: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            finished: true,
            mode,
            started_at,
            stopped_at: Some(Utc::now()),
            status: ExecutionStatus::Success,
            data: Some(data),
            error: None,
        }
    }
}

/// Input for allocating a new execution row
#[derive(Debug, Clone)]
pub struct CreateExecution {
    pub workflow_id: Uuid,
    pub mode: ExecutionMode,
    pub started_at: DateTime<Utc>,
}

/// A persisted execution row, as read back from the gateway
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub finished: bool,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Present only when the row was fetched with `include_data`
    pub data: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_display_parse_roundtrip() {
        for status in [
            ExecutionStatus::New,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Error,
            ExecutionStatus::Canceled,
            ExecutionStatus::Waiting,
        ] {
            assert_eq!(status.to_string().parse::<ExecutionStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_status_parse_invalid() {
        assert!("finished".parse::<ExecutionStatus>().is_err());
        assert!("".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_status_terminal() {
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Error.is_terminal());
        assert!(ExecutionStatus::Canceled.is_terminal());
        assert!(!ExecutionStatus::New.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Waiting.is_terminal());
    }

    #[test]
    fn test_mode_display_parse_roundtrip() {
        for mode in [
            ExecutionMode::Manual,
            ExecutionMode::Trigger,
            ExecutionMode::Webhook,
            ExecutionMode::Retry,
            ExecutionMode::Internal,
            ExecutionMode::Cli,
            ExecutionMode::Integrated,
        ] {
            assert_eq!(mode.to_string().parse::<ExecutionMode>(), Ok(mode));
        }
    }

    #[test]
    fn test_payload_precedence_resume_wins() {
        let payload = ExecutionPayload::from_parts(
            Some(json!({"body": 1})),
            Some(json!({"prior": true})),
            vec!["Start".to_string()],
            Some("End".to_string()),
        );
        assert!(matches!(payload, ExecutionPayload::Resume { .. }));
    }

    #[test]
    fn test_payload_precedence_partial_needs_start_nodes() {
        let payload =
            ExecutionPayload::from_parts(None, Some(json!({"prior": true})), vec![], None);
        assert!(matches!(payload, ExecutionPayload::RunAll { .. }));

        let payload = ExecutionPayload::from_parts(
            None,
            Some(json!({"prior": true})),
            vec!["Set".to_string()],
            None,
        );
        assert!(matches!(payload, ExecutionPayload::Partial { .. }));
    }

    #[test]
    fn test_payload_defaults_to_run_all() {
        let payload = ExecutionPayload::from_parts(None, None, vec![], None);
        assert!(matches!(
            payload,
            ExecutionPayload::RunAll {
                start_node: None,
                destination_node: None,
            }
        ));
    }

    #[test]
    fn test_run_data_serde_roundtrip() {
        let run = RunData::success(
            ExecutionMode::Trigger,
            Utc::now(),
            json!({"nodes": {"Set": [{"value": 1}]}}),
        );

        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["mode"], "trigger");

        let back: RunData = serde_json::from_value(json).unwrap();
        assert!(back.finished);
        assert_eq!(back.status, ExecutionStatus::Success);
        assert!(back.stopped_at.is_some());
    }
}
