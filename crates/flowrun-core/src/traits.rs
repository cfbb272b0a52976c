// Collaborator seams for the orchestration core
//
// These traits are consumed, not implemented, by the runner:
// - Database-backed implementations for production
// - In-memory implementations for tests and single-process deployments
// - No-op implementations where a deployment has nothing to plug in

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::Result;
use crate::execution::{
    CreateExecution, ExecutionMode, ExecutionPayload, ExecutionRecord, ExecutionStatus, RunData,
    WorkflowData, WorkflowNode,
};

/// Opaque response payload delivered to synchronously waiting callers
pub type ResponsePayload = serde_json::Value;

// ============================================================================
// Cancellation
// ============================================================================

/// Sender half of a cancellation signal
///
/// Owned exclusively by the registry entry for one execution. Signaling is
/// fire-and-forget; the owning runner observes it cooperatively and stops at
/// the next safe point.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Create a handle together with the signal the runner will watch
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (
            Self { tx },
            CancelSignal {
                rx,
                _owned_tx: None,
            },
        )
    }

    /// Request cancellation. Safe to call if the runner is already gone.
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
            _owned_tx: None,
        }
    }
}

/// Receiver half of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
    /// Keeps the channel open for signals not backed by a registry handle
    _owned_tx: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl CancelSignal {
    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until cancellation is requested.
    ///
    /// If the handle is dropped without signaling (the execution finalized),
    /// this pends forever; callers race it against the work itself.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }

    /// A signal that never fires, for runs without a cancellation source
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _owned_tx: Some(std::sync::Arc::new(tx)),
        }
    }
}

// ============================================================================
// PermissionChecker - Pre-dispatch authorization
// ============================================================================

/// Checks whether a workflow with the given nodes may be executed
///
/// Runs before dispatch; a failure means no queue interaction and no local
/// runner invocation for this execution.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check(&self, workflow_id: Uuid, nodes: &[WorkflowNode]) -> Result<()>;
}

/// Permission checker that allows everything (single-user deployments)
pub struct AllowAllPermissionChecker;

#[async_trait]
impl PermissionChecker for AllowAllPermissionChecker {
    async fn check(&self, _workflow_id: Uuid, _nodes: &[WorkflowNode]) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// RunFeedback - Engine-to-registry backchannel
// ============================================================================

/// Feedback channel handed to the engine for one execution
///
/// Lets the graph interpreter report status transitions and push the first
/// response payload to synchronously waiting callers without knowing about
/// the registry.
#[async_trait]
pub trait RunFeedback: Send + Sync {
    /// Record a status transition for this execution
    async fn set_status(&self, status: ExecutionStatus);

    /// Deliver response data to the oldest waiting response waiter.
    /// No-op when nobody is waiting; the producer race is expected.
    async fn send_response(&self, payload: ResponsePayload);
}

/// Feedback sink that discards everything
pub struct NoopRunFeedback;

#[async_trait]
impl RunFeedback for NoopRunFeedback {
    async fn set_status(&self, _status: ExecutionStatus) {}
    async fn send_response(&self, _payload: ResponsePayload) {}
}

// ============================================================================
// NodeExecutionEngine - The graph interpreter
// ============================================================================

/// Everything the engine needs to run one execution
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub workflow: WorkflowData,
    pub mode: ExecutionMode,
    /// Wall-clock deadline derived from the soft timeout, when one applies.
    /// Nested workflow invocations inherit it.
    pub deadline: Option<DateTime<Utc>>,
    /// Workflow-scoped persisted state, fetched up front when requested
    pub static_data: Option<serde_json::Value>,
    pub feedback: std::sync::Arc<dyn RunFeedback>,
}

/// The node-graph interpreter, consumed as an external collaborator
///
/// Implementations observe `cancel` cooperatively: in-flight node I/O is not
/// forcibly killed, execution stops at the next node boundary.
#[async_trait]
pub trait NodeExecutionEngine: Send + Sync {
    async fn run(
        &self,
        ctx: ExecutionContext,
        payload: ExecutionPayload,
        cancel: CancelSignal,
    ) -> Result<RunData>;
}

// ============================================================================
// ExecutionPersistenceGateway - Execution rows
// ============================================================================

/// Options for reading an execution row
#[derive(Debug, Clone, Copy, Default)]
pub struct FindExecutionOptions {
    /// Load the (potentially large) result payload
    pub include_data: bool,
    /// Expand flattened result data into its full shape
    pub unflatten_data: bool,
}

/// Read/write access to persisted execution records
#[async_trait]
pub trait ExecutionPersistenceGateway: Send + Sync {
    /// Allocate a new execution row and return its id
    async fn create_execution(&self, input: CreateExecution) -> anyhow::Result<Uuid>;

    async fn update_status(&self, id: Uuid, status: ExecutionStatus) -> anyhow::Result<()>;

    async fn find_execution(
        &self,
        id: Uuid,
        opts: FindExecutionOptions,
    ) -> anyhow::Result<Option<ExecutionRecord>>;
}

// ============================================================================
// EventBus - Lifecycle telemetry
// ============================================================================

/// Lifecycle telemetry events
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: Uuid,
        mode: ExecutionMode,
        user_id: Option<Uuid>,
        retry_of: Option<Uuid>,
    },
    ExecutionFinished {
        execution_id: Uuid,
        workflow_id: Uuid,
        status: ExecutionStatus,
    },
}

impl LifecycleEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LifecycleEvent::ExecutionStarted { .. } => "execution-started",
            LifecycleEvent::ExecutionFinished { .. } => "execution-finished",
        }
    }
}

/// Fire-and-forget lifecycle telemetry
///
/// Implementations must swallow their own failures; emission is best-effort
/// and never blocks orchestration.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn emit(&self, event: LifecycleEvent);
}

/// Event bus that drops everything
pub struct NoopEventBus;

#[async_trait]
impl EventBus for NoopEventBus {
    async fn emit(&self, _event: LifecycleEvent) {}
}

// ============================================================================
// ExecutionLifecycleHooks - before/after seam
// ============================================================================

/// Hooks bracketing one execution
///
/// `workflow_execute_before` fires before any node runs;
/// `workflow_execute_after` fires exactly once, after finalize has decided
/// the terminal status.
#[async_trait]
pub trait ExecutionLifecycleHooks: Send + Sync {
    async fn workflow_execute_before(
        &self,
        execution_id: Uuid,
        workflow: &WorkflowData,
    ) -> anyhow::Result<()>;

    async fn workflow_execute_after(&self, execution_id: Uuid, run: &RunData)
        -> anyhow::Result<()>;
}

/// Hooks that do nothing
pub struct NoopLifecycleHooks;

#[async_trait]
impl ExecutionLifecycleHooks for NoopLifecycleHooks {
    async fn workflow_execute_before(
        &self,
        _execution_id: Uuid,
        _workflow: &WorkflowData,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn workflow_execute_after(
        &self,
        _execution_id: Uuid,
        _run: &RunData,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

// ============================================================================
// PostExecutionHook - best-effort notification after completion
// ============================================================================

/// Best-effort hook invoked with the final run data after an execution
/// completes. Failures are logged by the caller, never propagated.
#[async_trait]
pub trait PostExecutionHook: Send + Sync {
    async fn run(
        &self,
        run: &RunData,
        workflow: &WorkflowData,
        execution_id: Uuid,
    ) -> anyhow::Result<()>;
}

/// Post-execution hook that does nothing
pub struct NoopPostExecutionHook;

#[async_trait]
impl PostExecutionHook for NoopPostExecutionHook {
    async fn run(
        &self,
        _run: &RunData,
        _workflow: &WorkflowData,
        _execution_id: Uuid,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

// ============================================================================
// StaticDataStore - workflow-scoped persisted state
// ============================================================================

/// Access to workflow/node-scoped persisted state that outlives any single
/// execution. Fetched up front and passed into the execution context;
/// requests are never mutated to carry it.
#[async_trait]
pub trait StaticDataStore: Send + Sync {
    async fn get_static_data(&self, workflow_id: Uuid) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Static data store with nothing in it
pub struct EmptyStaticDataStore;

#[async_trait]
impl StaticDataStore for EmptyStaticDataStore {
    async fn get_static_data(
        &self,
        _workflow_id: Uuid,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(None)
    }
}
