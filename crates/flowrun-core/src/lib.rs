// Core abstractions for Flowrun
// Decision: keep the execution model and the collaborator seams DB-agnostic;
// the runner crate consumes these, storage/engine implementations plug in
// from the embedding application.

pub mod config;
pub mod error;
pub mod execution;
pub mod traits;

// Re-export main types
pub use config::{ExecutionsMode, RunnerConfig};
pub use error::{ExecutionError, Result};
pub use execution::{
    CreateExecution, ExecutionMode, ExecutionPayload, ExecutionRecord, ExecutionRequest,
    ExecutionStatus, RunData, RunError, RunErrorKind, WorkflowData, WorkflowNode, WorkflowSettings,
};
pub use traits::{
    AllowAllPermissionChecker, CancelHandle, CancelSignal, EmptyStaticDataStore, EventBus,
    ExecutionContext, ExecutionLifecycleHooks, ExecutionPersistenceGateway, FindExecutionOptions,
    LifecycleEvent, NodeExecutionEngine, NoopEventBus, NoopLifecycleHooks, NoopPostExecutionHook,
    NoopRunFeedback, PermissionChecker, PostExecutionHook, ResponsePayload, RunFeedback,
    StaticDataStore,
};
