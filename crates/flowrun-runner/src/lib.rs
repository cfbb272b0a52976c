// Execution orchestration for Flowrun
// Decision: the registry is the only mutable shared state; every completion
// path funnels through its idempotent remove, so an execution finalizes
// exactly once no matter which signal wins.

pub mod finalize;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod watchdog;

// Re-export main types
pub use finalize::{failed_run_from_error, ErrorFinalizer};
pub use orchestrator::{ExecutionOrchestrator, ExecutionOrchestratorBuilder, RunOptions};
pub use queue::{
    inmemory::{InMemoryJobQueue, JobHandler},
    JobDescriptor, JobOptions, JobQueueClient, JobResult, JobSnapshot, QueuedJob,
    JOB_PRIORITY_DEFAULT, JOB_PRIORITY_REALTIME,
};
pub use registry::{
    ActiveExecutionRegistry, ActiveExecutionSummary, RegistryRunFeedback, ResponseWaiter,
};
pub use watchdog::RecoveryWatchdog;
