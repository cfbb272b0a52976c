// Error finalization
//
// Three paths can race to finalize a failing execution: the local runner's
// continuation, the queued completion race, and the pre-dispatch permission
// path. Whoever reaches the registry first wins; everyone else no-ops.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flowrun_core::config::ExecutionsMode;
use flowrun_core::error::ExecutionError;
use flowrun_core::execution::{ExecutionMode, ExecutionStatus, RunData};
use flowrun_core::traits::{
    ExecutionLifecycleHooks, ExecutionPersistenceGateway, FindExecutionOptions,
};

use crate::registry::ActiveExecutionRegistry;

/// Build the canonical failed-run record for an execution error.
///
/// Cancellations are recorded as `canceled`, not `error`, so callers can
/// tell an intentional stop from a failure.
pub fn failed_run_from_error(
    error: &ExecutionError,
    mode: ExecutionMode,
    started_at: DateTime<Utc>,
) -> RunData {
    let status = if error.is_cancellation() {
        ExecutionStatus::Canceled
    } else {
        ExecutionStatus::Error
    };
    RunData {
        finished: false,
        mode,
        started_at,
        stopped_at: Some(Utc::now()),
        status,
        data: None,
        error: Some(error.to_run_error()),
    }
}

/// Converts an execution-time error into a terminal failed run and performs
/// the finalize sequence exactly once per execution id.
#[derive(Clone)]
pub struct ErrorFinalizer {
    executions_mode: ExecutionsMode,
    registry: Arc<ActiveExecutionRegistry>,
    persistence: Arc<dyn ExecutionPersistenceGateway>,
    hooks: Arc<dyn ExecutionLifecycleHooks>,
}

impl ErrorFinalizer {
    pub fn new(
        executions_mode: ExecutionsMode,
        registry: Arc<ActiveExecutionRegistry>,
        persistence: Arc<dyn ExecutionPersistenceGateway>,
        hooks: Arc<dyn ExecutionLifecycleHooks>,
    ) -> Self {
        Self {
            executions_mode,
            registry,
            persistence,
            hooks,
        }
    }

    /// Finalize a failing execution. Never fails: everything here is a
    /// background continuation and errors must not escape it.
    ///
    /// Returns whether the error report was acted on. A `false` return
    /// means the failure was a false alarm (the persisted row shows the
    /// execution succeeded) and the caller should finalize from that row
    /// instead.
    pub async fn process_error(
        &self,
        error: &ExecutionError,
        started_at: DateTime<Utc>,
        mode: ExecutionMode,
        execution_id: Uuid,
    ) -> bool {
        if error.is_cancellation() {
            info!(execution_id = %execution_id, "Execution was cancelled");
        } else {
            error!(execution_id = %execution_id, error = %error, "Execution failed");
        }

        // Queue workers can report a stalled-job failure for an execution
        // that actually finished; trust the persisted row over the queue.
        if self.executions_mode == ExecutionsMode::Queue && mode != ExecutionMode::Manual {
            match self
                .persistence
                .find_execution(execution_id, FindExecutionOptions::default())
                .await
            {
                Ok(Some(record))
                    if record.finished && record.status == ExecutionStatus::Success =>
                {
                    debug!(
                        execution_id = %execution_id,
                        "Persisted record shows success, suppressing false failure report"
                    );
                    return false;
                }
                Ok(_) => {}
                Err(read_error) => {
                    warn!(
                        execution_id = %execution_id,
                        error = %read_error,
                        "Could not re-read execution before finalizing error"
                    );
                }
            }
        }

        let run = failed_run_from_error(error, mode, started_at);
        if self.registry.remove(execution_id, run.clone()) {
            if let Err(hook_error) = self
                .hooks
                .workflow_execute_after(execution_id, &run)
                .await
            {
                warn!(
                    execution_id = %execution_id,
                    error = %hook_error,
                    "workflow_execute_after hook failed"
                );
            }
        } else {
            debug!(
                execution_id = %execution_id,
                "Execution already finalized, discarding error report"
            );
        }
        true
    }
}
