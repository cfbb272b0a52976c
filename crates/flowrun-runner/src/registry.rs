// Process-wide table of in-flight executions
//
// The registry is the single piece of mutable shared state in the
// orchestration core: cancellation handles, completion channels, and
// response waiters all live here. Entries are created on register and
// reaped after finalize once no completion waiter remains, so a join
// arriving right after removal still resolves against the finished entry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use flowrun_core::error::{ExecutionError, Result};
use flowrun_core::execution::{
    CreateExecution, ExecutionMode, ExecutionRequest, ExecutionStatus, RunData, RunError,
};
use async_trait::async_trait;
use flowrun_core::traits::{CancelHandle, ExecutionPersistenceGateway, ResponsePayload, RunFeedback};

/// Waiter for the first response payload an execution produces.
/// Resolved with `Ok` when response data arrives, `Err` when the execution
/// fails before producing any.
pub type ResponseWaiter = oneshot::Sender<std::result::Result<ResponsePayload, RunError>>;

/// Snapshot of one in-flight execution
#[derive(Debug, Clone)]
pub struct ActiveExecutionSummary {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
}

struct ExecutionSlot {
    workflow_id: Uuid,
    mode: ExecutionMode,
    started_at: DateTime<Utc>,
    status: ExecutionStatus,
    cancel: Option<CancelHandle>,
    response_waiters: VecDeque<ResponseWaiter>,
    completion_tx: watch::Sender<Option<Arc<RunData>>>,
    final_run: Option<Arc<RunData>>,
    /// Completion waiters currently attached; the entry is reaped once the
    /// run finalized and this drops to zero
    completion_waiters: usize,
}

impl ExecutionSlot {
    fn finalized(&self) -> bool {
        self.final_run.is_some()
    }
}

// Lock poisoning only happens if a holder panicked mid-section; the slot
// data stays coherent because no invariant spans a panic point, so recover
// the guard instead of propagating the panic.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of all executions currently in flight in this process
///
/// The outer map lock is held only to look up or insert entries; all
/// per-execution state sits behind its own mutex so independent executions
/// never contend.
pub struct ActiveExecutionRegistry {
    persistence: Arc<dyn ExecutionPersistenceGateway>,
    executions: RwLock<HashMap<Uuid, Arc<Mutex<ExecutionSlot>>>>,
}

impl ActiveExecutionRegistry {
    pub fn new(persistence: Arc<dyn ExecutionPersistenceGateway>) -> Self {
        Self {
            persistence,
            executions: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, id: &Uuid) -> Option<Arc<Mutex<ExecutionSlot>>> {
        self.executions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn reap(&self, id: &Uuid) {
        self.executions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Register a new execution, allocating an id through the persistence
    /// gateway, or reusing `restart_execution_id` when a finished execution
    /// is being retried under its existing id.
    pub async fn register(
        &self,
        request: &ExecutionRequest,
        restart_execution_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let started_at = Utc::now();
        let execution_id = match restart_execution_id {
            Some(id) => {
                debug!(execution_id = %id, "Re-registering execution for restart");
                id
            }
            None => {
                self.persistence
                    .create_execution(CreateExecution {
                        workflow_id: request.workflow.id,
                        mode: request.mode,
                        started_at,
                    })
                    .await?
            }
        };

        let (completion_tx, _) = watch::channel(None);
        let slot = ExecutionSlot {
            workflow_id: request.workflow.id,
            mode: request.mode,
            started_at,
            status: ExecutionStatus::New,
            cancel: None,
            response_waiters: VecDeque::new(),
            completion_tx,
            final_run: None,
            completion_waiters: 0,
        };

        let mut executions = self
            .executions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if executions.contains_key(&execution_id) {
            return Err(
                anyhow::anyhow!("execution {} is already registered", execution_id).into(),
            );
        }
        executions.insert(execution_id, Arc::new(Mutex::new(slot)));

        Ok(execution_id)
    }

    /// Attach a waiter for the first response payload this execution
    /// produces. Multiple waiters are resolved oldest-first.
    pub fn attach_response_waiter(&self, id: Uuid, waiter: ResponseWaiter) -> Result<()> {
        let slot_arc = self.slot(&id).ok_or(ExecutionError::NotFound(id))?;
        lock(&slot_arc).response_waiters.push_back(waiter);
        Ok(())
    }

    /// Deliver response data to the oldest unresolved waiter. A producer
    /// racing a finished or waiterless execution is expected; both are
    /// no-ops.
    pub fn resolve_response_waiter(&self, id: Uuid, payload: ResponsePayload) {
        let Some(slot_arc) = self.slot(&id) else {
            debug!(execution_id = %id, "Response data for unknown execution, dropping");
            return;
        };
        let mut slot = lock(&slot_arc);
        while let Some(waiter) = slot.response_waiters.pop_front() {
            // A closed receiver means that caller went away; try the next one
            if waiter.send(Ok(payload.clone())).is_ok() {
                return;
            }
        }
    }

    /// Attach the cancellation handle for whichever runner owns this
    /// execution. The registry drops the handle at finalize, so it is never
    /// invoked after removal.
    pub fn attach_cancel_handle(&self, id: Uuid, handle: CancelHandle) -> Result<()> {
        let slot_arc = self.slot(&id).ok_or(ExecutionError::NotFound(id))?;
        let mut slot = lock(&slot_arc);
        if slot.finalized() {
            return Ok(());
        }
        slot.cancel = Some(handle);
        Ok(())
    }

    /// Request cancellation of an in-flight execution. Fire-and-forget: the
    /// owning runner observes the signal and stops at its next safe point.
    /// Returns whether a live entry existed.
    pub fn cancel(&self, id: Uuid) -> bool {
        let Some(slot_arc) = self.slot(&id) else {
            return false;
        };
        let mut slot = lock(&slot_arc);
        if slot.finalized() {
            return false;
        }
        slot.status = ExecutionStatus::Canceled;
        if let Some(cancel) = &slot.cancel {
            cancel.signal();
        }
        true
    }

    pub fn set_status(&self, id: Uuid, status: ExecutionStatus) -> Result<()> {
        let slot_arc = self.slot(&id).ok_or(ExecutionError::NotFound(id))?;
        let mut slot = lock(&slot_arc);
        if !slot.finalized() {
            slot.status = status;
        }
        Ok(())
    }

    pub fn get_status(&self, id: Uuid) -> Result<ExecutionStatus> {
        let slot_arc = self.slot(&id).ok_or(ExecutionError::NotFound(id))?;
        let status = lock(&slot_arc).status;
        Ok(status)
    }

    /// Finalize an execution: record the terminal run data, resolve every
    /// current and future completion waiter, and reject response waiters
    /// still pending.
    ///
    /// The first caller wins and returns true; concurrent finalize attempts
    /// from racing completion paths observe a no-op and return false.
    pub fn remove(&self, id: Uuid, final_run: RunData) -> bool {
        let Some(slot_arc) = self.slot(&id) else {
            debug!(execution_id = %id, "Remove on unknown execution (already reaped)");
            return false;
        };

        let reap_now = {
            let mut slot = lock(&slot_arc);
            if slot.finalized() {
                debug!(execution_id = %id, "Execution already finalized by another path");
                return false;
            }

            slot.status = final_run.status;
            // Invariant: the handle is never signaled after removal
            slot.cancel = None;

            let final_run = Arc::new(final_run);
            slot.final_run = Some(final_run.clone());

            // Response waiters that never got data: reject with the run error
            // on failure, or just close the channel on success
            let error = final_run.error.clone();
            for waiter in slot.response_waiters.drain(..) {
                match &error {
                    Some(error) => {
                        let _ = waiter.send(Err(error.clone()));
                    }
                    None => drop(waiter),
                }
            }

            let _ = slot.completion_tx.send(Some(final_run));
            slot.completion_waiters == 0
        };

        if reap_now {
            self.reap(&id);
        }
        true
    }

    /// Wait for this execution to finalize and return its run data.
    ///
    /// Resolves immediately when called against a finished entry that has
    /// not been reaped yet; fails with `NotFound` for ids never registered
    /// or already fully reaped.
    pub async fn wait_for_completion(&self, id: Uuid) -> Result<RunData> {
        let slot_arc = self.slot(&id).ok_or(ExecutionError::NotFound(id))?;

        let mut rx = {
            let mut slot = lock(&slot_arc);
            if let Some(final_run) = &slot.final_run {
                return Ok((**final_run).clone());
            }
            slot.completion_waiters += 1;
            slot.completion_tx.subscribe()
        };

        let _guard = CompletionWaiterGuard {
            registry: self,
            id,
            slot: slot_arc.clone(),
        };

        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(run) = current {
                return Ok((*run).clone());
            }
            if rx.changed().await.is_err() {
                // Entry vanished without finalizing; registry misuse upstream
                warn!(execution_id = %id, "Completion channel closed before finalize");
                return Err(ExecutionError::NotFound(id));
            }
        }
    }

    /// Number of callers currently waiting on completion. Queued finalize
    /// uses this to skip fetching heavy result payloads nobody will read.
    pub fn completion_waiter_count(&self, id: Uuid) -> usize {
        match self.slot(&id) {
            Some(slot_arc) => lock(&slot_arc).completion_waiters,
            None => 0,
        }
    }

    /// Summaries of executions still in flight
    pub fn running(&self) -> Vec<ActiveExecutionSummary> {
        let executions = self
            .executions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        executions
            .iter()
            .filter_map(|(id, slot_arc)| {
                let slot = lock(slot_arc);
                if slot.finalized() {
                    return None;
                }
                Some(ActiveExecutionSummary {
                    execution_id: *id,
                    workflow_id: slot.workflow_id,
                    mode: slot.mode,
                    status: slot.status,
                    started_at: slot.started_at,
                })
            })
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.running().len()
    }
}

/// Feedback channel for one execution, backed by the registry
///
/// The engine reports status transitions and response data through this
/// without knowing the registry exists.
pub struct RegistryRunFeedback {
    registry: Arc<ActiveExecutionRegistry>,
    execution_id: Uuid,
}

impl RegistryRunFeedback {
    pub fn new(registry: Arc<ActiveExecutionRegistry>, execution_id: Uuid) -> Self {
        Self {
            registry,
            execution_id,
        }
    }
}

#[async_trait]
impl RunFeedback for RegistryRunFeedback {
    async fn set_status(&self, status: ExecutionStatus) {
        if self.registry.set_status(self.execution_id, status).is_err() {
            debug!(
                execution_id = %self.execution_id,
                "Status update for an execution no longer tracked"
            );
        }
    }

    async fn send_response(&self, payload: ResponsePayload) {
        self.registry
            .resolve_response_waiter(self.execution_id, payload);
    }
}

/// Decrements the waiter count when a completion waiter resolves or is
/// dropped mid-wait, and reaps the entry once the last waiter of a
/// finalized execution is gone.
struct CompletionWaiterGuard<'a> {
    registry: &'a ActiveExecutionRegistry,
    id: Uuid,
    slot: Arc<Mutex<ExecutionSlot>>,
}

impl Drop for CompletionWaiterGuard<'_> {
    fn drop(&mut self) {
        let reap = {
            let mut slot = lock(&self.slot);
            slot.completion_waiters = slot.completion_waiters.saturating_sub(1);
            slot.finalized() && slot.completion_waiters == 0
        };
        if reap {
            self.registry.reap(&self.id);
        }
    }
}
