// Top-level execution coordinator
//
// Decides direct-vs-queued dispatch, arms the soft timeout, and drives every
// execution to exactly one finalize. Errors inside the background
// continuations never escape; they are routed through the ErrorFinalizer.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flowrun_core::config::{ExecutionsMode, RunnerConfig};
use flowrun_core::error::{ExecutionError, Result};
use flowrun_core::execution::{
    ExecutionMode, ExecutionPayload, ExecutionRequest, ExecutionStatus, RunData,
};
use flowrun_core::traits::{
    CancelHandle, EmptyStaticDataStore, EventBus, ExecutionContext, ExecutionLifecycleHooks,
    ExecutionPersistenceGateway, FindExecutionOptions, LifecycleEvent, NodeExecutionEngine,
    NoopEventBus, NoopLifecycleHooks, NoopPostExecutionHook, PermissionChecker, PostExecutionHook,
    StaticDataStore,
};

use crate::finalize::{failed_run_from_error, ErrorFinalizer};
use crate::queue::{
    JobDescriptor, JobOptions, JobQueueClient, JobResult, JOB_PRIORITY_DEFAULT,
    JOB_PRIORITY_REALTIME,
};
use crate::registry::{ActiveExecutionRegistry, RegistryRunFeedback, ResponseWaiter};
use crate::watchdog::RecoveryWatchdog;

/// Per-request options for `ExecutionOrchestrator::run`
#[derive(Default)]
pub struct RunOptions {
    /// Fetch workflow static data up front and hand it to the engine
    pub load_static_data: bool,
    /// The caller is synchronously waiting for response data; queued jobs
    /// get a higher priority
    pub realtime: bool,
    /// Reuse an existing execution id (retrying a finished execution)
    pub restart_execution_id: Option<Uuid>,
    /// Waiter for the first response payload the execution produces
    pub response: Option<ResponseWaiter>,
}

fn uses_queued_dispatch(mode: ExecutionsMode, execution_mode: ExecutionMode) -> bool {
    // Manual executions always run locally: interactive UI feedback needs
    // same-process event delivery
    mode == ExecutionsMode::Queue && execution_mode != ExecutionMode::Manual
}

/// The top-level coordinator for workflow executions
pub struct ExecutionOrchestrator {
    config: RunnerConfig,
    registry: Arc<ActiveExecutionRegistry>,
    engine: Arc<dyn NodeExecutionEngine>,
    permission_checker: Arc<dyn PermissionChecker>,
    persistence: Arc<dyn ExecutionPersistenceGateway>,
    queue: Arc<dyn JobQueueClient>,
    hooks: Arc<dyn ExecutionLifecycleHooks>,
    event_bus: Arc<dyn EventBus>,
    post_execution_hook: Arc<dyn PostExecutionHook>,
    static_data: Arc<dyn StaticDataStore>,
    finalizer: ErrorFinalizer,
}

/// Builder wiring the orchestrator's collaborators; hooks, event bus,
/// post-execution hook and static data default to no-ops.
pub struct ExecutionOrchestratorBuilder {
    config: RunnerConfig,
    engine: Arc<dyn NodeExecutionEngine>,
    permission_checker: Arc<dyn PermissionChecker>,
    persistence: Arc<dyn ExecutionPersistenceGateway>,
    queue: Arc<dyn JobQueueClient>,
    hooks: Arc<dyn ExecutionLifecycleHooks>,
    event_bus: Arc<dyn EventBus>,
    post_execution_hook: Arc<dyn PostExecutionHook>,
    static_data: Arc<dyn StaticDataStore>,
}

impl ExecutionOrchestratorBuilder {
    pub fn hooks(mut self, hooks: Arc<dyn ExecutionLifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn post_execution_hook(mut self, hook: Arc<dyn PostExecutionHook>) -> Self {
        self.post_execution_hook = hook;
        self
    }

    pub fn static_data(mut self, store: Arc<dyn StaticDataStore>) -> Self {
        self.static_data = store;
        self
    }

    pub fn build(self) -> ExecutionOrchestrator {
        let registry = Arc::new(ActiveExecutionRegistry::new(self.persistence.clone()));
        let finalizer = ErrorFinalizer::new(
            self.config.executions_mode,
            registry.clone(),
            self.persistence.clone(),
            self.hooks.clone(),
        );
        ExecutionOrchestrator {
            config: self.config,
            registry,
            engine: self.engine,
            permission_checker: self.permission_checker,
            persistence: self.persistence,
            queue: self.queue,
            hooks: self.hooks,
            event_bus: self.event_bus,
            post_execution_hook: self.post_execution_hook,
            static_data: self.static_data,
            finalizer,
        }
    }
}

impl ExecutionOrchestrator {
    pub fn builder(
        config: RunnerConfig,
        engine: Arc<dyn NodeExecutionEngine>,
        permission_checker: Arc<dyn PermissionChecker>,
        persistence: Arc<dyn ExecutionPersistenceGateway>,
        queue: Arc<dyn JobQueueClient>,
    ) -> ExecutionOrchestratorBuilder {
        ExecutionOrchestratorBuilder {
            config,
            engine,
            permission_checker,
            persistence,
            queue,
            hooks: Arc::new(NoopLifecycleHooks),
            event_bus: Arc::new(NoopEventBus),
            post_execution_hook: Arc::new(NoopPostExecutionHook),
            static_data: Arc::new(EmptyStaticDataStore),
        }
    }

    pub fn registry(&self) -> &Arc<ActiveExecutionRegistry> {
        &self.registry
    }

    /// Run a workflow. Returns the execution id as soon as the execution is
    /// dispatched; completion is observed via `wait_for_completion`.
    pub async fn run(&self, request: ExecutionRequest, opts: RunOptions) -> Result<Uuid> {
        let started_at = Utc::now();
        let execution_id = self
            .registry
            .register(&request, opts.restart_execution_id)
            .await?;
        debug!(
            execution_id = %execution_id,
            workflow = %request.workflow.name,
            mode = %request.mode,
            "Registered execution"
        );

        if let Err(error) = self
            .permission_checker
            .check(request.workflow.id, &request.workflow.nodes)
            .await
        {
            warn!(
                execution_id = %execution_id,
                workflow_id = %request.workflow.id,
                error = %error,
                "Permission check failed, aborting before dispatch"
            );
            self.run_before_hook(execution_id, &request).await;
            if let Some(response) = opts.response {
                let _ = response.send(Err(error.to_run_error()));
            }
            let run = failed_run_from_error(&error, request.mode, started_at);
            if self.registry.remove(execution_id, run.clone()) {
                self.run_after_hook(execution_id, &run).await;
            }
            return Ok(execution_id);
        }

        if let Some(response) = opts.response {
            self.registry.attach_response_waiter(execution_id, response)?;
        }

        let queued = uses_queued_dispatch(self.config.executions_mode, request.mode);
        if queued {
            self.enqueue_execution(
                execution_id,
                &request,
                opts.load_static_data,
                opts.realtime,
                started_at,
            )
            .await?;
        } else {
            self.run_local(execution_id, &request, opts.load_static_data, started_at)
                .await?;
            self.event_bus
                .emit(LifecycleEvent::ExecutionStarted {
                    execution_id,
                    workflow_id: request.workflow.id,
                    mode: request.mode,
                    user_id: request.user_id,
                    retry_of: request.retry_of,
                })
                .await;

            // Post-execute notification for locally dispatched executions;
            // in queue mode the worker process owns this
            let registry = self.registry.clone();
            let event_bus = self.event_bus.clone();
            let post_hook = self.post_execution_hook.clone();
            let workflow = request.workflow.clone();
            tokio::spawn(async move {
                match registry.wait_for_completion(execution_id).await {
                    Ok(run) => {
                        event_bus
                            .emit(LifecycleEvent::ExecutionFinished {
                                execution_id,
                                workflow_id: workflow.id,
                                status: run.status,
                            })
                            .await;
                        if let Err(hook_error) =
                            post_hook.run(&run, &workflow, execution_id).await
                        {
                            error!(
                                execution_id = %execution_id,
                                error = %hook_error,
                                "Post-execution hook failed"
                            );
                        }
                    }
                    Err(wait_error) => {
                        error!(
                            execution_id = %execution_id,
                            error = %wait_error,
                            "Could not observe execution completion"
                        );
                    }
                }
            });
        }

        Ok(execution_id)
    }

    /// Wait for an execution to finalize and return its run data
    pub async fn wait_for_completion(&self, execution_id: Uuid) -> Result<RunData> {
        self.registry.wait_for_completion(execution_id).await
    }

    /// Request cancellation of an in-flight execution. Returns whether the
    /// execution was known and still running.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        info!(execution_id = %execution_id, "Cancelling execution");
        self.registry.cancel(execution_id)
    }

    /// Signal every in-flight execution to stop; used on shutdown
    pub fn shutdown(&self) {
        let running = self.registry.running();
        info!(
            count = running.len(),
            "Shutting down, cancelling in-flight executions"
        );
        for summary in running {
            self.registry.cancel(summary.execution_id);
        }
    }

    async fn run_before_hook(&self, execution_id: Uuid, request: &ExecutionRequest) {
        if let Err(hook_error) = self
            .hooks
            .workflow_execute_before(execution_id, &request.workflow)
            .await
        {
            warn!(
                execution_id = %execution_id,
                error = %hook_error,
                "workflow_execute_before hook failed"
            );
        }
    }

    async fn run_after_hook(&self, execution_id: Uuid, run: &RunData) {
        if let Err(hook_error) = self.hooks.workflow_execute_after(execution_id, run).await {
            warn!(
                execution_id = %execution_id,
                error = %hook_error,
                "workflow_execute_after hook failed"
            );
        }
    }

    /// Run the execution in the current process
    async fn run_local(
        &self,
        execution_id: Uuid,
        request: &ExecutionRequest,
        load_static_data: bool,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let workflow = request.workflow.clone();

        let static_data = if load_static_data {
            match self.static_data.get_static_data(workflow.id).await {
                Ok(data) => data,
                Err(load_error) => {
                    let error = ExecutionError::Internal(load_error);
                    self.finalizer
                        .process_error(&error, started_at, request.mode, execution_id)
                        .await;
                    return Err(error);
                }
            }
        } else {
            None
        };

        // Soft timeout, clamped to the global maximum; armed with the run
        // below and disarmed by finalize
        let timeout = self
            .config
            .effective_timeout(workflow.settings.execution_timeout);
        let deadline = timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|d| Utc::now() + d);

        if let Err(update_error) = self
            .persistence
            .update_status(execution_id, ExecutionStatus::Running)
            .await
        {
            let error = ExecutionError::Internal(update_error);
            self.finalizer
                .process_error(&error, started_at, request.mode, execution_id)
                .await;
            return Err(error);
        }
        self.registry
            .set_status(execution_id, ExecutionStatus::Running)?;

        let (cancel_handle, cancel_signal) = CancelHandle::new();
        self.registry
            .attach_cancel_handle(execution_id, cancel_handle)?;

        match &request.payload {
            ExecutionPayload::Resume { .. } => {
                debug!(execution_id = %execution_id, "Execution has a resume payload, running with it")
            }
            ExecutionPayload::Partial { start_nodes, .. } => {
                debug!(
                    execution_id = %execution_id,
                    start_nodes = start_nodes.len(),
                    "Execution runs a partial graph"
                )
            }
            ExecutionPayload::RunAll { .. } => {
                debug!(execution_id = %execution_id, "Execution will run all nodes")
            }
        }

        self.run_before_hook(execution_id, request).await;

        let feedback = Arc::new(RegistryRunFeedback::new(self.registry.clone(), execution_id));
        let ctx = ExecutionContext {
            execution_id,
            workflow: workflow.clone(),
            mode: request.mode,
            deadline,
            static_data,
            feedback,
        };

        let engine = self.engine.clone();
        let registry = self.registry.clone();
        let hooks = self.hooks.clone();
        let finalizer = self.finalizer.clone();
        let payload = request.payload.clone();
        let mode = request.mode;

        tokio::spawn(async move {
            let run_future = engine.run(ctx, payload, cancel_signal);
            tokio::pin!(run_future);

            let result = match timeout {
                Some(duration) => {
                    tokio::select! {
                        result = &mut run_future => result,
                        _ = tokio::time::sleep(duration) => {
                            info!(
                                execution_id = %execution_id,
                                timeout_secs = duration.as_secs(),
                                "Soft timeout elapsed, cancelling execution"
                            );
                            registry.cancel(execution_id);
                            // Cooperative: the engine stops at its next safe point
                            run_future.await
                        }
                    }
                }
                None => run_future.await,
            };

            match result {
                Ok(mut run) => {
                    // Cancellation recorded in the registry wins over
                    // whatever status the engine reported
                    if matches!(
                        registry.get_status(execution_id),
                        Ok(ExecutionStatus::Canceled)
                    ) {
                        run.status = ExecutionStatus::Canceled;
                        run.finished = false;
                    }
                    if run.stopped_at.is_none() {
                        run.stopped_at = Some(Utc::now());
                    }
                    if registry.remove(execution_id, run.clone()) {
                        if let Err(hook_error) =
                            hooks.workflow_execute_after(execution_id, &run).await
                        {
                            warn!(
                                execution_id = %execution_id,
                                error = %hook_error,
                                "workflow_execute_after hook failed"
                            );
                        }
                    }
                }
                Err(run_error) => {
                    finalizer
                        .process_error(&run_error, started_at, mode, execution_id)
                        .await;
                }
            }
        });

        Ok(())
    }

    /// Hand the execution to the distributed job queue and watch for its
    /// completion in the background
    async fn enqueue_execution(
        &self,
        execution_id: Uuid,
        request: &ExecutionRequest,
        load_static_data: bool,
        realtime: bool,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let descriptor = JobDescriptor {
            execution_id,
            load_static_data,
        };
        // Jobs whose caller awaits a direct response get a higher priority
        let priority = if realtime {
            JOB_PRIORITY_REALTIME
        } else {
            JOB_PRIORITY_DEFAULT
        };
        let options = JobOptions::with_priority(priority);

        let job = match self.queue.enqueue(descriptor, options).await {
            Ok(job) => job,
            Err(enqueue_error) => {
                error!(
                    execution_id = %execution_id,
                    error = %enqueue_error,
                    "Could not enqueue execution"
                );
                // Whatever went wrong, the execution must still end in a
                // terminal failed record, never stuck in running
                let error = match enqueue_error {
                    queue_error @ ExecutionError::QueueInfrastructure(_) => queue_error,
                    other => ExecutionError::queue(other.to_string()),
                };
                self.finalizer
                    .process_error(&error, started_at, request.mode, execution_id)
                    .await;
                return Err(error);
            }
        };

        self.run_before_hook(execution_id, request).await;

        let (cancel_handle, mut cancel_signal) = CancelHandle::new();
        self.registry
            .attach_cancel_handle(execution_id, cancel_handle)?;

        let queue = self.queue.clone();
        let registry = self.registry.clone();
        let persistence = self.persistence.clone();
        let hooks = self.hooks.clone();
        let finalizer = self.finalizer.clone();
        let recovery_interval = self.config.queue_recovery_interval();
        let mode = request.mode;

        tokio::spawn(async move {
            let job_done = job.finished();
            tokio::pin!(job_done);

            // The queue's completion notification races the recovery
            // watchdog (when enabled) and the cancellation signal. The
            // winner finalizes; the losers' signals are discarded.
            let watchdog = async {
                match recovery_interval {
                    Some(interval) => {
                        RecoveryWatchdog::new(queue.clone(), execution_id, interval)
                            .wait_for_completion()
                            .await
                    }
                    None => std::future::pending::<JobResult>().await,
                }
            };

            let outcome: Result<JobResult> = tokio::select! {
                result = &mut job_done => result,
                result = watchdog => Ok(result),
                _ = cancel_signal.cancelled() => {
                    if let Err(stop_error) = queue.stop_job(execution_id).await {
                        warn!(
                            execution_id = %execution_id,
                            error = %stop_error,
                            "Could not stop queued job"
                        );
                    }
                    Err(ExecutionError::Cancelled(execution_id))
                }
            };

            if let Err(job_error) = outcome {
                let acted = finalizer
                    .process_error(&job_error, started_at, mode, execution_id)
                    .await;
                if acted {
                    return;
                }
                // False alarm: the job was reported failed but the
                // execution succeeded. Fall through and finalize from the
                // persisted record.
            }

            // Only pull the heavy result payload when a completion waiter
            // actually needs it
            let include_data = registry.completion_waiter_count(execution_id) > 0;
            if include_data {
                debug!(
                    execution_id = %execution_id,
                    "Reading execution data from persistence for completion waiters"
                );
            } else {
                debug!(
                    execution_id = %execution_id,
                    "Skipping execution data read, no completion waiters"
                );
            }

            let record = match persistence
                .find_execution(
                    execution_id,
                    FindExecutionOptions {
                        include_data,
                        unflatten_data: include_data,
                    },
                )
                .await
            {
                Ok(Some(record)) => record,
                Ok(None) => {
                    let error = ExecutionError::queue(format!(
                        "could not find execution {} after job completion",
                        execution_id
                    ));
                    finalizer
                        .process_error(&error, started_at, mode, execution_id)
                        .await;
                    return;
                }
                Err(read_error) => {
                    let error = ExecutionError::Internal(read_error);
                    finalizer
                        .process_error(&error, started_at, mode, execution_id)
                        .await;
                    return;
                }
            };

            let run = RunData {
                finished: record.finished,
                mode: record.mode,
                started_at: record.started_at,
                stopped_at: record.stopped_at,
                status: record.status,
                data: record.data,
                error: None,
            };

            if registry.remove(execution_id, run.clone()) {
                if let Err(hook_error) = hooks.workflow_execute_after(execution_id, &run).await {
                    warn!(
                        execution_id = %execution_id,
                        error = %hook_error,
                        "workflow_execute_after hook failed"
                    );
                }
            }
        });

        Ok(())
    }
}
