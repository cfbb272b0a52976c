// End-to-end orchestration tests against mock collaborators.
// Uses the paused Tokio clock so timeout and watchdog timing is exact.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use flowrun_core::config::{ExecutionsMode, RunnerConfig};
use flowrun_core::error::{ExecutionError, Result};
use flowrun_core::execution::{
    CreateExecution, ExecutionMode, ExecutionPayload, ExecutionRecord, ExecutionRequest,
    ExecutionStatus, RunData, RunErrorKind, WorkflowData, WorkflowNode, WorkflowSettings,
};
use flowrun_core::traits::{
    CancelSignal, ExecutionContext, ExecutionLifecycleHooks, ExecutionPersistenceGateway,
    FindExecutionOptions, NodeExecutionEngine, PermissionChecker,
};
use flowrun_runner::{
    ExecutionOrchestrator, JobDescriptor, JobOptions, JobQueueClient, JobResult, JobSnapshot,
    QueuedJob, RunOptions, JOB_PRIORITY_DEFAULT, JOB_PRIORITY_REALTIME,
};

// ============================================================================
// Mock collaborators
// ============================================================================

/// In-memory persistence gateway
struct MemoryGateway {
    rows: Mutex<HashMap<Uuid, ExecutionRecord>>,
}

impl MemoryGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(HashMap::new()),
        })
    }

    /// Simulate a worker having written the final state of an execution
    fn write_final_state(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        data: Option<serde_json::Value>,
    ) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&id) {
            row.finished = status == ExecutionStatus::Success;
            row.status = status;
            row.stopped_at = Some(Utc::now());
            row.data = data;
        }
    }

    fn status_of(&self, id: Uuid) -> Option<ExecutionStatus> {
        self.rows.lock().unwrap().get(&id).map(|row| row.status)
    }
}

#[async_trait]
impl ExecutionPersistenceGateway for MemoryGateway {
    async fn create_execution(&self, input: CreateExecution) -> anyhow::Result<Uuid> {
        let id = Uuid::now_v7();
        self.rows.lock().unwrap().insert(
            id,
            ExecutionRecord {
                id,
                finished: false,
                mode: input.mode,
                status: ExecutionStatus::New,
                started_at: input.started_at,
                stopped_at: None,
                data: None,
            },
        );
        Ok(id)
    }

    async fn update_status(&self, id: Uuid, status: ExecutionStatus) -> anyhow::Result<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(&id) {
            row.status = status;
        }
        Ok(())
    }

    async fn find_execution(
        &self,
        id: Uuid,
        opts: FindExecutionOptions,
    ) -> anyhow::Result<Option<ExecutionRecord>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(&id).map(|row| {
            let mut row = row.clone();
            if !opts.include_data {
                row.data = None;
            }
            row
        }))
    }
}

/// Scripted node-execution engine
enum EngineBehavior {
    /// Complete successfully after the given virtual delay
    Succeed { delay_ms: u64 },
    /// Push response data through the feedback channel, then succeed
    RespondThenSucceed,
    /// Fail with a node error
    FailAtNode,
    /// Block until cancelled, then report the cancellation
    UntilCancelled,
}

struct StubEngine {
    behavior: EngineBehavior,
    calls: AtomicUsize,
}

impl StubEngine {
    fn new(behavior: EngineBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeExecutionEngine for StubEngine {
    async fn run(
        &self,
        ctx: ExecutionContext,
        _payload: ExecutionPayload,
        mut cancel: CancelSignal,
    ) -> Result<RunData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            EngineBehavior::Succeed { delay_ms } => {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                Ok(RunData::success(
                    ctx.mode,
                    Utc::now(),
                    json!({"nodes": {"Set": [{"ok": true}]}}),
                ))
            }
            EngineBehavior::RespondThenSucceed => {
                ctx.feedback.send_response(json!({"reply": "hello"})).await;
                // Keep the run in flight briefly so callers can join it
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                Ok(RunData::success(ctx.mode, Utc::now(), json!({"done": true})))
            }
            EngineBehavior::FailAtNode => Err(ExecutionError::node("HTTP Request", "boom")),
            EngineBehavior::UntilCancelled => {
                cancel.cancelled().await;
                Err(ExecutionError::Cancelled(ctx.execution_id))
            }
        }
    }
}

/// Permission checker that rejects everything
struct DenyAllChecker;

#[async_trait]
impl PermissionChecker for DenyAllChecker {
    async fn check(&self, workflow_id: Uuid, _nodes: &[WorkflowNode]) -> Result<()> {
        Err(ExecutionError::permission_denied(
            workflow_id,
            "user lacks workflow:execute",
        ))
    }
}

/// Lifecycle hooks that record their invocations
#[derive(Default)]
struct RecordingHooks {
    before: AtomicUsize,
    after: Mutex<Vec<RunData>>,
}

impl RecordingHooks {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn before_count(&self) -> usize {
        self.before.load(Ordering::SeqCst)
    }

    fn after_runs(&self) -> Vec<RunData> {
        self.after.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionLifecycleHooks for RecordingHooks {
    async fn workflow_execute_before(
        &self,
        _execution_id: Uuid,
        _workflow: &WorkflowData,
    ) -> anyhow::Result<()> {
        self.before.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn workflow_execute_after(
        &self,
        _execution_id: Uuid,
        run: &RunData,
    ) -> anyhow::Result<()> {
        self.after.lock().unwrap().push(run.clone());
        Ok(())
    }
}

type JobOutcome = std::result::Result<JobResult, String>;

/// Test-controlled queue: jobs complete, fail, or silently vanish only when
/// the test says so.
struct MockQueue {
    jobs: Mutex<HashMap<Uuid, (u32, watch::Sender<Option<JobOutcome>>)>>,
    enqueued: Mutex<Vec<(Uuid, u32)>>,
    stopped: Mutex<Vec<Uuid>>,
    fail_enqueue: bool,
}

impl MockQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            enqueued: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            fail_enqueue: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            enqueued: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            fail_enqueue: true,
        })
    }

    fn enqueued_jobs(&self) -> Vec<(Uuid, u32)> {
        self.enqueued.lock().unwrap().clone()
    }

    fn stopped_jobs(&self) -> Vec<Uuid> {
        self.stopped.lock().unwrap().clone()
    }

    /// Worker finished the job and the completion notification arrives
    fn complete_job(&self, id: Uuid) {
        if let Some((_, tx)) = self.jobs.lock().unwrap().remove(&id) {
            let _ = tx.send(Some(Ok(JobResult { success: true })));
        }
    }

    /// Worker failed the job and the failure notification arrives
    fn fail_job(&self, id: Uuid) {
        if let Some((_, tx)) = self.jobs.lock().unwrap().remove(&id) {
            let _ = tx.send(Some(Err("worker reported job as failed".to_string())));
        }
    }

    /// The job disappears without any notification (lost message)
    fn vanish_job(&self, id: Uuid) {
        self.jobs.lock().unwrap().remove(&id);
    }
}

struct MockJob {
    execution_id: Uuid,
    done_rx: watch::Receiver<Option<JobOutcome>>,
}

#[async_trait]
impl QueuedJob for MockJob {
    fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    async fn finished(&self) -> Result<JobResult> {
        let mut rx = self.done_rx.clone();
        loop {
            let outcome = rx.borrow_and_update().clone();
            match outcome {
                Some(Ok(result)) => return Ok(result),
                Some(Err(message)) => return Err(ExecutionError::queue(message)),
                None => {
                    if rx.changed().await.is_err() {
                        // Notification lost for good; hang like a real
                        // subscriber would
                        futures::future::pending::<()>().await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl JobQueueClient for MockQueue {
    async fn enqueue(
        &self,
        descriptor: JobDescriptor,
        options: JobOptions,
    ) -> Result<Box<dyn QueuedJob>> {
        if self.fail_enqueue {
            return Err(ExecutionError::queue("broker unavailable"));
        }
        let (tx, rx) = watch::channel(None);
        self.jobs
            .lock()
            .unwrap()
            .insert(descriptor.execution_id, (options.priority, tx));
        self.enqueued
            .lock()
            .unwrap()
            .push((descriptor.execution_id, options.priority));
        Ok(Box::new(MockJob {
            execution_id: descriptor.execution_id,
            done_rx: rx,
        }))
    }

    async fn get_job(&self, execution_id: Uuid) -> Result<Option<JobSnapshot>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.get(&execution_id).map(|(priority, _)| JobSnapshot {
            execution_id,
            priority: *priority,
        }))
    }

    async fn stop_job(&self, execution_id: Uuid) -> Result<bool> {
        self.stopped.lock().unwrap().push(execution_id);
        Ok(self.jobs.lock().unwrap().remove(&execution_id).is_some())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn workflow() -> WorkflowData {
    WorkflowData {
        id: Uuid::now_v7(),
        name: "order sync".to_string(),
        nodes: vec![
            WorkflowNode {
                name: "Start".to_string(),
                node_type: "trigger".to_string(),
            },
            WorkflowNode {
                name: "HTTP Request".to_string(),
                node_type: "http".to_string(),
            },
        ],
        settings: WorkflowSettings::default(),
    }
}

fn request(mode: ExecutionMode) -> ExecutionRequest {
    ExecutionRequest::new(
        workflow(),
        mode,
        ExecutionPayload::RunAll {
            start_node: None,
            destination_node: None,
        },
    )
}

fn regular_config() -> RunnerConfig {
    RunnerConfig {
        executions_mode: ExecutionsMode::Regular,
        ..Default::default()
    }
}

fn queue_config(recovery_secs: u64) -> RunnerConfig {
    RunnerConfig {
        executions_mode: ExecutionsMode::Queue,
        queue_recovery_interval_secs: recovery_secs,
        ..Default::default()
    }
}

// ============================================================================
// Local dispatch
// ============================================================================

#[tokio::test(start_paused = true)]
async fn local_run_completes_and_resolves_waiters() {
    let gateway = MemoryGateway::new();
    let engine = StubEngine::new(EngineBehavior::Succeed { delay_ms: 10 });
    let hooks = RecordingHooks::new();
    let orchestrator = ExecutionOrchestrator::builder(
        regular_config(),
        engine.clone(),
        Arc::new(flowrun_core::traits::AllowAllPermissionChecker),
        gateway.clone(),
        MockQueue::new(),
    )
    .hooks(hooks.clone())
    .build();

    let execution_id = orchestrator
        .run(request(ExecutionMode::Manual), RunOptions::default())
        .await
        .unwrap();

    let run = orchestrator.wait_for_completion(execution_id).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Success);
    assert!(run.finished);
    assert!(run.data.is_some());

    assert_eq!(engine.call_count(), 1);
    assert_eq!(hooks.before_count(), 1);
    let after = hooks.after_runs();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].status, ExecutionStatus::Success);

    // Dispatch marked the persisted row running
    assert_eq!(gateway.status_of(execution_id), Some(ExecutionStatus::Running));
}

#[tokio::test(start_paused = true)]
async fn local_run_failure_finalizes_with_node_error() {
    let gateway = MemoryGateway::new();
    let engine = StubEngine::new(EngineBehavior::FailAtNode);
    let hooks = RecordingHooks::new();
    let orchestrator = ExecutionOrchestrator::builder(
        regular_config(),
        engine,
        Arc::new(flowrun_core::traits::AllowAllPermissionChecker),
        gateway,
        MockQueue::new(),
    )
    .hooks(hooks.clone())
    .build();

    let execution_id = orchestrator
        .run(request(ExecutionMode::Trigger), RunOptions::default())
        .await
        .unwrap();

    let run = orchestrator.wait_for_completion(execution_id).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Error);
    assert!(!run.finished);
    let error = run.error.unwrap();
    assert_eq!(error.kind, RunErrorKind::NodeExecution);
    assert_eq!(error.node.as_deref(), Some("HTTP Request"));

    // The failure finalized exactly once
    assert_eq!(hooks.after_runs().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn response_waiter_receives_engine_response_data() {
    let orchestrator = ExecutionOrchestrator::builder(
        regular_config(),
        StubEngine::new(EngineBehavior::RespondThenSucceed),
        Arc::new(flowrun_core::traits::AllowAllPermissionChecker),
        MemoryGateway::new(),
        MockQueue::new(),
    )
    .build();

    let orchestrator = Arc::new(orchestrator);
    let (tx, rx) = oneshot::channel();
    let execution_id = orchestrator
        .run(
            request(ExecutionMode::Webhook),
            RunOptions {
                response: Some(tx),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Join before the run finishes so the entry is still live afterwards
    let waiter = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.wait_for_completion(execution_id).await })
    };

    let payload = rx.await.unwrap().unwrap();
    assert_eq!(payload, json!({"reply": "hello"}));

    let run = waiter.await.unwrap().unwrap();
    assert_eq!(run.status, ExecutionStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn concurrent_executions_finish_independently() {
    let gateway = MemoryGateway::new();
    let orchestrator = Arc::new(
        ExecutionOrchestrator::builder(
            regular_config(),
            StubEngine::new(EngineBehavior::Succeed { delay_ms: 50 }),
            Arc::new(flowrun_core::traits::AllowAllPermissionChecker),
            gateway,
            MockQueue::new(),
        )
        .build(),
    );

    let first = orchestrator
        .run(request(ExecutionMode::Trigger), RunOptions::default())
        .await
        .unwrap();
    let second = orchestrator
        .run(request(ExecutionMode::Manual), RunOptions::default())
        .await
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(orchestrator.registry().running_count(), 2);

    let first_run = orchestrator.wait_for_completion(first).await.unwrap();
    let second_run = orchestrator.wait_for_completion(second).await.unwrap();
    assert_eq!(first_run.status, ExecutionStatus::Success);
    assert_eq!(second_run.status, ExecutionStatus::Success);
    assert_eq!(orchestrator.registry().running_count(), 0);
}

// ============================================================================
// Timeout and cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn timeout_cancels_execution_automatically() {
    let mut request = request(ExecutionMode::Trigger);
    request.workflow.settings.execution_timeout = Some(1);

    let config = RunnerConfig {
        executions_mode: ExecutionsMode::Regular,
        default_timeout_secs: -1,
        max_timeout_secs: 10,
        ..Default::default()
    };

    let hooks = RecordingHooks::new();
    let orchestrator = ExecutionOrchestrator::builder(
        config,
        StubEngine::new(EngineBehavior::UntilCancelled),
        Arc::new(flowrun_core::traits::AllowAllPermissionChecker),
        MemoryGateway::new(),
        MockQueue::new(),
    )
    .hooks(hooks.clone())
    .build();

    let execution_id = orchestrator.run(request, RunOptions::default()).await.unwrap();

    // No manual cancel: the armed timeout fires after 1 virtual second
    let run = orchestrator.wait_for_completion(execution_id).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Canceled);
    assert!(!run.finished);
    assert_eq!(run.error.unwrap().kind, RunErrorKind::Cancelled);
    assert_eq!(hooks.after_runs().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn explicit_cancel_stops_local_execution() {
    let orchestrator = ExecutionOrchestrator::builder(
        regular_config(),
        StubEngine::new(EngineBehavior::UntilCancelled),
        Arc::new(flowrun_core::traits::AllowAllPermissionChecker),
        MemoryGateway::new(),
        MockQueue::new(),
    )
    .build();

    let execution_id = orchestrator
        .run(request(ExecutionMode::Manual), RunOptions::default())
        .await
        .unwrap();

    assert!(orchestrator.cancel(execution_id));

    let run = orchestrator.wait_for_completion(execution_id).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Canceled);

    // Cancelling a finished execution reports nothing to cancel
    assert!(!orchestrator.cancel(execution_id));
}

// ============================================================================
// Permission check
// ============================================================================

#[tokio::test(start_paused = true)]
async fn permission_failure_skips_dispatch_entirely() {
    let engine = StubEngine::new(EngineBehavior::Succeed { delay_ms: 0 });
    let queue = MockQueue::new();
    let hooks = RecordingHooks::new();
    // Queue mode and a queueable execution mode: a permission failure must
    // still keep the queue untouched
    let orchestrator = ExecutionOrchestrator::builder(
        queue_config(0),
        engine.clone(),
        Arc::new(DenyAllChecker),
        MemoryGateway::new(),
        queue.clone(),
    )
    .hooks(hooks.clone())
    .build();

    let (tx, rx) = oneshot::channel();
    let execution_id = orchestrator
        .run(
            request(ExecutionMode::Trigger),
            RunOptions {
                response: Some(tx),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Synchronous caller is rejected with the permission error
    let rejection = rx.await.unwrap().unwrap_err();
    assert_eq!(rejection.kind, RunErrorKind::PermissionDenied);
    assert!(rejection.node.is_none());

    // No job enqueued, no local runner invoked
    assert!(queue.enqueued_jobs().is_empty());
    assert_eq!(engine.call_count(), 0);

    // Terminal error record, no node-execution data
    assert_eq!(hooks.before_count(), 1);
    let after = hooks.after_runs();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].status, ExecutionStatus::Error);
    assert!(after[0].data.is_none());

    // Entry is gone; nobody was left waiting
    assert!(matches!(
        orchestrator.wait_for_completion(execution_id).await,
        Err(ExecutionError::NotFound(_))
    ));
}

// ============================================================================
// Queued dispatch
// ============================================================================

#[tokio::test(start_paused = true)]
async fn manual_execution_runs_locally_even_in_queue_mode() {
    let engine = StubEngine::new(EngineBehavior::Succeed { delay_ms: 5 });
    let queue = MockQueue::new();
    let orchestrator = ExecutionOrchestrator::builder(
        queue_config(0),
        engine.clone(),
        Arc::new(flowrun_core::traits::AllowAllPermissionChecker),
        MemoryGateway::new(),
        queue.clone(),
    )
    .build();

    let execution_id = orchestrator
        .run(request(ExecutionMode::Manual), RunOptions::default())
        .await
        .unwrap();

    let run = orchestrator.wait_for_completion(execution_id).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Success);
    assert_eq!(engine.call_count(), 1);
    assert!(queue.enqueued_jobs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn queued_execution_finalizes_from_persisted_record() {
    let gateway = MemoryGateway::new();
    let engine = StubEngine::new(EngineBehavior::Succeed { delay_ms: 0 });
    let queue = MockQueue::new();
    let hooks = RecordingHooks::new();
    let orchestrator = Arc::new(
        ExecutionOrchestrator::builder(
            queue_config(0),
            engine.clone(),
            Arc::new(flowrun_core::traits::AllowAllPermissionChecker),
            gateway.clone(),
            queue.clone(),
        )
        .hooks(hooks.clone())
        .build(),
    );

    let execution_id = orchestrator
        .run(request(ExecutionMode::Trigger), RunOptions::default())
        .await
        .unwrap();

    // Dispatched to the queue, not the local engine
    assert_eq!(engine.call_count(), 0);
    assert_eq!(
        queue.enqueued_jobs(),
        vec![(execution_id, JOB_PRIORITY_DEFAULT)]
    );
    assert_eq!(hooks.before_count(), 1);

    // Worker finishes: writes the final row, then the notification arrives
    gateway.write_final_state(
        execution_id,
        ExecutionStatus::Success,
        Some(json!({"big": "payload"})),
    );

    let waiter = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.wait_for_completion(execution_id).await })
    };
    tokio::task::yield_now().await;

    queue.complete_job(execution_id);

    let run = waiter.await.unwrap().unwrap();
    assert_eq!(run.status, ExecutionStatus::Success);
    assert!(run.finished);
    // A completion waiter existed, so the data was fetched lazily
    assert_eq!(run.data, Some(json!({"big": "payload"})));
    assert_eq!(hooks.after_runs().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn realtime_jobs_get_higher_priority() {
    let queue = MockQueue::new();
    let orchestrator = ExecutionOrchestrator::builder(
        queue_config(0),
        StubEngine::new(EngineBehavior::Succeed { delay_ms: 0 }),
        Arc::new(flowrun_core::traits::AllowAllPermissionChecker),
        MemoryGateway::new(),
        queue.clone(),
    )
    .build();

    let background = orchestrator
        .run(request(ExecutionMode::Trigger), RunOptions::default())
        .await
        .unwrap();
    let realtime = orchestrator
        .run(
            request(ExecutionMode::Webhook),
            RunOptions {
                realtime: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let jobs: HashMap<Uuid, u32> = queue.enqueued_jobs().into_iter().collect();
    assert_eq!(jobs[&background], JOB_PRIORITY_DEFAULT);
    assert_eq!(jobs[&realtime], JOB_PRIORITY_REALTIME);
    assert!(jobs[&realtime] < jobs[&background]);
}

#[tokio::test(start_paused = true)]
async fn watchdog_detects_completion_when_notification_is_lost() {
    let gateway = MemoryGateway::new();
    let queue = MockQueue::new();
    let orchestrator = Arc::new(
        ExecutionOrchestrator::builder(
            queue_config(1),
            StubEngine::new(EngineBehavior::Succeed { delay_ms: 0 }),
            Arc::new(flowrun_core::traits::AllowAllPermissionChecker),
            gateway.clone(),
            queue.clone(),
        )
        .build(),
    );

    let execution_id = orchestrator
        .run(request(ExecutionMode::Trigger), RunOptions::default())
        .await
        .unwrap();

    // The worker finishes and the job vanishes from the queue, but the
    // completion notification is lost in a broker hiccup
    gateway.write_final_state(execution_id, ExecutionStatus::Success, Some(json!({"n": 1})));
    queue.vanish_job(execution_id);

    // The watchdog's first poll (1 virtual second later) detects the
    // disappearance and finalizes with success
    let run = orchestrator.wait_for_completion(execution_id).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Success);
    assert!(run.finished);
}

#[tokio::test(start_paused = true)]
async fn false_failure_report_does_not_overwrite_success() {
    let gateway = MemoryGateway::new();
    let queue = MockQueue::new();
    let hooks = RecordingHooks::new();
    let orchestrator = Arc::new(
        ExecutionOrchestrator::builder(
            queue_config(0),
            StubEngine::new(EngineBehavior::Succeed { delay_ms: 0 }),
            Arc::new(flowrun_core::traits::AllowAllPermissionChecker),
            gateway.clone(),
            queue.clone(),
        )
        .hooks(hooks.clone())
        .build(),
    );

    let execution_id = orchestrator
        .run(request(ExecutionMode::Trigger), RunOptions::default())
        .await
        .unwrap();

    // The execution actually succeeded and the row says so, but the queue
    // reports the job as failed (stalled-job false alarm)
    gateway.write_final_state(execution_id, ExecutionStatus::Success, Some(json!({"n": 2})));

    let waiter = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.wait_for_completion(execution_id).await })
    };
    tokio::task::yield_now().await;

    queue.fail_job(execution_id);

    // The error report is suppressed and the execution finalizes from the
    // persisted record instead
    let run = waiter.await.unwrap().unwrap();
    assert_eq!(run.status, ExecutionStatus::Success);
    assert!(run.finished);
    assert!(run.error.is_none());

    let after = hooks.after_runs();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].status, ExecutionStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn cancelling_queued_execution_stops_the_job() {
    let gateway = MemoryGateway::new();
    let queue = MockQueue::new();
    let orchestrator = Arc::new(
        ExecutionOrchestrator::builder(
            queue_config(0),
            StubEngine::new(EngineBehavior::Succeed { delay_ms: 0 }),
            Arc::new(flowrun_core::traits::AllowAllPermissionChecker),
            gateway.clone(),
            queue.clone(),
        )
        .build(),
    );

    let execution_id = orchestrator
        .run(request(ExecutionMode::Trigger), RunOptions::default())
        .await
        .unwrap();

    let waiter = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.wait_for_completion(execution_id).await })
    };
    tokio::task::yield_now().await;

    assert!(orchestrator.cancel(execution_id));

    let run = waiter.await.unwrap().unwrap();
    assert_eq!(run.status, ExecutionStatus::Canceled);
    assert_eq!(queue.stopped_jobs(), vec![execution_id]);
}

#[tokio::test(start_paused = true)]
async fn enqueue_failure_produces_terminal_error_record() {
    let queue = MockQueue::failing();
    let hooks = RecordingHooks::new();
    let orchestrator = ExecutionOrchestrator::builder(
        queue_config(0),
        StubEngine::new(EngineBehavior::Succeed { delay_ms: 0 }),
        Arc::new(flowrun_core::traits::AllowAllPermissionChecker),
        MemoryGateway::new(),
        queue,
    )
    .hooks(hooks.clone())
    .build();

    let result = orchestrator
        .run(request(ExecutionMode::Trigger), RunOptions::default())
        .await;
    assert!(matches!(
        result,
        Err(ExecutionError::QueueInfrastructure(_))
    ));

    // Never left stuck in running: the failure finalized the execution
    let after = hooks.after_runs();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].status, ExecutionStatus::Error);
    assert_eq!(
        after[0].error.as_ref().unwrap().kind,
        RunErrorKind::QueueInfrastructure
    );
    assert_eq!(orchestrator.registry().running_count(), 0);
}
