// In-memory job queue using Tokio tasks
// This is the default backend for single-process deployments - jobs run in
// the same process through a registered handler, but the orchestrator sees
// the exact same surface an external broker would give it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use flowrun_core::error::{ExecutionError, Result};
use flowrun_core::traits::{CancelHandle, CancelSignal};

use super::{JobDescriptor, JobOptions, JobQueueClient, JobResult, JobSnapshot, QueuedJob};

/// Executes one queued job the way a remote worker would
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job to completion, observing `cancel` cooperatively
    async fn handle(&self, descriptor: JobDescriptor, cancel: CancelSignal) -> Result<()>;
}

type JobOutcome = std::result::Result<JobResult, String>;

struct JobEntry {
    priority: u32,
    cancel: CancelHandle,
    done_rx: watch::Receiver<Option<JobOutcome>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory queue backend
pub struct InMemoryJobQueue {
    handler: Arc<dyn JobHandler>,
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
}

impl InMemoryJobQueue {
    pub fn new(handler: Arc<dyn JobHandler>) -> Self {
        Self {
            handler,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of jobs currently queued or running
    pub fn job_count(&self) -> usize {
        lock(&self.jobs).len()
    }
}

#[async_trait]
impl JobQueueClient for InMemoryJobQueue {
    async fn enqueue(
        &self,
        descriptor: JobDescriptor,
        options: JobOptions,
    ) -> Result<Box<dyn QueuedJob>> {
        let execution_id = descriptor.execution_id;

        let (cancel_handle, cancel_signal) = CancelHandle::new();
        let (done_tx, done_rx) = watch::channel(None);

        {
            let mut jobs = lock(&self.jobs);
            if jobs.contains_key(&execution_id) {
                return Err(ExecutionError::queue(format!(
                    "job for execution {} is already queued",
                    execution_id
                )));
            }
            jobs.insert(
                execution_id,
                JobEntry {
                    priority: options.priority,
                    cancel: cancel_handle,
                    done_rx: done_rx.clone(),
                },
            );
        }

        info!(
            execution_id = %execution_id,
            priority = options.priority,
            "Enqueued job on in-memory queue"
        );

        let handler = self.handler.clone();
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            let outcome = match handler.handle(descriptor, cancel_signal).await {
                Ok(()) => Ok(JobResult { success: true }),
                Err(error) => Err(error.to_string()),
            };
            let failed = outcome.is_err();

            // Notify before removal so subscribed handles see the outcome
            let _ = done_tx.send(Some(outcome));

            let remove = if failed {
                options.remove_on_fail
            } else {
                options.remove_on_complete
            };
            if remove {
                lock(&jobs).remove(&execution_id);
                debug!(execution_id = %execution_id, "Removed finished job from queue");
            }
        });

        Ok(Box::new(InMemoryJob {
            execution_id,
            done_rx,
        }))
    }

    async fn get_job(&self, execution_id: Uuid) -> Result<Option<JobSnapshot>> {
        let jobs = lock(&self.jobs);
        Ok(jobs.get(&execution_id).map(|entry| JobSnapshot {
            execution_id,
            priority: entry.priority,
        }))
    }

    async fn stop_job(&self, execution_id: Uuid) -> Result<bool> {
        let jobs = lock(&self.jobs);
        match jobs.get(&execution_id) {
            Some(entry) => {
                info!(execution_id = %execution_id, "Stopping queued job");
                entry.cancel.signal();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

struct InMemoryJob {
    execution_id: Uuid,
    done_rx: watch::Receiver<Option<JobOutcome>>,
}

#[async_trait]
impl QueuedJob for InMemoryJob {
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
                        return Err(ExecutionError::queue(
                            "in-memory queue dropped the job before completion",
                        ));
                    }
                }
            }
        }
    }
}
