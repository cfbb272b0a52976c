// Job queue abstraction for queued execution dispatch
//
// The broker itself lives outside this crate; implementations wrap whatever
// backs the deployment (an external message-bus client, or the in-memory
// queue for single-process setups).

pub mod inmemory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowrun_core::error::Result;

/// Priority assigned to jobs whose caller is synchronously waiting for a
/// response. Lower value is higher priority.
pub const JOB_PRIORITY_REALTIME: u32 = 50;
/// Priority for ordinary background jobs
pub const JOB_PRIORITY_DEFAULT: u32 = 100;

/// The serialized request handed to the queue; workers load everything else
/// from persistence by execution id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub execution_id: Uuid,
    pub load_static_data: bool,
}

/// Enqueue options. Finished jobs are always auto-removed so the queue does
/// not grow without bound.
#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub priority: u32,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl JobOptions {
    pub fn with_priority(priority: u32) -> Self {
        Self {
            priority,
            remove_on_complete: true,
            remove_on_fail: true,
        }
    }
}

/// Completion notification payload from the queue
#[derive(Debug, Clone, Copy)]
pub struct JobResult {
    pub success: bool,
}

/// A job currently known to the queue, as seen by pollers
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub execution_id: Uuid,
    pub priority: u32,
}

/// Handle to an enqueued job
#[async_trait]
pub trait QueuedJob: Send + Sync {
    fn execution_id(&self) -> Uuid;

    /// Wait for the queue's completion notification for this job.
    /// Fails when the worker reports the job as failed or the connection
    /// to the broker is lost.
    async fn finished(&self) -> Result<JobResult>;
}

/// Abstraction over the distributed job queue
#[async_trait]
pub trait JobQueueClient: Send + Sync {
    /// Hand a job to the queue
    async fn enqueue(
        &self,
        descriptor: JobDescriptor,
        options: JobOptions,
    ) -> Result<Box<dyn QueuedJob>>;

    /// Look up a job by execution id. `None` means the job is no longer
    /// queued, which the recovery watchdog reads as completion.
    async fn get_job(&self, execution_id: Uuid) -> Result<Option<JobSnapshot>>;

    /// Stop and remove a specific job so no worker keeps burning resources
    /// on an abandoned execution. Returns whether the job was found.
    async fn stop_job(&self, execution_id: Uuid) -> Result<bool>;
}
