// Recovery watchdog for queued executions
//
// If the message bus drops a completion notification (broker crash and
// recovery while a job finishes), the completion await would hang forever.
// The watchdog polls the queue instead: a job that is gone has finished.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::queue::{JobQueueClient, JobResult};

/// Polls the queue for a job and resolves with an implicit success once the
/// job is no longer there. One arm of the queued completion race; the other
/// is the queue's own notification.
pub struct RecoveryWatchdog {
    queue: Arc<dyn JobQueueClient>,
    execution_id: Uuid,
    interval: Duration,
}

impl RecoveryWatchdog {
    pub fn new(queue: Arc<dyn JobQueueClient>, execution_id: Uuid, interval: Duration) -> Self {
        Self {
            queue,
            execution_id,
            interval,
        }
    }

    /// Poll until the job disappears from the queue.
    ///
    /// Poll failures are logged and retried on the next tick; a flaky broker
    /// must not produce a false completion signal.
    pub async fn wait_for_completion(self) -> JobResult {
        loop {
            tokio::time::sleep(self.interval).await;
            match self.queue.get_job(self.execution_id).await {
                Ok(None) => {
                    debug!(
                        execution_id = %self.execution_id,
                        "Job no longer in queue, treating as completed"
                    );
                    // Mimic the worker's own success notification
                    return JobResult { success: true };
                }
                Ok(Some(_)) => {}
                Err(error) => {
                    warn!(
                        execution_id = %self.execution_id,
                        error = %error,
                        "Recovery watchdog failed to poll queue"
                    );
                }
            }
        }
    }
}
