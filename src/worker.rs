use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::{Result, UpdateError};

pub fn new_task_id() -> String {
    nanoid::nanoid!(12)
}

/// Bounded pool running update and rollback tasks in the background.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

/// Acknowledgement for a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    pub task_id: String,
    pub app_id: i64,
    join: JoinHandle<Result<()>>,
}

impl TaskHandle {
    /// Waits for completion; callers that fire and forget simply drop the handle.
    pub async fn wait(self) -> Result<()> {
        self.join
            .await
            .map_err(|err| UpdateError::Io(io::Error::other(err)))?
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Queues `task`; failures are logged with the task and app ids.
    pub fn submit<F>(&self, kind: &'static str, app_id: i64, task_id: String, task: F) -> TaskHandle
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let id = task_id.clone();
        let join = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|err| UpdateError::Io(io::Error::other(err)))?;
            info!(task_id = %id, app_id, kind, "task-start");
            let result = task.await;
            match &result {
                Ok(()) => info!(task_id = %id, app_id, kind, "task-finish"),
                Err(err) => error!(
                    task_id = %id,
                    app_id,
                    kind,
                    code = err.code(),
                    error = %err,
                    "task-failed"
                ),
            }
            result
        });
        TaskHandle {
            task_id,
            app_id,
            join,
        }
    }
}
