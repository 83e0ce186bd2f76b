//! Bounded concurrent execution of labelled lifecycle tasks
//!
//! Tasks are spawned onto the Tokio runtime immediately but only start their
//! operation once one of `max_workers` permits is free, which bounds the load
//! put on the external system by bulk create/delete batches. A failing task
//! never cancels its siblings: every task resolves to a [`TaskResult`] and the
//! caller decides what a mixed batch means.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Error, PartialBatchFailure, Result};

/// Worker pool size used when none is configured
pub const DEFAULT_MAX_WORKERS: usize = 10;

/// How often [`BatchExecutor::await_all`] re-checks completion by default
pub const DEFAULT_JOIN_POLL_INTERVAL: Duration = Duration::from_secs(10);

const MIN_JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

const SUBMITTED: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;
const FAILED: u8 = 3;

/// Lifecycle of a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting for a free worker
    Submitted,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    fn from_raw(raw: u8) -> Self {
        match raw {
            SUBMITTED => TaskStatus::Submitted,
            RUNNING => TaskStatus::Running,
            COMPLETED => TaskStatus::Completed,
            _ => TaskStatus::Failed,
        }
    }

    /// Completed or failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A labelled operation waiting to be submitted
pub struct Task<T> {
    label: String,
    operation: BoxFuture<'static, Result<T>>,
}

impl<T> Task<T> {
    /// Wrap `operation` under `label`; nothing runs until it is submitted
    pub fn new<F>(label: impl Into<String>, operation: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            label: label.into(),
            operation: Box::pin(operation),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Handle to a submitted task
pub struct TaskHandle<T> {
    label: String,
    status: Arc<AtomicU8>,
    join: JoinHandle<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once the task has returned, failed or panicked
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Current lifecycle state.
    ///
    /// A task whose operation panicked reports [`TaskStatus::Failed`].
    pub fn status(&self) -> TaskStatus {
        let status = TaskStatus::from_raw(self.status.load(Ordering::Acquire));
        // A panicking operation never records its own terminal state
        if !status.is_terminal() && self.join.is_finished() {
            TaskStatus::Failed
        } else {
            status
        }
    }

    async fn resolve(self) -> TaskResult<T> {
        let label = self.label;
        match self.join.await {
            Ok(Ok(value)) => TaskResult::Completed { label, value },
            Ok(Err(error)) => TaskResult::Failed { label, error },
            Err(join_err) => {
                error!(task = %label, error = %join_err, "task did not run to completion");
                TaskResult::Failed {
                    error: Error::TaskPanicked(label.clone()),
                    label,
                }
            }
        }
    }
}

/// Terminal outcome of one task
#[derive(Debug)]
pub enum TaskResult<T> {
    Completed { label: String, value: T },
    Failed { label: String, error: Error },
}

impl<T> TaskResult<T> {
    pub fn label(&self) -> &str {
        match self {
            TaskResult::Completed { label, .. } | TaskResult::Failed { label, .. } => label,
        }
    }

    /// True for failed and panicked tasks
    pub fn is_failed(&self) -> bool {
        matches!(self, TaskResult::Failed { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            TaskResult::Completed { value, .. } => Some(value),
            TaskResult::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            TaskResult::Completed { .. } => None,
            TaskResult::Failed { error, .. } => Some(error),
        }
    }

    /// Convert into a plain `Result`, dropping the label
    pub fn into_result(self) -> Result<T> {
        match self {
            TaskResult::Completed { value, .. } => Ok(value),
            TaskResult::Failed { error, .. } => Err(error),
        }
    }

    /// Replace the value, keeping label and failure
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TaskResult<U> {
        match self {
            TaskResult::Completed { label, value } => TaskResult::Completed {
                label,
                value: f(value),
            },
            TaskResult::Failed { label, error } => TaskResult::Failed { label, error },
        }
    }
}

/// Labels of failed results, in order
pub fn failed_labels<T>(results: &[TaskResult<T>]) -> Vec<String> {
    results
        .iter()
        .filter(|r| r.is_failed())
        .map(|r| r.label().to_string())
        .collect()
}

/// Collapse a batch into its values, or the list of failed tasks
pub fn summarize<T>(results: Vec<TaskResult<T>>) -> Result<Vec<T>, PartialBatchFailure> {
    let total = results.len();
    let failed = failed_labels(&results);
    if !failed.is_empty() {
        return Err(PartialBatchFailure { total, failed });
    }
    Ok(results
        .into_iter()
        .filter_map(|r| r.into_result().ok())
        .collect())
}

/// Fixed-size worker pool for lifecycle tasks
#[derive(Clone, Debug)]
pub struct BatchExecutor {
    workers: Arc<Semaphore>,
    max_workers: usize,
}

impl Default for BatchExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

impl BatchExecutor {
    /// Create a pool; a size of 0 is treated as 1
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// Concurrency limit this executor was created with
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Workers not currently running a task
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Refuse to start any task that has not acquired a worker yet.
    ///
    /// Tasks already running are left alone.
    pub fn close(&self) {
        self.workers.close();
    }

    /// Start all tasks; they queue until a worker is free
    pub fn submit<T>(&self, tasks: Vec<Task<T>>) -> Vec<TaskHandle<T>>
    where
        T: Send + 'static,
    {
        tasks.into_iter().map(|task| self.spawn(task)).collect()
    }

    fn spawn<T>(&self, task: Task<T>) -> TaskHandle<T>
    where
        T: Send + 'static,
    {
        let Task { label, operation } = task;
        let status = Arc::new(AtomicU8::new(SUBMITTED));
        let workers = Arc::clone(&self.workers);
        let task_status = Arc::clone(&status);
        let task_label = label.clone();

        let join = tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                task_status.store(FAILED, Ordering::Release);
                return Err(Error::ExecutorClosed(task_label));
            };

            task_status.store(RUNNING, Ordering::Release);
            debug!(task = %task_label, "task started");

            let result = operation.await;
            match &result {
                Ok(_) => {
                    task_status.store(COMPLETED, Ordering::Release);
                    debug!(task = %task_label, "task completed");
                }
                Err(e) => {
                    task_status.store(FAILED, Ordering::Release);
                    warn!(task = %task_label, error = %e, "task failed");
                }
            }
            result
        });

        TaskHandle {
            label,
            status,
            join,
        }
    }

    /// Wait until every task has resolved, logging progress every
    /// `poll_interval`, and return the results in submission order.
    pub async fn await_all<T>(
        &self,
        handles: Vec<TaskHandle<T>>,
        poll_interval: Duration,
    ) -> Vec<TaskResult<T>>
    where
        T: Send + 'static,
    {
        let poll_interval = poll_interval.max(MIN_JOIN_POLL_INTERVAL);

        while log_progress(&handles) > 0 {
            tokio::time::sleep(poll_interval).await;
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.resolve().await);
        }
        results
    }

    /// Like [`await_all`](Self::await_all), but stop waiting at `deadline`.
    ///
    /// Tasks still unresolved at the deadline are reported as
    /// [`Error::Abandoned`]. They are not cancelled: external calls they have
    /// already issued run to completion and their eventual outcome is logged.
    pub async fn await_all_until<T>(
        &self,
        handles: Vec<TaskHandle<T>>,
        poll_interval: Duration,
        deadline: Instant,
    ) -> Vec<TaskResult<T>>
    where
        T: Send + 'static,
    {
        let poll_interval = poll_interval.max(MIN_JOIN_POLL_INTERVAL);

        while log_progress(&handles) > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            if handle.is_finished() {
                results.push(handle.resolve().await);
                continue;
            }

            warn!(task = %handle.label, "giving up on task, it keeps running in the background");
            let label = handle.label.clone();
            tokio::spawn(async move {
                match handle.resolve().await {
                    TaskResult::Completed { label, .. } => {
                        info!(task = %label, "abandoned task eventually completed");
                    }
                    TaskResult::Failed { label, error } => {
                        warn!(task = %label, error = %error, "abandoned task eventually failed");
                    }
                }
            });
            results.push(TaskResult::Failed {
                error: Error::Abandoned(label.clone()),
                label,
            });
        }
        results
    }

    /// Submit a batch and wait for all of it
    pub async fn run_all<T>(&self, tasks: Vec<Task<T>>, poll_interval: Duration) -> Vec<TaskResult<T>>
    where
        T: Send + 'static,
    {
        let handles = self.submit(tasks);
        self.await_all(handles, poll_interval).await
    }
}

/// Log batch progress; returns the number of unresolved tasks
fn log_progress<T>(handles: &[TaskHandle<T>]) -> usize {
    let total = handles.len();
    let pending = handles.iter().filter(|h| !h.is_finished()).count();
    if pending > 0 {
        let running = handles
            .iter()
            .filter(|h| h.status() == TaskStatus::Running)
            .count();
        info!(
            resolved = total - pending,
            running,
            queued = pending.saturating_sub(running),
            total,
            "waiting for batch tasks to complete"
        );
    }
    pending
}
