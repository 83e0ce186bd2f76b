//! Error types for polling, resource lifecycle calls and batch execution

use std::time::Duration;

use thiserror::Error;

use crate::resource::ResourceKind;

/// A predicate was never satisfied within its time budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("timed out after {elapsed:?} ({attempts} attempts)")]
pub struct TimeoutError {
    pub elapsed: Duration,
    pub attempts: u32,
}

/// The status read itself kept failing, so polling stopped early.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("status check failed {consecutive_failures} times in a row after {attempts} attempts: {message}")]
pub struct CheckError {
    pub attempts: u32,
    pub consecutive_failures: u32,
    pub message: String,
}

/// Outcome of a failed [`wait_for`](crate::poller::wait_for) call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    Check(#[from] CheckError),
}

impl PollError {
    pub fn attempts(&self) -> u32 {
        match self {
            PollError::Timeout(e) => e.attempts,
            PollError::Check(e) => e.attempts,
        }
    }
}

/// Failure reported by a resource backend.
///
/// Variants are named with the `Error` suffix where they wrap another error type.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Operation {operation} is not supported for {kind} resources")]
    Unsupported {
        kind: ResourceKind,
        operation: &'static str,
    },

    #[error("Transient error (will retry): {0}")]
    Transient(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ProviderError::NotFound(_) => true,
            ProviderError::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Check if the call could succeed when retried unchanged
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                // Network and other client errors are retryable
                _ => true,
            },
            ProviderError::Transient(_) => true,
            ProviderError::NotFound(_) => false,
            ProviderError::Rejected(_) => false,
            ProviderError::Unsupported { .. } => false,
        }
    }
}

/// Deletion was rejected and the resource is not idempotently absent.
#[derive(Error, Debug)]
#[error("failed to delete {kind} {id}: {source}")]
pub struct DeleteError {
    pub id: String,
    pub kind: ResourceKind,
    #[source]
    pub source: ProviderError,
}

/// Attach or detach was rejected.
#[derive(Error, Debug)]
#[error("failed to attach {kind} {id} to {target}: {source}")]
pub struct AttachError {
    pub id: String,
    pub kind: ResourceKind,
    pub target: String,
    #[source]
    pub source: ProviderError,
}

/// Some tasks in a batch failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} of {total} tasks failed: {}", failed.len(), failed.join(", "))]
pub struct PartialBatchFailure {
    pub total: usize,
    /// Labels of the failed tasks, in submission order
    pub failed: Vec<String>,
}

/// Crate-level error, carried by failed tasks and returned by drivers.
///
/// Variants are named with the `Error` suffix where they wrap another error type.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Timed out waiting for {what}: {source}")]
    WaitError {
        what: String,
        #[source]
        source: PollError,
    },

    #[error(transparent)]
    ProviderError(#[from] ProviderError),

    #[error(transparent)]
    DeleteError(#[from] DeleteError),

    #[error(transparent)]
    AttachError(#[from] AttachError),

    #[error(transparent)]
    BatchError(#[from] PartialBatchFailure),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Task {0} panicked")]
    TaskPanicked(String),

    #[error("Gave up waiting for task {0}; it keeps running in the background")]
    Abandoned(String),

    #[error("Executor is shut down, task {0} was never started")]
    ExecutorClosed(String),
}

impl Error {
    pub fn wait(what: impl Into<String>, source: PollError) -> Self {
        Error::WaitError {
            what: what.into(),
            source,
        }
    }

    /// Check if retrying the failed operation could help
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ProviderError(e) => e.is_transient(),
            Error::DeleteError(e) => e.source.is_transient(),
            Error::AttachError(e) => e.source.is_transient(),
            // Slow convergence may still finish, a failing status read will not
            Error::WaitError { source, .. } => matches!(source, PollError::Timeout(_)),
            Error::Abandoned(_) => true,
            Error::BatchError(_) => false,
            Error::SerializationError(_) => false,
            Error::InvalidConfig(_) => false,
            Error::TaskPanicked(_) => false,
            Error::ExecutorClosed(_) => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
