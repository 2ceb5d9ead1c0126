//! Pool and task errors

use crate::config::ConfigError;
use crate::task::TaskId;

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Invalid construction parameters
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Pool constructed outside of a tokio runtime
    #[error("worker pool must be created inside a tokio runtime")]
    NoRuntime,

    /// Submission after shutdown
    #[error("worker pool is shut down")]
    PoolStopped,

    /// Task refused by the rejection policy
    #[error("task {task_id} rejected: queues and worker count are saturated")]
    Rejected { task_id: TaskId },

    /// Workers still running when the termination wait expired
    #[error("timed out waiting for workers to terminate ({remaining} still running)")]
    ShutdownTimeout { remaining: usize },
}

/// Outcome errors observed through a [`TaskHandle`](crate::TaskHandle)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Cancelled through its handle before completing
    #[error("task was cancelled")]
    Cancelled,

    /// The task body panicked
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Dropped without completing (forceful shutdown or discarded on rejection)
    #[error("task was abandoned before completion")]
    Abandoned,
}
