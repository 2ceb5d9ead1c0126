//! Units of work and their handles

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

tokio::task_local! {
    static CURRENT_WORKER: Arc<str>;
}

/// Name of the worker executing the current task
///
/// Returns `None` when called outside a pool worker, including when a
/// rejected task runs inline on the submitting caller.
pub fn current_worker() -> Option<String> {
    CURRENT_WORKER.try_with(|name| name.to_string()).ok()
}

/// Pool-unique task identifier, assigned at admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Wrap a raw identifier
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw identifier
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A panic that escaped a task body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Task that failed
    pub task_id: TaskId,
    /// Panic payload rendered as text
    pub message: String,
}

impl TaskFailure {
    fn from_panic(task_id: TaskId, payload: &(dyn Any + Send)) -> Self {
        Self {
            task_id,
            message: panic_message(payload),
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} panicked: {}", self.task_id, self.message)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// An admitted unit of work
///
/// Handed to a [`RejectionPolicy`](crate::RejectionPolicy) when no queue can
/// take it; the policy decides whether to run it, drop it, or refuse it.
pub struct Task {
    id: TaskId,
    body: BoxFuture<'static, ()>,
}

impl Task {
    pub(crate) fn fire_and_forget<F>(id: TaskId, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            id,
            body: fut.boxed(),
        }
    }

    /// Wrap a value-producing future, returning the task and its handle
    ///
    /// A panic is delivered to the handle and then resumed, so the worker
    /// still observes and reports it.
    pub(crate) fn with_handle<F, T>(id: TaskId, fut: F) -> (Self, TaskHandle<T>)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let body = async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    let _ = tx.send(Err(TaskError::Cancelled));
                    return;
                }
                result = AssertUnwindSafe(fut).catch_unwind() => result,
            };

            match result {
                Ok(value) => {
                    let _ = tx.send(Ok(value));
                }
                Err(payload) => {
                    let _ = tx.send(Err(TaskError::Panicked(panic_message(payload.as_ref()))));
                    std::panic::resume_unwind(payload);
                }
            }
        };

        let handle = TaskHandle { id, rx, cancel };
        (Self::fire_and_forget(id, body), handle)
    }

    /// Task identifier
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Run the task to completion, catching any panic
    pub async fn run(self) -> Result<(), TaskFailure> {
        let Task { id, body } = self;
        AssertUnwindSafe(body)
            .catch_unwind()
            .await
            .map_err(|payload| TaskFailure::from_panic(id, payload.as_ref()))
    }

    pub(crate) async fn run_on_worker(self, worker: Arc<str>) -> Result<(), TaskFailure> {
        CURRENT_WORKER.scope(worker, self.run()).await
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Handle to a submitted value-producing task
///
/// Resolves with the task's output, or with a [`TaskError`] if the task
/// panicked, was cancelled, or was abandoned. Dropping the handle does not
/// cancel the task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: TaskId,
    rx: oneshot::Receiver<Result<T, TaskError>>,
    cancel: CancellationToken,
}

impl<T> TaskHandle<T> {
    /// Task identifier
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Request cancellation
    ///
    /// A task that has not started resolves to [`TaskError::Cancelled`]
    /// without running; a running task is dropped at its next `.await`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskError::Abandoned)))
    }
}
