//! Worker lifecycle hooks
//!
//! A [`LifecycleHook`] names each worker, wraps its run loop into the
//! execution context the pool spawns, and observes task failures. It never
//! takes part in scheduling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{error, info, info_span, Instrument};

use crate::task::{TaskFailure, TaskId};

const RECENT_FAILURES: usize = 64;

/// A named worker body, ready to be spawned
pub struct ExecutionContext {
    name: String,
    work: BoxFuture<'static, ()>,
}

impl ExecutionContext {
    pub fn new(name: impl Into<String>, work: BoxFuture<'static, ()>) -> Self {
        Self {
            name: name.into(),
            work,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_future(self) -> BoxFuture<'static, ()> {
        self.work
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Creates worker execution contexts and observes escaping failures
pub trait LifecycleHook: Send + Sync + 'static {
    /// Unique, human-readable name for the next worker
    fn next_worker_name(&self) -> String;

    /// Wrap a worker's run loop into a spawnable context
    fn create_context(&self, name: String, work: BoxFuture<'static, ()>) -> ExecutionContext {
        let span = info_span!("worker", name = %name);
        ExecutionContext::new(name, work.instrument(span).boxed())
    }

    /// Observe a panic that escaped a task. Must not panic.
    fn on_task_failure(&self, worker: &str, failure: &TaskFailure) {
        error!(worker = %worker, task_id = %failure.task_id, "Uncaught in {}: {}", worker, failure.message);
    }
}

/// A failure attributed to the worker that ran it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub worker: String,
    pub task_id: TaskId,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Default hook: `"{pool}-worker-{n}"` names and a bounded failure log
///
/// # Example
///
/// ```
/// use spindle_executor::{LifecycleHook, NamedWorkerHook};
///
/// let hook = NamedWorkerHook::new("MyPool");
/// assert_eq!(hook.next_worker_name(), "MyPool-worker-1");
/// assert_eq!(hook.next_worker_name(), "MyPool-worker-2");
/// ```
#[derive(Debug)]
pub struct NamedWorkerHook {
    pool_name: String,
    counter: AtomicUsize,
    failures: AtomicU64,
    recent: Mutex<VecDeque<FailureRecord>>,
}

impl NamedWorkerHook {
    pub fn new(pool_name: impl Into<String>) -> Self {
        Self {
            pool_name: pool_name.into(),
            counter: AtomicUsize::new(0),
            failures: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_FAILURES)),
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// Total failures observed
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Most recent failures, oldest first
    pub fn recent_failures(&self) -> Vec<FailureRecord> {
        self.recent.lock().iter().cloned().collect()
    }
}

impl LifecycleHook for NamedWorkerHook {
    fn next_worker_name(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-worker-{}", self.pool_name, n)
    }

    fn create_context(&self, name: String, work: BoxFuture<'static, ()>) -> ExecutionContext {
        info!(pool = %self.pool_name, worker = %name, "Creating new worker");
        let span = info_span!("worker", pool = %self.pool_name, name = %name);
        ExecutionContext::new(name, work.instrument(span).boxed())
    }

    fn on_task_failure(&self, worker: &str, failure: &TaskFailure) {
        error!(
            worker = %worker,
            task_id = %failure.task_id,
            "Uncaught in {}: {}",
            worker,
            failure.message
        );

        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut recent = self.recent.lock();
        if recent.len() == RECENT_FAILURES {
            recent.pop_front();
        }
        recent.push_back(FailureRecord {
            worker: worker.to_string(),
            task_id: failure.task_id,
            message: failure.message.clone(),
            at: Utc::now(),
        });
    }
}
