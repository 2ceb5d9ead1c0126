//! Worker pool orchestrator
//!
//! Admission, round-robin dispatch, growth, spare-worker maintenance and the
//! shutdown state machine.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  shutdown()   ┌──────────┐  last worker exits  ┌─────────┐
//! │ Running │ ────────────► │ Draining │ ──────────────────► │ Stopped │
//! └─────────┘               └──────────┘                     └─────────┘
//!      │                          │ shutdown_now()                ▲
//!      └──────────────────────────┴───────────────────────────────┘
//!                       shutdown_now()
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::event::{
    PoolEvent, PoolEventKind, PoolMonitor, RejectReason, ShutdownMode, TaskCounters, WorkerRole,
};
use crate::lifecycle::{LifecycleHook, NamedWorkerHook};
use crate::policy::{CallerRunsPolicy, RejectionContext, RejectionPolicy};
use crate::task::{Task, TaskFailure, TaskHandle, TaskId};
use crate::worker::{PoolLink, Worker, WorkerHandle};

/// Pool lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PoolState {
    /// Accepting tasks
    Running = 0,
    /// Refusing new tasks, workers finishing their queues
    Draining = 1,
    /// Refusing new tasks, workers interrupted or all exited
    Stopped = 2,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_id: Uuid,
    pub name: String,
    pub state: PoolState,
    pub workers: usize,
    pub busy_workers: usize,
    pub queued_tasks: usize,
    #[serde(flatten)]
    pub tasks: TaskCounters,
}

type Registry = Arc<Vec<Arc<WorkerHandle>>>;

/// State shared by the pool handle and, weakly, by its workers
pub(crate) struct PoolShared {
    config: PoolConfig,
    hook: Arc<dyn LifecycleHook>,
    policy: Arc<dyn RejectionPolicy>,
    monitor: Arc<PoolMonitor>,
    /// Copy-on-write: readers clone the `Arc` and iterate without holding the lock
    registry: RwLock<Registry>,
    /// Reserved worker slots; the authority for the max/core bounds
    slots: AtomicUsize,
    cursor: AtomicUsize,
    next_task_id: AtomicU64,
    next_worker_id: AtomicU64,
    state: AtomicU8,
    stop: CancellationToken,
    drain: CancellationToken,
    tracker: TaskTracker,
    runtime: Handle,
}

impl PoolShared {
    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_running(&self) -> bool {
        self.state() == PoolState::Running
    }

    fn snapshot(&self) -> Registry {
        Arc::clone(&self.registry.read())
    }

    fn next_task_id(&self) -> TaskId {
        TaskId::new(self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let workers = self.snapshot();
        PoolStats {
            pool_id: self.monitor.pool_id(),
            name: self.config.name.clone(),
            state: self.state(),
            workers: workers.len(),
            busy_workers: self.monitor.busy(),
            queued_tasks: workers.iter().map(|w| w.queued()).sum(),
            tasks: self.monitor.counters(),
        }
    }

    pub(crate) fn report_failure(&self, worker: &str, failure: &TaskFailure) {
        self.hook.on_task_failure(worker, failure);
        self.monitor
            .task_failed(worker, failure.task_id, &failure.message);
    }

    /// Admit a task: offer, grow, try the other queues, then delegate to the rejection policy
    async fn dispatch(self: &Arc<Self>, task: Task) -> Result<(), PoolError> {
        let task_id = task.id();

        if !self.is_running() {
            self.monitor.task_rejected(task_id, RejectReason::PoolStopped);
            return Err(PoolError::PoolStopped);
        }

        let task = match self.offer(task) {
            Ok(()) => return Ok(()),
            Err(task) => task,
        };

        // A shutdown racing the offer closes queues; report it as such
        if !self.is_running() {
            self.monitor.task_rejected(task_id, RejectReason::PoolStopped);
            return Err(PoolError::PoolStopped);
        }

        self.monitor.task_rejected(task_id, RejectReason::Saturated);
        let ctx = RejectionContext::new(self);
        self.policy.reject(task, &ctx).await
    }

    fn offer(self: &Arc<Self>, task: Task) -> Result<(), Task> {
        let workers = self.snapshot();
        let len = workers.len();
        let start = if len == 0 {
            0
        } else {
            self.cursor.fetch_add(1, Ordering::Relaxed) % len
        };

        let mut task = task;
        let task_id = task.id();

        if let Some(target) = workers.get(start) {
            task = match target.offer(task) {
                Ok(()) => {
                    self.monitor.task_accepted(task_id, target.name());
                    return Ok(());
                }
                Err(task) => task,
            };
        }

        // Fresh queues are empty, so this only fails if shutdown closed it
        if let Some(worker) = self.spawn_worker(WorkerRole::Overflow) {
            task = match worker.offer(task) {
                Ok(()) => {
                    debug!(
                        task_id = %task_id,
                        worker = %worker.name(),
                        role = %worker.role(),
                        "Task accepted after scaling"
                    );
                    self.monitor.task_accepted(task_id, worker.name());
                    return Ok(());
                }
                Err(task) => task,
            };
        }

        for offset in 1..len {
            let worker = &workers[(start + offset) % len];
            task = match worker.offer(task) {
                Ok(()) => {
                    self.monitor.task_accepted(task_id, worker.name());
                    return Ok(());
                }
                Err(task) => task,
            };
        }

        Err(task)
    }

    /// Start a worker if the role is allowed now and a slot is free
    fn spawn_worker(self: &Arc<Self>, role: WorkerRole) -> Option<Arc<WorkerHandle>> {
        if !role.is_core() && !self.is_running() {
            return None;
        }

        let max = self.config.max_pool_size;
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;

        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let name: Arc<str> = Arc::from(self.hook.next_worker_name());
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);

        let handle = Arc::new(WorkerHandle::new(id, Arc::clone(&name), role, tx));
        Arc::make_mut(&mut *self.registry.write()).push(Arc::clone(&handle));

        let worker = Worker {
            id,
            name: Arc::clone(&name),
            role,
            rx,
            keep_alive: self.config.keep_alive,
            stop: self.stop.child_token(),
            drain: self.drain.child_token(),
            monitor: Arc::clone(&self.monitor),
            hook: Arc::clone(&self.hook),
            link: PoolLink::new(Arc::downgrade(self)),
        };

        self.monitor.emit(PoolEventKind::WorkerCreated {
            worker: name.to_string(),
            role,
        });

        let context = self.hook.create_context(name.to_string(), worker.run().boxed());
        self.tracker.spawn_on(context.into_future(), &self.runtime);

        Some(handle)
    }

    /// Release one slot for an idle non-core worker, never going below core
    fn release_idle_slot(&self) -> bool {
        let core = self.config.core_pool_size;
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > core).then(|| n - 1)
            })
            .is_ok()
    }

    /// Retire an idle worker: release its slot and drop it from the registry
    ///
    /// Both happen under the registry write lock, so a concurrent spawn that
    /// takes the freed slot can only register after this entry is gone.
    pub(crate) fn retire_idle(&self, worker_id: u64) -> bool {
        let remaining = {
            let mut registry = self.registry.write();
            if !self.release_idle_slot() {
                return false;
            }
            if let Some(index) = registry.iter().position(|w| w.id() == worker_id) {
                Arc::make_mut(&mut *registry).remove(index);
            }
            registry.len()
        };

        self.stop_if_drained(remaining);
        true
    }

    pub(crate) fn deregister(&self, worker_id: u64) {
        let remaining = {
            let mut registry = self.registry.write();
            // Retired workers already left the registry and gave their slot back
            let Some(index) = registry.iter().position(|w| w.id() == worker_id) else {
                return;
            };
            Arc::make_mut(&mut *registry).remove(index);
            self.slots.fetch_sub(1, Ordering::AcqRel);
            registry.len()
        };

        self.stop_if_drained(remaining);
    }

    fn stop_if_drained(&self, remaining: usize) {
        if remaining == 0
            && self
                .state
                .compare_exchange(
                    PoolState::Draining as u8,
                    PoolState::Stopped as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            info!(pool = %self.config.name, "All workers drained, pool stopped");
        }
    }

    /// Restore the spare worker target after a worker exit
    ///
    /// A worker counts as idle when no worker in the pool is busy or its own
    /// queue is empty. This is a pool-wide approximation, not per-worker
    /// accounting.
    pub(crate) fn maintain_spare_workers(self: &Arc<Self>) {
        let target = self.config.min_spare_workers;
        if target == 0 || !self.is_running() {
            return;
        }

        let busy = self.monitor.busy();
        let mut idle = self
            .snapshot()
            .iter()
            .filter(|w| busy == 0 || w.queue_is_empty())
            .count();

        while idle < target {
            match self.spawn_worker(WorkerRole::Spare) {
                Some(worker) => {
                    debug!(worker = %worker.name(), idle, target, "Spawned spare worker");
                    idle += 1;
                }
                None => break,
            }
        }
    }

    fn shutdown(&self) {
        let requested = self
            .state
            .compare_exchange(
                PoolState::Running as u8,
                PoolState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if requested {
            self.monitor.emit(PoolEventKind::ShutdownRequested {
                mode: ShutdownMode::Graceful,
            });
        }

        self.drain.cancel();
        self.tracker.close();
    }

    fn shutdown_now(&self) {
        let previous = self
            .state
            .swap(PoolState::Stopped as u8, Ordering::AcqRel);

        if PoolState::from_u8(previous) != PoolState::Stopped {
            self.monitor.emit(PoolEventKind::ShutdownRequested {
                mode: ShutdownMode::Immediate,
            });
        }

        self.stop.cancel();
        self.drain.cancel();
        self.tracker.close();
    }
}

/// Auto-scaling worker pool with per-worker queues
///
/// Tasks are spread round-robin over the workers' private bounded queues.
/// When the chosen queue is full the pool grows by one worker, up to
/// `max_pool_size`; when it cannot grow, the remaining queues are tried and
/// then the [`RejectionPolicy`] decides. Non-core workers retire after
/// `keep_alive` of idleness.
///
/// Must be created inside a tokio runtime. Dropping the pool performs a
/// graceful [`shutdown`](Self::shutdown).
///
/// # Example
///
/// ```ignore
/// use spindle_executor::{PoolConfig, WorkerPool};
///
/// let pool = WorkerPool::new(PoolConfig::new("MyPool"))?;
///
/// pool.execute(async { do_work().await }).await?;
/// let answer = pool.submit(async { 40 + 2 }).await?.await?;
///
/// pool.shutdown();
/// pool.await_termination(Duration::from_secs(5)).await?;
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Create a pool with [`NamedWorkerHook`] and [`CallerRunsPolicy`]
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let hook = Arc::new(NamedWorkerHook::new(config.name.clone()));
        Self::with_parts(config, hook, Arc::new(CallerRunsPolicy))
    }

    /// Create a pool with a custom lifecycle hook and rejection policy
    ///
    /// Validates the configuration and starts `core_pool_size` workers.
    #[instrument(skip_all, fields(pool = %config.name))]
    pub fn with_parts(
        config: PoolConfig,
        hook: Arc<dyn LifecycleHook>,
        policy: Arc<dyn RejectionPolicy>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;

        info!(
            core_pool_size = config.core_pool_size,
            max_pool_size = config.max_pool_size,
            queue_capacity = config.queue_capacity,
            keep_alive_ms = u64::try_from(config.keep_alive.as_millis()).unwrap_or(u64::MAX),
            min_spare_workers = config.min_spare_workers,
            policy = policy.name(),
            "Starting worker pool"
        );

        let shared = Arc::new(PoolShared {
            monitor: Arc::new(PoolMonitor::new(config.event_capacity)),
            registry: RwLock::new(Arc::new(Vec::with_capacity(config.max_pool_size))),
            slots: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            next_task_id: AtomicU64::new(0),
            next_worker_id: AtomicU64::new(0),
            state: AtomicU8::new(PoolState::Running as u8),
            stop: CancellationToken::new(),
            drain: CancellationToken::new(),
            tracker: TaskTracker::new(),
            runtime,
            config,
            hook,
            policy,
        });

        for _ in 0..shared.config.core_pool_size {
            shared.spawn_worker(WorkerRole::Core);
        }

        Ok(Self { shared })
    }

    /// Admit a fire-and-forget task
    ///
    /// Returns once the task is queued, or once the rejection policy has
    /// handled it. Fails with [`PoolError::PoolStopped`] after shutdown.
    pub async fn execute<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.shared.next_task_id();
        self.shared
            .dispatch(Task::fire_and_forget(id, task))
            .await
    }

    /// Admit a value-producing task, returning a cancellable handle
    pub async fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.shared.next_task_id();
        let (task, handle) = Task::with_handle(id, task);
        self.shared.dispatch(task).await?;
        Ok(handle)
    }

    /// Stop accepting tasks and let workers drain their queues
    ///
    /// Idempotent and non-blocking; use
    /// [`await_termination`](Self::await_termination) to wait.
    #[instrument(skip(self), fields(pool = %self.shared.config.name))]
    pub fn shutdown(&self) {
        info!("Shutdown requested (graceful)");
        self.shared.shutdown();
    }

    /// Stop accepting tasks and interrupt every worker
    ///
    /// Running tasks are dropped at their next `.await`; queued tasks are
    /// abandoned. Idempotent and non-blocking.
    #[instrument(skip(self), fields(pool = %self.shared.config.name))]
    pub fn shutdown_now(&self) {
        info!("Shutdown now requested");
        self.shared.shutdown_now();
    }

    /// Wait for every worker to exit after a shutdown
    ///
    /// Waits for the shutdown itself if none was requested yet.
    pub async fn await_termination(&self, timeout: Duration) -> Result<(), PoolError> {
        match tokio::time::timeout(timeout, self.shared.tracker.wait()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(PoolError::ShutdownTimeout {
                remaining: self.shared.tracker.len(),
            }),
        }
    }

    /// Subscribe to pool events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.monitor.subscribe()
    }

    /// Pool instance ID (also carried by every event)
    pub fn id(&self) -> Uuid {
        self.shared.monitor.pool_id()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    /// Whether shutdown or shutdown_now has been called
    pub fn is_shutdown(&self) -> bool {
        self.state() != PoolState::Running
    }

    /// Live workers in the registry
    pub fn worker_count(&self) -> usize {
        self.shared.snapshot().len()
    }

    /// Workers currently running a task
    pub fn busy_workers(&self) -> usize {
        self.shared.monitor.busy()
    }

    /// Names of live workers, in rotation order
    pub fn worker_names(&self) -> Vec<String> {
        self.shared
            .snapshot()
            .iter()
            .map(|w| w.name().to_string())
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.config.name)
            .field("state", &self.state())
            .field("workers", &self.worker_count())
            .finish()
    }
}
