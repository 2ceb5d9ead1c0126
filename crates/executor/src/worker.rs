//! Pool workers
//!
//! Each worker owns one bounded queue and runs its tasks in FIFO order. The
//! pool keeps a [`WorkerHandle`] (the sending half) in its registry; the
//! [`Worker`] itself lives inside the spawned execution context and reaches
//! back to the pool only through a narrow [`PoolLink`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::{PoolEventKind, PoolMonitor, WorkerExit, WorkerRole};
use crate::lifecycle::LifecycleHook;
use crate::pool::PoolShared;
use crate::task::Task;

/// Registry entry for a live worker
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    id: u64,
    name: Arc<str>,
    role: WorkerRole,
    tx: mpsc::Sender<Task>,
}

impl WorkerHandle {
    pub(crate) fn new(id: u64, name: Arc<str>, role: WorkerRole, tx: mpsc::Sender<Task>) -> Self {
        Self { id, name, role, tx }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn role(&self) -> WorkerRole {
        self.role
    }

    /// Non-blocking enqueue; hands the task back if the queue is full or closed
    pub(crate) fn offer(&self, task: Task) -> Result<(), Task> {
        self.tx.try_send(task).map_err(TrySendError::into_inner)
    }

    pub(crate) fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub(crate) fn queue_is_empty(&self) -> bool {
        self.queued() == 0
    }
}

/// A worker's only way back to the pool
pub(crate) struct PoolLink {
    shared: Weak<PoolShared>,
}

impl PoolLink {
    pub(crate) fn new(shared: Weak<PoolShared>) -> Self {
        Self { shared }
    }

    /// Leave the pool as an idle worker, only while it stays at or above core size
    fn retire(&self, worker_id: u64) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.retire_idle(worker_id))
    }

    fn deregister(&self, worker_id: u64) {
        if let Some(shared) = self.shared.upgrade() {
            shared.deregister(worker_id);
        }
    }

    fn maintain_spare_workers(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.maintain_spare_workers();
        }
    }
}

pub(crate) struct Worker {
    pub(crate) id: u64,
    pub(crate) name: Arc<str>,
    pub(crate) role: WorkerRole,
    pub(crate) rx: mpsc::Receiver<Task>,
    pub(crate) keep_alive: Duration,
    pub(crate) stop: CancellationToken,
    pub(crate) drain: CancellationToken,
    pub(crate) monitor: Arc<PoolMonitor>,
    pub(crate) hook: Arc<dyn LifecycleHook>,
    pub(crate) link: PoolLink,
}

impl Worker {
    pub(crate) async fn run(mut self) {
        debug!(worker = %self.name, role = %self.role, "Worker started");

        let mut last_activity = Instant::now();
        let mut draining = false;

        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break WorkerExit::Interrupted,
                _ = self.drain.cancelled(), if !draining => {
                    debug!(worker = %self.name, "Graceful shutdown, draining queue");
                    self.rx.close();
                    draining = true;
                    continue;
                }
                next = tokio::time::timeout(self.keep_alive, self.rx.recv()) => next,
            };

            match next {
                Ok(Some(task)) => {
                    let finished = self.execute(task).await;
                    last_activity = Instant::now();
                    if !finished {
                        break WorkerExit::Interrupted;
                    }
                }
                Ok(None) if draining => break WorkerExit::Drained,
                Ok(None) => break WorkerExit::Detached,
                Err(_) => {
                    if self.retire_if_idle(last_activity.elapsed()) {
                        break WorkerExit::IdleTimeout;
                    }
                }
            }
        };

        self.finish(exit).await;
    }

    /// Run one task; `false` if a forceful shutdown interrupted it
    async fn execute(&mut self, task: Task) -> bool {
        let task_id = task.id();

        let outcome = {
            let _busy = self.monitor.enter_busy();
            debug!(worker = %self.name, task_id = %task_id, "Worker executes task");
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => None,
                outcome = task.run_on_worker(Arc::clone(&self.name)) => Some(outcome),
            }
        };

        match outcome {
            Some(Ok(())) => {
                self.monitor.task_completed();
                true
            }
            Some(Err(failure)) => {
                self.hook.on_task_failure(&self.name, &failure);
                self.monitor
                    .task_failed(&self.name, failure.task_id, &failure.message);
                true
            }
            None => {
                self.monitor.task_interrupted();
                debug!(worker = %self.name, task_id = %task_id, "Task interrupted");
                false
            }
        }
    }

    fn retire_if_idle(&self, idle_for: Duration) -> bool {
        if self.role.is_core() || idle_for < self.keep_alive {
            return false;
        }
        if !self.link.retire(self.id) {
            return false;
        }

        self.monitor.emit(PoolEventKind::WorkerIdleTimeout {
            worker: self.name.to_string(),
            idle_ms: u64::try_from(idle_for.as_millis()).unwrap_or(u64::MAX),
        });
        true
    }

    async fn finish(mut self, exit: WorkerExit) {
        self.rx.close();
        self.link.deregister(self.id);

        // Offers that raced in before the close still belong to this worker
        let mut abandoned = 0usize;
        while let Ok(task) = self.rx.try_recv() {
            if exit == WorkerExit::IdleTimeout && !self.stop.is_cancelled() {
                self.execute(task).await;
            } else {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            debug!(worker = %self.name, abandoned, "Queued tasks abandoned");
        }

        self.monitor.emit(PoolEventKind::WorkerTerminated {
            worker: self.name.to_string(),
            reason: exit,
        });
        self.link.maintain_spare_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;

    fn handle(capacity: usize) -> (WorkerHandle, mpsc::Receiver<Task>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            WorkerHandle::new(1, Arc::from("pool-worker-1"), WorkerRole::Core, tx),
            rx,
        )
    }

    fn noop(id: u64) -> Task {
        Task::fire_and_forget(TaskId::new(id), async {})
    }

    #[test]
    fn test_offer_until_full() {
        let (worker, _rx) = handle(2);
        assert!(worker.queue_is_empty());

        assert!(worker.offer(noop(1)).is_ok());
        assert!(worker.offer(noop(2)).is_ok());
        assert_eq!(worker.queued(), 2);

        let rejected = worker.offer(noop(3)).unwrap_err();
        assert_eq!(rejected.id(), TaskId::new(3));
    }

    #[test]
    fn test_offer_to_closed_queue_returns_task() {
        let (worker, mut rx) = handle(2);
        rx.close();
        let rejected = worker.offer(noop(9)).unwrap_err();
        assert_eq!(rejected.id(), TaskId::new(9));
    }

    #[tokio::test]
    async fn test_queue_frees_capacity_on_receive() {
        let (worker, mut rx) = handle(1);
        worker.offer(noop(1)).unwrap();
        assert!(!worker.queue_is_empty());

        let task = rx.recv().await.unwrap();
        assert_eq!(task.id(), TaskId::new(1));
        assert!(worker.queue_is_empty());
        assert_eq!(worker.name(), "pool-worker-1");
        assert_eq!(worker.role(), WorkerRole::Core);
    }

    #[test]
    fn test_detached_link_is_inert() {
        let link = PoolLink::new(Weak::new());
        assert!(!link.retire(1));
        link.deregister(1);
        link.maintain_spare_workers();
    }
}
