//! Observable pool events
//!
//! Every lifecycle transition the pool makes is published as a [`PoolEvent`]
//! on a broadcast channel and logged through `tracing`. Subscribers that fall
//! behind lose the oldest events; the pool itself never waits on them.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::task::TaskId;

pub const WORKER_CREATED: &str = "worker-created";
pub const TASK_ACCEPTED: &str = "task-accepted";
pub const TASK_REJECTED: &str = "task-rejected";
pub const WORKER_IDLE_TIMEOUT: &str = "worker-idle-timeout";
pub const WORKER_TERMINATED: &str = "worker-terminated";
pub const TASK_FAILURE: &str = "task-failure";
pub const SHUTDOWN_REQUESTED: &str = "shutdown-requested";

/// Why a worker was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// Created at construction, never retires from idleness
    Core,
    /// Created because the round-robin target's queue was full
    Overflow,
    /// Created to restore the spare worker target after an exit
    Spare,
}

impl WorkerRole {
    pub fn is_core(self) -> bool {
        self == Self::Core
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Core => write!(f, "core"),
            Self::Overflow => write!(f, "overflow"),
            Self::Spare => write!(f, "spare"),
        }
    }
}

/// Why a worker left its run loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerExit {
    /// Non-core worker idle for the keep-alive duration
    IdleTimeout,
    /// Graceful shutdown with an empty queue
    Drained,
    /// Forceful shutdown
    Interrupted,
    /// The pool was dropped and its queue handle released
    Detached,
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdleTimeout => write!(f, "idle_timeout"),
            Self::Drained => write!(f, "drained"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Detached => write!(f, "detached"),
        }
    }
}

/// Why a task was not queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Every queue full and the pool at its maximum size
    Saturated,
    /// The pool is draining or stopped
    PoolStopped,
}

/// Shutdown flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    Graceful,
    Immediate,
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEventKind {
    WorkerCreated {
        worker: String,
        role: WorkerRole,
    },
    TaskAccepted {
        task_id: TaskId,
        worker: String,
    },
    TaskRejected {
        task_id: TaskId,
        reason: RejectReason,
    },
    WorkerIdleTimeout {
        worker: String,
        idle_ms: u64,
    },
    WorkerTerminated {
        worker: String,
        reason: WorkerExit,
    },
    TaskFailed {
        task_id: TaskId,
        worker: String,
        message: String,
    },
    ShutdownRequested {
        mode: ShutdownMode,
    },
}

impl PoolEventKind {
    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkerCreated { .. } => WORKER_CREATED,
            Self::TaskAccepted { .. } => TASK_ACCEPTED,
            Self::TaskRejected { .. } => TASK_REJECTED,
            Self::WorkerIdleTimeout { .. } => WORKER_IDLE_TIMEOUT,
            Self::WorkerTerminated { .. } => WORKER_TERMINATED,
            Self::TaskFailed { .. } => TASK_FAILURE,
            Self::ShutdownRequested { .. } => SHUTDOWN_REQUESTED,
        }
    }

    fn log(&self) {
        match self {
            Self::WorkerCreated { worker, role } => {
                info!(worker = %worker, role = %role, "Worker created")
            }
            Self::TaskAccepted { task_id, worker } => {
                debug!(task_id = %task_id, worker = %worker, "Task accepted")
            }
            Self::TaskRejected { task_id, reason } => {
                warn!(task_id = %task_id, reason = ?reason, "Task rejected")
            }
            Self::WorkerIdleTimeout { worker, idle_ms } => {
                info!(worker = %worker, idle_ms, "Worker idle timeout, stopping")
            }
            Self::WorkerTerminated { worker, reason } => {
                info!(worker = %worker, reason = %reason, "Worker terminated")
            }
            // The lifecycle hook owns failure reporting
            Self::TaskFailed {
                task_id, worker, ..
            } => debug!(task_id = %task_id, worker = %worker, "Task failure recorded"),
            Self::ShutdownRequested { mode } => info!(mode = ?mode, "Shutdown requested"),
        }
    }
}

/// A timestamped event from one pool instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEvent {
    pub pool_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: PoolEventKind,
}

impl PoolEvent {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Shared counters and event fan-out
///
/// Held strongly by the pool and by every worker. Holds no reference back to
/// either, so workers can keep reporting after the pool handle is gone.
pub(crate) struct PoolMonitor {
    pool_id: Uuid,
    events: broadcast::Sender<PoolEvent>,
    busy: AtomicUsize,
    accepted: AtomicU64,
    rejected: AtomicU64,
    refused: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    interrupted: AtomicU64,
}

impl PoolMonitor {
    pub(crate) fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            pool_id: Uuid::now_v7(),
            events,
            busy: AtomicUsize::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            interrupted: AtomicU64::new(0),
        }
    }

    pub(crate) fn pool_id(&self) -> Uuid {
        self.pool_id
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, kind: PoolEventKind) {
        kind.log();
        // No subscribers is fine
        let _ = self.events.send(PoolEvent {
            pool_id: self.pool_id,
            timestamp: Utc::now(),
            kind,
        });
    }

    pub(crate) fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Mark a worker busy until the guard drops
    pub(crate) fn enter_busy(&self) -> BusyGuard<'_> {
        self.busy.fetch_add(1, Ordering::AcqRel);
        BusyGuard { monitor: self }
    }

    pub(crate) fn task_accepted(&self, task_id: TaskId, worker: &str) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.emit(PoolEventKind::TaskAccepted {
            task_id,
            worker: worker.to_string(),
        });
    }

    pub(crate) fn task_rejected(&self, task_id: TaskId, reason: RejectReason) {
        match reason {
            RejectReason::Saturated => self.rejected.fetch_add(1, Ordering::Relaxed),
            RejectReason::PoolStopped => self.refused.fetch_add(1, Ordering::Relaxed),
        };
        self.emit(PoolEventKind::TaskRejected { task_id, reason });
    }

    pub(crate) fn task_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_failed(&self, worker: &str, task_id: TaskId, message: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.emit(PoolEventKind::TaskFailed {
            task_id,
            worker: worker.to_string(),
            message: message.to_string(),
        });
    }

    pub(crate) fn task_interrupted(&self) {
        self.interrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn counters(&self) -> TaskCounters {
        TaskCounters {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
        }
    }
}

/// Lifetime task totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounters {
    pub accepted: u64,
    /// Handed to the rejection policy because the pool was saturated
    pub rejected: u64,
    /// Refused because the pool was draining or stopped
    pub refused: u64,
    pub completed: u64,
    pub failed: u64,
    pub interrupted: u64,
}

pub(crate) struct BusyGuard<'a> {
    monitor: &'a PoolMonitor,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.monitor.busy.fetch_sub(1, Ordering::AcqRel);
    }
}
