//! # Spindle Executor
//!
//! An auto-scaling, in-process worker pool for async tasks.
//!
//! ## Features
//!
//! - **Per-worker queues**: Each worker owns a bounded FIFO queue; there is no shared queue
//! - **Round-robin admission**: Tasks are spread over workers in rotation
//! - **Elastic sizing**: Grows up to `max_pool_size` under load, non-core workers retire after `keep_alive`
//! - **Spare workers**: Best-effort restoration of idle capacity when workers exit
//! - **Backpressure policies**: Caller-runs (default), abort or discard when saturated
//! - **Graceful and forceful shutdown**: Drain queues, or interrupt everything
//! - **Observable**: Every lifecycle transition is logged and broadcast as a [`PoolEvent`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  (admission, round-robin cursor, growth, shutdown state)    │
//! └─────────────────────────────────────────────────────────────┘
//!            │ offer (non-blocking)              │ saturated
//!            ▼                                   ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────┐
//! │   Worker queues (bounded)    │   │     RejectionPolicy      │
//! │  worker-1 │ worker-2 │ ...   │   │ (caller runs / abort /   │
//! └──────────────────────────────┘   │  discard)                │
//!            │                        └──────────────────────────┘
//!            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      LifecycleHook                           │
//! │  (worker names, execution context, failure observation)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use spindle_executor::prelude::*;
//!
//! let pool = WorkerPool::new(PoolConfig::new("MyPool"))?;
//!
//! for i in 0..15 {
//!     pool.execute(async move {
//!         println!("task {i} on {:?}", current_worker());
//!     })
//!     .await?;
//! }
//!
//! pool.shutdown();
//! pool.await_termination(Duration::from_secs(5)).await?;
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod policy;
pub mod pool;
pub mod task;
mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::PoolConfig;
    pub use crate::error::{PoolError, TaskError};
    pub use crate::event::{PoolEvent, PoolEventKind};
    pub use crate::lifecycle::{LifecycleHook, NamedWorkerHook};
    pub use crate::policy::{AbortPolicy, CallerRunsPolicy, DiscardPolicy, RejectionPolicy};
    pub use crate::pool::{PoolState, PoolStats, WorkerPool};
    pub use crate::task::{current_worker, TaskHandle, TaskId};
}

pub use config::{ConfigError, PoolConfig};
pub use error::{PoolError, TaskError};
pub use event::{
    PoolEvent, PoolEventKind, RejectReason, ShutdownMode, TaskCounters, WorkerExit, WorkerRole,
};
pub use lifecycle::{ExecutionContext, FailureRecord, LifecycleHook, NamedWorkerHook};
pub use policy::{
    AbortPolicy, CallerRunsPolicy, DiscardPolicy, RejectionContext, RejectionPolicy, CALLER,
};
pub use pool::{PoolState, PoolStats, WorkerPool};
pub use task::{current_worker, Task, TaskFailure, TaskHandle, TaskId};
