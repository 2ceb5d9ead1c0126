//! Rejection (backpressure) policies
//!
//! Invoked exactly once for a task when the round-robin target is full, the
//! pool cannot grow, and no other worker's queue has room. The policy decides
//! what the caller observes.
//!
//! | Policy | Caller sees | Task |
//! |---|---|---|
//! | [`CallerRunsPolicy`] | `Ok(())` after the task ran | run inline on the caller |
//! | [`AbortPolicy`] | `Err(PoolError::Rejected)` | dropped |
//! | [`DiscardPolicy`] | `Ok(())` | dropped |

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::PoolError;
use crate::pool::{PoolShared, PoolStats};
use crate::task::{Task, TaskFailure};

/// Worker name that inline failures are attributed to
pub const CALLER: &str = "caller";

/// Pool view handed to a [`RejectionPolicy`]
pub struct RejectionContext<'a> {
    shared: &'a PoolShared,
}

impl<'a> RejectionContext<'a> {
    pub(crate) fn new(shared: &'a PoolShared) -> Self {
        Self { shared }
    }

    /// Pool name
    pub fn pool_name(&self) -> &str {
        &self.shared.config().name
    }

    /// Point-in-time pool statistics
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Report a failure through the lifecycle hook and event stream
    pub fn report_failure(&self, worker: &str, failure: &TaskFailure) {
        self.shared.report_failure(worker, failure);
    }
}

/// Backpressure strategy for tasks no queue could accept
#[async_trait]
pub trait RejectionPolicy: Send + Sync + 'static {
    /// Short policy name for logs
    fn name(&self) -> &'static str;

    /// Decide the fate of a rejected task
    async fn reject(&self, task: Task, ctx: &RejectionContext<'_>) -> Result<(), PoolError>;
}

/// Run the rejected task on the submitting caller
///
/// Never drops work and slows the producer down to the pool's pace, at the
/// cost of blocking the caller for the task's duration.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerRunsPolicy;

#[async_trait]
impl RejectionPolicy for CallerRunsPolicy {
    fn name(&self) -> &'static str {
        "caller_runs"
    }

    async fn reject(&self, task: Task, ctx: &RejectionContext<'_>) -> Result<(), PoolError> {
        let task_id = task.id();
        warn!(
            pool = %ctx.pool_name(),
            task_id = %task_id,
            "Task was rejected, executing in caller"
        );

        if let Err(failure) = task.run().await {
            ctx.report_failure(CALLER, &failure);
        }
        Ok(())
    }
}

/// Refuse the task with [`PoolError::Rejected`]
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortPolicy;

#[async_trait]
impl RejectionPolicy for AbortPolicy {
    fn name(&self) -> &'static str {
        "abort"
    }

    async fn reject(&self, task: Task, _ctx: &RejectionContext<'_>) -> Result<(), PoolError> {
        Err(PoolError::Rejected { task_id: task.id() })
    }
}

/// Silently drop the task
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardPolicy;

#[async_trait]
impl RejectionPolicy for DiscardPolicy {
    fn name(&self) -> &'static str {
        "discard"
    }

    async fn reject(&self, task: Task, ctx: &RejectionContext<'_>) -> Result<(), PoolError> {
        debug!(pool = %ctx.pool_name(), task_id = %task.id(), "Discarding rejected task");
        Ok(())
    }
}
