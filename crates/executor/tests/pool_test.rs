// Integration tests for the worker pool
//
// Most tests run on tokio's paused clock so that sleeps inside tasks and the
// keep-alive timers advance deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use spindle_executor::{
    current_worker, AbortPolicy, CallerRunsPolicy, DiscardPolicy, NamedWorkerHook, PoolConfig,
    PoolError, PoolEventKind, PoolState, RejectReason, RejectionContext, RejectionPolicy,
    ShutdownMode, Task, TaskError, TaskId, WorkerExit, WorkerPool, WorkerRole, CALLER,
};
use tokio::sync::{broadcast, oneshot};
use tokio::time::sleep;

/// Counts rejections and drops the task
#[derive(Default)]
struct CountingPolicy {
    rejected: AtomicUsize,
}

#[async_trait]
impl RejectionPolicy for CountingPolicy {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn reject(&self, _task: Task, _ctx: &RejectionContext<'_>) -> Result<(), PoolError> {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn counting_pool(config: PoolConfig) -> (WorkerPool, Arc<CountingPolicy>) {
    let policy = Arc::new(CountingPolicy::default());
    let hook = Arc::new(NamedWorkerHook::new(config.name.clone()));
    let pool = WorkerPool::with_parts(config, hook, policy.clone()).unwrap();
    (pool, policy)
}

fn drain_events(rx: &mut broadcast::Receiver<spindle_executor::PoolEvent>) -> Vec<PoolEventKind> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.kind);
    }
    events
}

#[test]
fn test_construction_requires_runtime() {
    let err = WorkerPool::new(PoolConfig::new("MyPool")).unwrap_err();
    assert!(matches!(err, PoolError::NoRuntime));
}

#[tokio::test]
async fn test_construction_starts_core_workers() {
    let pool = WorkerPool::new(PoolConfig::new("MyPool")).unwrap();

    assert_eq!(pool.worker_count(), 2);
    assert_eq!(pool.busy_workers(), 0);
    assert_eq!(pool.state(), PoolState::Running);
    assert!(!pool.is_shutdown());
    assert_eq!(
        pool.worker_names(),
        vec!["MyPool-worker-1".to_string(), "MyPool-worker-2".to_string()]
    );
    assert_eq!(pool.config().name, "MyPool");
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let err = WorkerPool::new(PoolConfig::new("bad").with_max_pool_size(1)).unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_fifteen_slow_tasks_grow_to_max_without_rejection() {
    let (pool, policy) = counting_pool(PoolConfig::new("MyPool"));
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..15 {
        let done = done.clone();
        pool.execute(async move {
            sleep(Duration::from_secs(2)).await;
            done.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    }

    assert_eq!(pool.worker_count(), 4);
    assert_eq!(policy.rejected.load(Ordering::SeqCst), 0);
    assert_eq!(pool.stats().queued_tasks, 15);

    sleep(Duration::from_secs(30)).await;

    assert_eq!(done.load(Ordering::SeqCst), 15);
    let stats = pool.stats();
    assert_eq!(stats.tasks.accepted, 15);
    assert_eq!(stats.tasks.completed, 15);
    assert_eq!(stats.tasks.rejected, 0);
}

#[tokio::test(start_paused = true)]
async fn test_twenty_five_slow_tasks_reject_exactly_five() {
    let (pool, policy) = counting_pool(PoolConfig::new("MyPool"));

    for _ in 0..25 {
        pool.execute(async {
            sleep(Duration::from_secs(2)).await;
        })
        .await
        .unwrap();
    }

    assert_eq!(pool.worker_count(), 4);
    assert_eq!(policy.rejected.load(Ordering::SeqCst), 5);
    assert_eq!(pool.stats().tasks.rejected, 5);
    assert_eq!(pool.stats().queued_tasks, 20);

    pool.shutdown();
    pool.await_termination(Duration::from_secs(60)).await.unwrap();
    assert_eq!(pool.stats().tasks.completed, 20);
}

#[tokio::test]
async fn test_caller_runs_executes_every_task_once() {
    let pool = WorkerPool::new(PoolConfig::new("MyPool")).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let inline = Arc::new(AtomicUsize::new(0));

    for i in 0..25 {
        let seen = seen.clone();
        let inline = inline.clone();
        pool.execute(async move {
            if current_worker().is_none() {
                inline.fetch_add(1, Ordering::SeqCst);
            }
            seen.lock().push(i);
        })
        .await
        .unwrap();
    }

    pool.shutdown();
    pool.await_termination(Duration::from_secs(5)).await.unwrap();

    let mut seen = seen.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..25).collect::<Vec<_>>());
    assert_eq!(inline.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_round_robin_spreads_evenly() {
    let config = PoolConfig::new("rr")
        .with_core_pool_size(4)
        .with_max_pool_size(4)
        .with_queue_capacity(100);
    let pool = WorkerPool::new(config).unwrap();
    let per_worker: Arc<Mutex<HashMap<String, usize>>> = Arc::default();

    for _ in 0..40 {
        let per_worker = per_worker.clone();
        pool.execute(async move {
            let worker = current_worker().unwrap_or_default();
            *per_worker.lock().entry(worker).or_default() += 1;
        })
        .await
        .unwrap();
    }

    pool.shutdown();
    pool.await_termination(Duration::from_secs(5)).await.unwrap();

    let per_worker = per_worker.lock();
    assert_eq!(per_worker.len(), 4);
    for n in 1..=4 {
        assert_eq!(per_worker.get(&format!("rr-worker-{n}")), Some(&10));
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_overflow_workers_retire_after_keep_alive() {
    let config = PoolConfig::new("elastic")
        .with_core_pool_size(1)
        .with_max_pool_size(3)
        .with_queue_capacity(1)
        .with_keep_alive(Duration::from_secs(5))
        .with_min_spare_workers(0);
    let pool = WorkerPool::new(config).unwrap();
    let mut events = pool.subscribe();

    for _ in 0..3 {
        pool.execute(async {
            sleep(Duration::from_secs(1)).await;
        })
        .await
        .unwrap();
    }
    assert_eq!(pool.worker_count(), 3);

    sleep(Duration::from_secs(20)).await;

    assert_eq!(pool.worker_count(), 1);
    assert_eq!(pool.worker_names(), vec!["elastic-worker-1".to_string()]);

    let events = drain_events(&mut events);
    let overflow = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                PoolEventKind::WorkerCreated {
                    role: WorkerRole::Overflow,
                    ..
                }
            )
        })
        .count();
    let idle = events
        .iter()
        .filter(|e| matches!(e, PoolEventKind::WorkerIdleTimeout { .. }))
        .count();
    assert_eq!(overflow, 2);
    assert_eq!(idle, 2);
}

#[tokio::test(start_paused = true)]
async fn test_core_workers_never_retire() {
    let config = PoolConfig::new("core")
        .with_keep_alive(Duration::from_millis(100))
        .with_min_spare_workers(0);
    let pool = WorkerPool::new(config).unwrap();

    sleep(Duration::from_secs(5)).await;
    assert_eq!(pool.worker_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_spare_worker_replaces_retired_worker() {
    let config = PoolConfig::new("spare")
        .with_core_pool_size(1)
        .with_max_pool_size(3)
        .with_queue_capacity(1)
        .with_keep_alive(Duration::from_secs(5))
        .with_min_spare_workers(2);
    let pool = WorkerPool::new(config).unwrap();
    let mut events = pool.subscribe();

    for _ in 0..2 {
        pool.execute(async {
            sleep(Duration::from_secs(1)).await;
        })
        .await
        .unwrap();
    }
    assert_eq!(pool.worker_count(), 2);

    sleep(Duration::from_secs(7)).await;

    assert_eq!(pool.worker_count(), 2);
    let events = drain_events(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        PoolEventKind::WorkerCreated {
            role: WorkerRole::Spare,
            ..
        }
    )));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_graceful_shutdown_drains_queued_tasks() {
    let config = PoolConfig::new("drain")
        .with_max_pool_size(2)
        .with_min_spare_workers(0);
    let pool = WorkerPool::new(config).unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..6 {
        let done = done.clone();
        pool.execute(async move {
            sleep(Duration::from_secs(1)).await;
            done.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    }

    pool.shutdown();
    assert_eq!(pool.state(), PoolState::Draining);
    assert!(matches!(
        pool.execute(async {}).await,
        Err(PoolError::PoolStopped)
    ));

    pool.await_termination(Duration::from_secs(60)).await.unwrap();

    assert_eq!(done.load(Ordering::SeqCst), 6);
    assert_eq!(pool.state(), PoolState::Stopped);
    assert_eq!(pool.worker_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_now_interrupts_and_abandons() {
    let config = PoolConfig::new("abort")
        .with_core_pool_size(1)
        .with_max_pool_size(1)
        .with_min_spare_workers(0);
    let pool = WorkerPool::new(config).unwrap();

    let mut handles = Vec::new();
    for i in 0..3 {
        let handle = pool
            .submit(async move {
                sleep(Duration::from_secs(10)).await;
                i
            })
            .await
            .unwrap();
        handles.push(handle);
    }

    sleep(Duration::from_secs(1)).await;
    assert_eq!(pool.busy_workers(), 1);

    pool.shutdown_now();
    pool.await_termination(Duration::from_secs(5)).await.unwrap();

    for handle in handles {
        assert_eq!(handle.await, Err(TaskError::Abandoned));
    }
    let stats = pool.stats();
    assert_eq!(stats.state, PoolState::Stopped);
    assert_eq!(stats.tasks.interrupted, 1);
    assert_eq!(stats.tasks.completed, 0);
    assert_eq!(pool.worker_count(), 0);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let pool = WorkerPool::new(PoolConfig::new("idem").with_min_spare_workers(0)).unwrap();
    let mut events = pool.subscribe();

    pool.shutdown();
    pool.shutdown();
    pool.shutdown_now();
    pool.shutdown_now();
    pool.shutdown();
    pool.await_termination(Duration::from_secs(5)).await.unwrap();

    let modes: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            PoolEventKind::ShutdownRequested { mode } => Some(mode),
            _ => None,
        })
        .collect();
    assert_eq!(modes, vec![ShutdownMode::Graceful, ShutdownMode::Immediate]);
}

#[tokio::test(start_paused = true)]
async fn test_await_termination_times_out() {
    let config = PoolConfig::new("slow")
        .with_core_pool_size(1)
        .with_min_spare_workers(0);
    let pool = WorkerPool::new(config).unwrap();

    pool.execute(async {
        sleep(Duration::from_secs(100)).await;
    })
    .await
    .unwrap();

    pool.shutdown();
    let err = pool
        .await_termination(Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ShutdownTimeout { remaining: 1 }));
}

#[tokio::test]
async fn test_panicking_task_does_not_kill_worker() {
    let config = PoolConfig::new("iso")
        .with_core_pool_size(1)
        .with_max_pool_size(1)
        .with_min_spare_workers(0);
    let hook = Arc::new(NamedWorkerHook::new("iso"));
    let pool = WorkerPool::with_parts(config, hook.clone(), Arc::new(AbortPolicy)).unwrap();
    let mut events = pool.subscribe();

    pool.execute(async { panic!("task blew up") }).await.unwrap();

    let (tx, rx) = oneshot::channel();
    pool.execute(async move {
        let _ = tx.send(current_worker());
    })
    .await
    .unwrap();

    assert_eq!(rx.await.unwrap().as_deref(), Some("iso-worker-1"));
    assert_eq!(pool.worker_count(), 1);

    assert_eq!(hook.failure_count(), 1);
    let failure = &hook.recent_failures()[0];
    assert_eq!(failure.worker, "iso-worker-1");
    assert_eq!(failure.message, "task blew up");
    assert_eq!(pool.stats().tasks.failed, 1);

    assert!(drain_events(&mut events).iter().any(|e| matches!(
        e,
        PoolEventKind::TaskFailed { worker, .. } if worker == "iso-worker-1"
    )));
}

#[tokio::test(start_paused = true)]
async fn test_abort_policy_returns_rejected() {
    let config = PoolConfig::new("strict")
        .with_core_pool_size(1)
        .with_max_pool_size(1)
        .with_queue_capacity(1)
        .with_min_spare_workers(0);
    let hook = Arc::new(NamedWorkerHook::new("strict"));
    let pool = WorkerPool::with_parts(config, hook, Arc::new(AbortPolicy)).unwrap();

    pool.execute(async { sleep(Duration::from_secs(5)).await })
        .await
        .unwrap();
    let err = pool
        .execute(async { sleep(Duration::from_secs(5)).await })
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::Rejected { task_id } if task_id == TaskId::new(2)));
    assert_eq!(pool.stats().tasks.rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn test_discard_policy_drops_silently() {
    let config = PoolConfig::new("lossy")
        .with_core_pool_size(1)
        .with_max_pool_size(1)
        .with_queue_capacity(1)
        .with_min_spare_workers(0);
    let hook = Arc::new(NamedWorkerHook::new("lossy"));
    let pool = WorkerPool::with_parts(config, hook, Arc::new(DiscardPolicy)).unwrap();

    let first = pool.submit(async { 1 }).await.unwrap();
    let second = pool.submit(async { 2 }).await.unwrap();

    assert_eq!(first.await, Ok(1));
    assert_eq!(second.await, Err(TaskError::Abandoned));
    assert_eq!(pool.stats().tasks.rejected, 1);
}

#[tokio::test]
async fn test_submit_returns_value_and_panic() {
    let pool = WorkerPool::new(PoolConfig::new("values")).unwrap();

    let answer = pool.submit(async { 40 + 2 }).await.unwrap();
    assert_eq!(answer.await, Ok(42));

    let boom = pool
        .submit(async {
            if true {
                panic!("no value");
            }
            0
        })
        .await
        .unwrap();
    assert_eq!(boom.await, Err(TaskError::Panicked("no value".into())));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_task() {
    let config = PoolConfig::new("cancel")
        .with_core_pool_size(1)
        .with_max_pool_size(1)
        .with_min_spare_workers(0);
    let pool = WorkerPool::new(config).unwrap();

    let blocker = pool
        .submit(async { sleep(Duration::from_secs(3)).await })
        .await
        .unwrap();
    let queued = pool.submit(async { "ran" }).await.unwrap();

    queued.cancel();
    assert_eq!(queued.await, Err(TaskError::Cancelled));
    assert_eq!(blocker.await, Ok(()));
}

#[tokio::test]
async fn test_events_carry_pool_id() {
    let pool = WorkerPool::new(PoolConfig::new("ids")).unwrap();
    let mut events = pool.subscribe();

    let handle = pool.submit(async {}).await.unwrap();
    handle.await.unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(event.pool_id, pool.id());
    assert_eq!(event.name(), "task-accepted");
}

#[tokio::test(start_paused = true)]
async fn test_inline_panic_is_attributed_to_caller() {
    let config = PoolConfig::new("inline")
        .with_core_pool_size(1)
        .with_max_pool_size(1)
        .with_queue_capacity(1)
        .with_min_spare_workers(0);
    let hook = Arc::new(NamedWorkerHook::new("inline"));
    let pool = WorkerPool::with_parts(config, hook.clone(), Arc::new(CallerRunsPolicy)).unwrap();
    let mut events = pool.subscribe();

    pool.execute(async { sleep(Duration::from_secs(5)).await })
        .await
        .unwrap();
    pool.execute(async { panic!("inline boom") }).await.unwrap();

    assert_eq!(hook.failure_count(), 1);
    let failure = &hook.recent_failures()[0];
    assert_eq!(failure.worker, CALLER);
    assert_eq!(failure.task_id, TaskId::new(2));
    assert_eq!(failure.message, "inline boom");

    let stats = pool.stats();
    assert_eq!(stats.tasks.rejected, 1);
    assert_eq!(stats.tasks.failed, 1);

    assert!(drain_events(&mut events).iter().any(|e| matches!(
        e,
        PoolEventKind::TaskFailed { worker, .. } if worker == CALLER
    )));
}

#[tokio::test]
async fn test_submissions_after_shutdown_are_refused() {
    let (pool, policy) = counting_pool(PoolConfig::new("closed").with_min_spare_workers(0));
    let mut events = pool.subscribe();

    pool.shutdown();

    assert!(matches!(
        pool.submit(async { 1 }).await,
        Err(PoolError::PoolStopped)
    ));
    assert!(matches!(
        pool.execute(async {}).await,
        Err(PoolError::PoolStopped)
    ));

    let reasons: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            PoolEventKind::TaskRejected { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(
        reasons,
        vec![RejectReason::PoolStopped, RejectReason::PoolStopped]
    );

    let stats = pool.stats();
    assert_eq!(stats.tasks.refused, 2);
    assert_eq!(stats.tasks.rejected, 0);
    assert_eq!(policy.rejected.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_submit_after_shutdown_now_fails() {
    let pool = WorkerPool::new(PoolConfig::new("halted")).unwrap();
    pool.shutdown_now();

    assert!(matches!(
        pool.submit(async { "late" }).await,
        Err(PoolError::PoolStopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_every_worker_exit_emits_terminated() {
    let config = PoolConfig::new("exits")
        .with_core_pool_size(1)
        .with_max_pool_size(2)
        .with_queue_capacity(1)
        .with_keep_alive(Duration::from_secs(5))
        .with_min_spare_workers(0);
    let pool = WorkerPool::new(config).unwrap();
    let mut events = pool.subscribe();

    for _ in 0..2 {
        pool.execute(async { sleep(Duration::from_secs(1)).await })
            .await
            .unwrap();
    }
    assert_eq!(pool.worker_count(), 2);

    // Overflow worker retires, then the core worker drains on shutdown
    sleep(Duration::from_secs(10)).await;
    pool.shutdown();
    pool.await_termination(Duration::from_secs(5)).await.unwrap();

    let mut exits: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            PoolEventKind::WorkerTerminated { worker, reason } => Some((worker, reason)),
            _ => None,
        })
        .collect();
    exits.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(
        exits,
        vec![
            ("exits-worker-1".to_string(), WorkerExit::Drained),
            ("exits-worker-2".to_string(), WorkerExit::IdleTimeout),
        ]
    );
    assert_eq!(pool.worker_count(), 0);
}
