//! ExecutorManager / ThreadPool Tests
//!
//! Tests for:
//! - Profile resolution and defaults
//! - Deterministic worker naming
//! - Rejected policies on a saturated pool
//! - Delayed tasks and their interruption
//! - Graceful, forced and manager-wide shutdown

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fc_mediation::executor::{PoolTask, DEFAULT_PROFILE_ID};
use fc_mediation::{ExecutorManager, MediationError, Registry, RejectedPolicy, ThreadPoolProfile};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

fn manager() -> ExecutorManager {
    ExecutorManager::new("ctx", "#contextId#-#name#-#counter#", Arc::new(Registry::new())).unwrap()
}

/// Task that counts runs and rejections
struct CountingTask {
    ran: Arc<AtomicU32>,
    rejected: Arc<AtomicU32>,
}

impl PoolTask for CountingTask {
    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        async move {
            self.ran.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    }

    fn reject(self: Box<Self>, _reason: &str) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }
}

fn counting(ran: &Arc<AtomicU32>, rejected: &Arc<AtomicU32>) -> Box<dyn PoolTask> {
    Box::new(CountingTask {
        ran: ran.clone(),
        rejected: rejected.clone(),
    })
}

/// A future that parks until `gate` is cancelled
fn blocked(gate: &CancellationToken) -> impl std::future::Future<Output = ()> + Send + 'static {
    let gate = gate.clone();
    async move { gate.cancelled().await }
}

fn single_slot(policy: RejectedPolicy) -> ThreadPoolProfile {
    ThreadPoolProfile::new("single")
        .pool_size(1)
        .max_pool_size(1)
        .max_queue_size(1)
        .rejected_policy(policy)
}

#[tokio::test]
async fn test_named_profile_resolution() {
    let manager = manager();
    manager.register_profile(ThreadPoolProfile::new("fast").pool_size(2).max_pool_size(4));

    let pool = manager.new_thread_pool("route1", "Fast", "fast").unwrap();
    let settings = pool.settings();
    assert_eq!(settings.pool_size, 2);
    assert_eq!(settings.max_pool_size, 4);
    assert_eq!(settings.max_queue_size, Some(1000));
    assert_eq!(settings.rejected_policy, RejectedPolicy::CallerRuns);

    let default = manager.new_thread_pool("route1", "Default", DEFAULT_PROFILE_ID).unwrap();
    assert_eq!(default.settings().pool_size, 10);

    assert!(matches!(
        manager.new_thread_pool("route1", "Missing", "nope"),
        Err(MediationError::ProfileNotFound(_))
    ));
    assert_eq!(manager.pools().len(), 2);
}

#[tokio::test]
async fn test_custom_default_profile_applies_to_new_pools() {
    let manager = manager();
    manager
        .set_default_profile(ThreadPoolProfile::new("mine").pool_size(3).max_pool_size(3))
        .unwrap();

    let pool = manager.new_default_thread_pool("route1", "Worker").unwrap();
    assert_eq!(pool.settings().pool_size, 3);
    // unset fields still come from the built-in default
    assert_eq!(pool.settings().max_queue_size, Some(1000));

    assert!(manager
        .set_default_profile(ThreadPoolProfile::new("bad").pool_size(5).max_pool_size(1))
        .is_err());
}

#[tokio::test]
async fn test_worker_names_follow_pattern() {
    let manager = manager();
    let pool = manager
        .new_thread_pool_with("route1", "Worker", &ThreadPoolProfile::new("w").pool_size(2).max_pool_size(2))
        .unwrap();

    let gate = CancellationToken::new();
    pool.submit(blocked(&gate)).await.unwrap();
    pool.submit(blocked(&gate)).await.unwrap();

    assert_eq!(pool.worker_names(), vec!["ctx-Worker-1".to_string(), "ctx-Worker-2".to_string()]);
    gate.cancel();
}

#[tokio::test]
async fn test_invalid_name_pattern() {
    let result = ExecutorManager::new("ctx", "#name#-#thread#", Arc::new(Registry::new()));
    assert!(matches!(result, Err(MediationError::Config(_))));
}

#[tokio::test]
async fn test_abort_policy_rejects_when_saturated() {
    let manager = manager();
    let pool = manager
        .new_thread_pool_with("route1", "Abort", &single_slot(RejectedPolicy::Abort))
        .unwrap();

    let gate = CancellationToken::new();
    pool.submit(blocked(&gate)).await.unwrap(); // worker
    pool.submit(blocked(&gate)).await.unwrap(); // queue

    let ran = Arc::new(AtomicU32::new(0));
    let rejected = Arc::new(AtomicU32::new(0));
    let result = pool.execute(counting(&ran, &rejected)).await;

    assert!(matches!(result, Err(MediationError::RejectedExecution(_))));
    assert_eq!(rejected.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().rejected, 1);
    gate.cancel();
}

#[tokio::test]
async fn test_caller_runs_policy() {
    let manager = manager();
    let pool = manager
        .new_thread_pool_with("route1", "CallerRuns", &single_slot(RejectedPolicy::CallerRuns))
        .unwrap();

    let gate = CancellationToken::new();
    pool.submit(blocked(&gate)).await.unwrap();
    pool.submit(blocked(&gate)).await.unwrap();

    let ran = Arc::new(AtomicU32::new(0));
    let rejected = Arc::new(AtomicU32::new(0));
    pool.execute(counting(&ran, &rejected)).await.unwrap();

    // Ran before execute returned
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(rejected.load(Ordering::SeqCst), 0);
    gate.cancel();
}

#[tokio::test]
async fn test_discard_oldest_policy() {
    let manager = manager();
    let pool = manager
        .new_thread_pool_with("route1", "DiscardOldest", &single_slot(RejectedPolicy::DiscardOldest))
        .unwrap();

    let gate = CancellationToken::new();
    pool.submit(blocked(&gate)).await.unwrap();

    let oldest_ran = Arc::new(AtomicU32::new(0));
    let oldest_rejected = Arc::new(AtomicU32::new(0));
    pool.execute(counting(&oldest_ran, &oldest_rejected)).await.unwrap();

    let newest_ran = Arc::new(AtomicU32::new(0));
    let newest_rejected = Arc::new(AtomicU32::new(0));
    pool.execute(counting(&newest_ran, &newest_rejected)).await.unwrap();

    assert_eq!(oldest_rejected.load(Ordering::SeqCst), 1);
    assert_eq!(pool.queue_size(), 1);

    gate.cancel();
    assert!(manager.shutdown_graceful(&pool, Duration::from_secs(1)).await);
    assert_eq!(newest_ran.load(Ordering::SeqCst), 1);
    assert_eq!(oldest_ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_discard_policy_drops_new_task() {
    let manager = manager();
    let pool = manager
        .new_thread_pool_with("route1", "Discard", &single_slot(RejectedPolicy::Discard))
        .unwrap();

    let gate = CancellationToken::new();
    pool.submit(blocked(&gate)).await.unwrap();
    pool.submit(blocked(&gate)).await.unwrap();

    let ran = Arc::new(AtomicU32::new(0));
    let rejected = Arc::new(AtomicU32::new(0));
    pool.execute(counting(&ran, &rejected)).await.unwrap();
    assert_eq!(rejected.load(Ordering::SeqCst), 1);
    gate.cancel();
}

#[tokio::test]
async fn test_burst_workers_above_core_size() {
    let manager = manager();
    let profile = ThreadPoolProfile::new("burst")
        .pool_size(1)
        .max_pool_size(3)
        .max_queue_size(1)
        .rejected_policy(RejectedPolicy::Abort);
    let pool = manager.new_thread_pool_with("route1", "Burst", &profile).unwrap();

    let gate = CancellationToken::new();
    for _ in 0..4 {
        pool.submit(blocked(&gate)).await.unwrap();
    }
    let stats = pool.stats();
    assert_eq!(stats.current_workers, 3);
    assert_eq!(stats.queued, 1);
    assert!(pool.submit(blocked(&gate)).await.is_err());
    gate.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_task_runs_after_delay() {
    let manager = manager();
    let pool = manager.new_scheduled_thread_pool("route1", "Scheduler", None).unwrap();

    let ran = Arc::new(AtomicU32::new(0));
    let rejected = Arc::new(AtomicU32::new(0));
    pool.schedule(Duration::from_secs(5), counting(&ran, &rejected)).unwrap();
    assert_eq!(pool.delayed_count(), 1);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(pool.delayed_count(), 0);
}

/// Delayed task that stops waiting once `gate` is cancelled
struct InterruptibleTask {
    gate: CancellationToken,
    inner: CountingTask,
    reasons: Arc<parking_lot::Mutex<Vec<String>>>,
}

impl PoolTask for InterruptibleTask {
    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        let this = *self;
        Box::new(this.inner).run()
    }

    fn reject(self: Box<Self>, reason: &str) {
        let this = *self;
        this.reasons.lock().push(reason.to_string());
        Box::new(this.inner).reject(reason);
    }

    fn interruption(&self) -> Option<BoxFuture<'static, ()>> {
        let gate = self.gate.clone();
        Some(async move { gate.cancelled().await }.boxed())
    }
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_delayed_task_is_rejected_early() {
    let manager = manager();
    let pool = manager.new_scheduled_thread_pool("route1", "Scheduler", None).unwrap();

    let ran = Arc::new(AtomicU32::new(0));
    let rejected = Arc::new(AtomicU32::new(0));
    let reasons = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let gate = CancellationToken::new();
    let task = InterruptibleTask {
        gate: gate.clone(),
        inner: CountingTask {
            ran: ran.clone(),
            rejected: rejected.clone(),
        },
        reasons: reasons.clone(),
    };
    pool.schedule(Duration::from_secs(30), Box::new(task)).unwrap();

    let started = tokio::time::Instant::now();
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(rejected.load(Ordering::SeqCst), 1);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(pool.delayed_count(), 0);
    assert_eq!(*reasons.lock(), vec!["interrupted while delayed".to_string()]);
    assert!(started.elapsed() < Duration::from_secs(1));

    // The timer never fires the task afterwards
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_graceful_shutdown_drains_queue() {
    let manager = manager();
    let pool = manager.new_single_thread_executor("route1", "Single").unwrap();

    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for i in 0..5 {
        let order = order.clone();
        pool.submit(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            order.lock().push(i);
        })
        .await
        .unwrap();
    }

    assert!(manager.shutdown_graceful(&pool, Duration::from_secs(5)).await);
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    assert!(pool.is_terminated());
    assert!(manager.pools().is_empty());

    // No new work after shutdown
    assert!(matches!(
        pool.submit(async {}).await,
        Err(MediationError::RejectedExecution(_))
    ));
}

#[tokio::test]
async fn test_graceful_shutdown_forces_after_timeout() {
    let manager = manager();
    let pool = manager.new_single_thread_executor("route1", "Stuck").unwrap();

    pool.submit(futures::future::pending::<()>()).await.unwrap();
    let ran = Arc::new(AtomicU32::new(0));
    let rejected = Arc::new(AtomicU32::new(0));
    pool.execute(counting(&ran, &rejected)).await.unwrap();

    let terminated = manager.shutdown_graceful(&pool, Duration::from_millis(100)).await;
    assert!(!terminated);
    assert_eq!(rejected.load(Ordering::SeqCst), 1);
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    assert!(pool.await_termination(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_shutdown_now_rejects_delayed_and_queued() {
    let manager = manager();
    let pool = manager.new_single_thread_executor("route1", "Now").unwrap();
    let gate = CancellationToken::new();
    pool.submit(blocked(&gate)).await.unwrap();

    let ran = Arc::new(AtomicU32::new(0));
    let rejected = Arc::new(AtomicU32::new(0));
    pool.execute(counting(&ran, &rejected)).await.unwrap();
    pool.schedule(Duration::from_secs(60), counting(&ran, &rejected)).unwrap();

    assert_eq!(manager.shutdown_now(&pool), 2);
    assert_eq!(rejected.load(Ordering::SeqCst), 2);
    assert!(pool.is_shutdown());
    assert!(pool.schedule(Duration::from_millis(1), counting(&ran, &rejected)).is_err());
    assert_eq!(rejected.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_shutdown_all() {
    let manager = manager();
    let daemon = manager.new_default_thread_pool("route1", "Daemon").unwrap();
    let non_daemon = manager
        .new_thread_pool_with("route2", "Worker", &ThreadPoolProfile::new("nd").daemon(false))
        .unwrap();
    assert_eq!(manager.pools().len(), 2);

    manager.shutdown_all().await;
    assert!(manager.pools().is_empty());
    assert!(daemon.is_shutdown());
    assert!(non_daemon.is_terminated());
}
