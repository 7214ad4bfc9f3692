//! ThreadPool - worker tasks draining a shared queue
//!
//! Core workers start on demand up to the pool size. When the queue is full,
//! burst workers are added up to the max pool size; idle burst workers exit
//! after the keep-alive. Tasks the pool cannot take are handed to the
//! rejected policy, and every dropped task gets its `reject` callback.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::naming::ThreadNamer;
use super::profile::{PoolSettings, RejectedPolicy};
use crate::engine_metrics;
use crate::{MediationError, Result};

/// Work submitted to a [`ThreadPool`]
pub trait PoolTask: Send + 'static {
    fn run(self: Box<Self>) -> BoxFuture<'static, ()>;

    /// Called instead of `run` when the pool drops the task
    fn reject(self: Box<Self>, reason: &str) {
        let _ = reason;
    }

    /// Resolves when a delayed task should stop waiting. The pool then
    /// rejects it instead of running it.
    fn interruption(&self) -> Option<BoxFuture<'static, ()>> {
        None
    }
}

struct FutureTask<F>(F);

impl<F> PoolTask for FutureTask<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        self.0.boxed()
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub id: String,
    pub name: String,
    pub pool_size: usize,
    pub max_pool_size: usize,
    pub current_workers: usize,
    pub largest_workers: usize,
    pub active: usize,
    pub queued: usize,
    pub delayed: usize,
    pub completed: u64,
    pub rejected: u64,
    pub is_shutdown: bool,
    pub is_terminated: bool,
}

struct WorkerHandle {
    name: String,
    abort: Option<AbortHandle>,
}

struct DelayedEntry {
    task: Box<dyn PoolTask>,
    timer: Option<AbortHandle>,
}

struct PoolInner {
    id: String,
    name: String,
    long_name: String,
    settings: PoolSettings,
    namer: Arc<ThreadNamer>,

    queue: Mutex<VecDeque<Box<dyn PoolTask>>>,
    notify: Notify,
    delayed: Mutex<HashMap<u64, DelayedEntry>>,
    workers: Mutex<HashMap<u64, WorkerHandle>>,

    worker_count: AtomicUsize,
    largest_workers: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
    next_worker_id: AtomicU64,
    next_delayed_id: AtomicU64,
    shutdown: AtomicBool,
}

/// A named pool of tokio worker tasks
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    pub(crate) fn new(
        id: String,
        name: String,
        long_name: String,
        settings: PoolSettings,
        namer: Arc<ThreadNamer>,
    ) -> Self {
        info!(
            pool = %id,
            pool_size = settings.pool_size,
            max_pool_size = settings.max_pool_size,
            max_queue_size = ?settings.max_queue_size,
            rejected_policy = %settings.rejected_policy,
            "Created thread pool"
        );

        Self {
            inner: Arc::new(PoolInner {
                id,
                name,
                long_name,
                settings,
                namer,
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                delayed: Mutex::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                worker_count: AtomicUsize::new(0),
                largest_workers: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                next_worker_id: AtomicU64::new(1),
                next_delayed_id: AtomicU64::new(1),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Submit a future
    pub async fn submit<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.execute(Box::new(FutureTask(fut))).await
    }

    /// Submit a task. With `CallerRuns` a saturated pool runs the task before returning.
    pub async fn execute(&self, task: Box<dyn PoolTask>) -> Result<()> {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::SeqCst) {
            inner.rejected.fetch_add(1, Ordering::Relaxed);
            engine_metrics::record_task_rejected(&inner.id, "shutdown");
            task.reject("thread pool is shut down");
            return Err(MediationError::RejectedExecution(format!(
                "thread pool {} is shut down",
                inner.id
            )));
        }

        // Core worker available: hand the task over directly
        if inner.try_reserve_worker(inner.settings.pool_size) {
            PoolInner::spawn_worker(inner, Some(task));
            return Ok(());
        }

        let overflow = {
            let mut queue = inner.queue.lock();
            let has_room = inner
                .settings
                .max_queue_size
                .map_or(true, |max| queue.len() < max);
            if has_room {
                queue.push_back(task);
                None
            } else {
                Some(task)
            }
        };

        let Some(task) = overflow else {
            inner.notify.notify_one();
            if inner.worker_count.load(Ordering::SeqCst) == 0 && inner.try_reserve_worker(1) {
                PoolInner::spawn_worker(inner, None);
            }
            engine_metrics::set_pool_queue_size(&inner.id, inner.queue.lock().len());
            return Ok(());
        };

        // Queue full: try a burst worker
        if inner.try_reserve_worker(inner.settings.max_pool_size) {
            PoolInner::spawn_worker(inner, Some(task));
            return Ok(());
        }

        inner.rejected.fetch_add(1, Ordering::Relaxed);
        engine_metrics::record_task_rejected(&inner.id, inner.settings.rejected_policy.as_str());
        debug!(
            pool = %inner.id,
            policy = %inner.settings.rejected_policy,
            "Pool saturated, applying rejected policy"
        );

        match inner.settings.rejected_policy {
            RejectedPolicy::Abort => {
                task.reject("thread pool is saturated");
                Err(MediationError::RejectedExecution(format!(
                    "thread pool {} is saturated",
                    inner.id
                )))
            }
            RejectedPolicy::CallerRuns => {
                task.run().await;
                Ok(())
            }
            RejectedPolicy::Discard => {
                task.reject("discarded by saturated thread pool");
                Ok(())
            }
            RejectedPolicy::DiscardOldest => {
                let oldest = {
                    let mut queue = inner.queue.lock();
                    let oldest = queue.pop_front();
                    if oldest.is_some() {
                        queue.push_back(task);
                        Ok(oldest)
                    } else {
                        Err(task)
                    }
                };
                match oldest {
                    Ok(Some(oldest)) => {
                        inner.notify.notify_one();
                        oldest.reject("discarded as oldest by saturated thread pool");
                    }
                    Ok(None) => {}
                    Err(task) => task.reject("discarded by saturated thread pool"),
                }
                Ok(())
            }
        }
    }

    /// Run `task` after `delay`. Delayed tasks survive an orderly shutdown.
    pub fn schedule(&self, delay: Duration, task: Box<dyn PoolTask>) -> Result<()> {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::SeqCst) {
            inner.rejected.fetch_add(1, Ordering::Relaxed);
            task.reject("thread pool is shut down");
            return Err(MediationError::RejectedExecution(format!(
                "thread pool {} is shut down",
                inner.id
            )));
        }

        let id = inner.next_delayed_id.fetch_add(1, Ordering::SeqCst);
        let interruption = task.interruption();
        inner.delayed.lock().insert(id, DelayedEntry { task, timer: None });

        let timer_inner = inner.clone();
        let handle = tokio::spawn(async move {
            let interrupted = match interruption {
                Some(interruption) => tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = interruption => true,
                },
                None => {
                    tokio::time::sleep(delay).await;
                    false
                }
            };
            let entry = timer_inner.delayed.lock().remove(&id);
            let Some(entry) = entry else { return };
            if interrupted {
                debug!(pool = %timer_inner.id, "Delayed task interrupted before it was due");
                entry.task.reject("interrupted while delayed");
            } else {
                PoolInner::enqueue_delayed(&timer_inner, entry.task);
            }
        });

        if let Some(entry) = inner.delayed.lock().get_mut(&id) {
            entry.timer = Some(handle.abort_handle());
        }
        Ok(())
    }

    /// Orderly shutdown: no new submissions, queued and delayed tasks still run
    pub fn shutdown(&self) {
        if !self.inner.shutdown.swap(true, Ordering::SeqCst) {
            info!(pool = %self.inner.id, "Shutting down thread pool");
        }
        self.inner.notify.notify_waiters();
    }

    /// Abort workers and reject every queued or delayed task. Returns the number rejected.
    pub fn shutdown_now(&self) -> usize {
        let inner = &self.inner;
        inner.shutdown.store(true, Ordering::SeqCst);

        let delayed: Vec<DelayedEntry> = inner.delayed.lock().drain().map(|(_, e)| e).collect();
        let queued: Vec<Box<dyn PoolTask>> = inner.queue.lock().drain(..).collect();
        let workers: Vec<WorkerHandle> = inner.workers.lock().drain().map(|(_, w)| w).collect();

        for worker in &workers {
            if let Some(abort) = &worker.abort {
                abort.abort();
            }
        }

        let count = delayed.len() + queued.len();
        for entry in delayed {
            if let Some(timer) = &entry.timer {
                timer.abort();
            }
            entry.task.reject("thread pool was shut down now");
        }
        for task in queued {
            task.reject("thread pool was shut down now");
        }
        inner.notify.notify_waiters();

        warn!(
            pool = %inner.id,
            rejected_tasks = count,
            aborted_workers = workers.len(),
            "Thread pool shut down now"
        );
        count
    }

    /// Wait until the pool terminates. Returns false if `timeout` elapsed first.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while !self.is_terminated() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        let inner = &self.inner;
        inner.shutdown.load(Ordering::SeqCst)
            && inner.worker_count.load(Ordering::SeqCst) == 0
            && inner.queue.lock().is_empty()
            && inner.delayed.lock().is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn queue_size(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn delayed_count(&self) -> usize {
        self.inner.delayed.lock().len()
    }

    /// Names of the live workers
    pub fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.workers.lock().values().map(|w| w.name.clone()).collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            id: inner.id.clone(),
            name: inner.name.clone(),
            pool_size: inner.settings.pool_size,
            max_pool_size: inner.settings.max_pool_size,
            current_workers: inner.worker_count.load(Ordering::SeqCst),
            largest_workers: inner.largest_workers.load(Ordering::SeqCst),
            active: inner.active.load(Ordering::SeqCst),
            queued: self.queue_size(),
            delayed: self.delayed_count(),
            completed: inner.completed.load(Ordering::SeqCst),
            rejected: inner.rejected.load(Ordering::SeqCst),
            is_shutdown: self.is_shutdown(),
            is_terminated: self.is_terminated(),
        }
    }
}

impl PoolInner {
    fn try_reserve_worker(&self, limit: usize) -> bool {
        self.worker_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .is_ok()
    }

    /// Spawn a worker for a slot already reserved in `worker_count`
    fn spawn_worker(inner: &Arc<PoolInner>, first: Option<Box<dyn PoolTask>>) {
        let worker_id = inner.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let thread_name = inner.namer.next_name(&inner.name, &inner.long_name);
        inner
            .largest_workers
            .fetch_max(inner.worker_count.load(Ordering::SeqCst), Ordering::SeqCst);
        inner.workers.lock().insert(
            worker_id,
            WorkerHandle {
                name: thread_name.clone(),
                abort: None,
            },
        );

        let span = tracing::debug_span!("worker", thread = %thread_name);
        // Created outside the future so an abort before the first poll still releases the slot
        let guard = WorkerGuard {
            inner: inner.clone(),
            worker_id,
        };
        let worker_inner = inner.clone();
        let handle = tokio::spawn(
            async move {
                let _guard = guard;
                run_worker(worker_inner, first).await;
            }
            .instrument(span),
        );

        if let Some(worker) = inner.workers.lock().get_mut(&worker_id) {
            worker.abort = Some(handle.abort_handle());
        }
        engine_metrics::set_pool_active_workers(&inner.id, inner.active.load(Ordering::SeqCst));
    }

    /// Delayed tasks bypass the shutdown check and the queue bound
    fn enqueue_delayed(inner: &Arc<PoolInner>, task: Box<dyn PoolTask>) {
        if inner.try_reserve_worker(inner.settings.pool_size.max(1)) {
            PoolInner::spawn_worker(inner, Some(task));
            return;
        }
        inner.queue.lock().push_back(task);
        inner.notify.notify_one();
    }

    async fn next_task(&self) -> Option<Box<dyn PoolTask>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.queue.lock().pop_front() {
                return Some(task);
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }

            let may_time_out = self.settings.allow_core_thread_timeout
                || self.worker_count.load(Ordering::SeqCst) > self.settings.pool_size;
            if may_time_out {
                if tokio::time::timeout(self.settings.keep_alive, notified).await.is_err()
                    && self.queue.lock().is_empty()
                {
                    debug!(pool = %self.id, "Idle worker exiting after keep-alive");
                    return None;
                }
            } else {
                notified.await;
            }
        }
    }
}

async fn run_worker(inner: Arc<PoolInner>, first: Option<Box<dyn PoolTask>>) {
    let mut next = first;
    loop {
        let task = match next.take() {
            Some(task) => task,
            None => match inner.next_task().await {
                Some(task) => task,
                None => break,
            },
        };

        let _active = ActiveGuard::new(&inner.active);
        if AssertUnwindSafe(task.run()).catch_unwind().await.is_err() {
            error!(pool = %inner.id, "Pool task panicked");
        }
        inner.completed.fetch_add(1, Ordering::Relaxed);
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn new(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Releases the worker slot however the worker ends, including abort
struct WorkerGuard {
    inner: Arc<PoolInner>,
    worker_id: u64,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.inner.workers.lock().remove(&self.worker_id);
        self.inner.worker_count.fetch_sub(1, Ordering::SeqCst);
    }
}
