//! Route consumers - the intake side of a route
//!
//! [`InMemoryQueueConsumer`] buffers offered exchanges and feeds them to the
//! route pipeline with a fixed number of workers. Buffered exchanges count as
//! pending during a graceful shutdown when the route completes all tasks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fc_common::Exchange;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pipeline::Pipeline;
use super::ShutdownRunningTask;
use crate::shutdown::ShutdownAware;
use crate::{MediationError, Result};

/// Feeds exchanges into a route
#[async_trait]
pub trait Consumer: ShutdownAware {
    async fn start(&self, pipeline: Arc<Pipeline>) -> Result<()>;

    /// Stop taking new exchanges. Work already admitted may still drain.
    async fn stop(&self) -> Result<()>;

    async fn suspend(&self) -> Result<()> {
        self.stop().await
    }

    async fn resume(&self) -> Result<()> {
        Err(MediationError::Config(format!("consumer {} cannot be resumed", self.name())))
    }

    fn is_suspendable(&self) -> bool {
        false
    }
}

type Reply = oneshot::Sender<Result<Exchange>>;

struct QueuedExchange {
    exchange: Exchange,
    reply: Option<Reply>,
}

struct QueueState {
    items: Mutex<VecDeque<QueuedExchange>>,
    notify: Notify,
    accepting: AtomicBool,
    stopping: AtomicBool,
    suspended: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl QueueState {
    async fn next(&self) -> Option<QueuedExchange> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.suspended.load(Ordering::SeqCst) {
                if let Some(item) = self.items.lock().pop_front() {
                    return Some(item);
                }
            }
            if self.stopping.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Reply to every queued exchange with a not-accepting error
    fn reject_queued(&self, name: &str) -> usize {
        let drained: Vec<QueuedExchange> = self.items.lock().drain(..).collect();
        let count = drained.len();
        for item in drained {
            if let Some(reply) = item.reply {
                let _ = reply.send(Err(MediationError::NotAccepting(name.to_string())));
            }
        }
        count
    }
}

/// In-memory buffering consumer with concurrent workers
pub struct InMemoryQueueConsumer {
    name: String,
    concurrency: usize,
    capacity: Option<usize>,
    defer: bool,
    state: Arc<QueueState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    complete_all: AtomicBool,
}

impl InMemoryQueueConsumer {
    pub fn new(name: &str, concurrency: usize) -> Self {
        Self {
            name: name.to_string(),
            concurrency: concurrency.max(1),
            capacity: None,
            defer: false,
            state: Arc::new(QueueState {
                items: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                accepting: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            workers: Mutex::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
            complete_all: AtomicBool::new(false),
        }
    }

    /// Reject offers once this many exchanges are buffered
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Keep consuming until other routes have shut down
    pub fn with_deferred_shutdown(mut self, defer: bool) -> Self {
        self.defer = defer;
        self
    }

    pub fn is_accepting(&self) -> bool {
        self.state.accepting.load(Ordering::SeqCst)
    }

    /// Buffer an exchange without waiting for the outcome
    pub fn offer(&self, exchange: Exchange) -> Result<()> {
        self.enqueue(exchange, None)
    }

    /// Buffer an exchange and wait until the route finished with it
    pub async fn request(&self, exchange: Exchange) -> Result<Exchange> {
        let exchange_id = exchange.id().to_string();
        let (tx, rx) = oneshot::channel();
        self.enqueue(exchange, Some(tx))?;
        rx.await
            .map_err(|_| MediationError::DeliveryCancelled(exchange_id))?
    }

    fn enqueue(&self, exchange: Exchange, reply: Option<Reply>) -> Result<()> {
        if !self.is_accepting() {
            return Err(MediationError::NotAccepting(self.name.clone()));
        }
        {
            let mut items = self.state.items.lock();
            if self.capacity.map_or(false, |c| items.len() >= c) {
                return Err(MediationError::RejectedExecution(format!(
                    "queue {} is full ({} exchanges)",
                    self.name,
                    items.len()
                )));
            }
            items.push_back(QueuedExchange { exchange, reply });
        }
        self.state.notify.notify_one();
        Ok(())
    }

    pub fn queue_size(&self) -> usize {
        self.state.items.lock().len()
    }

    pub fn processed_count(&self) -> u64 {
        self.state.processed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.state.failed.load(Ordering::Relaxed)
    }
}

async fn worker_loop(state: Arc<QueueState>, pipeline: Arc<Pipeline>, cancel: CancellationToken) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = state.next() => item,
        };
        let Some(item) = item else {
            break;
        };

        let QueuedExchange { exchange, reply } = item;
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Worker cancelled with exchange inflight");
                break;
            }
            result = pipeline.process(exchange) => result,
        };

        match &result {
            Ok(exchange) if !exchange.is_failed() => {
                state.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(exchange) => {
                state.failed.fetch_add(1, Ordering::Relaxed);
                if reply.is_none() {
                    warn!(
                        exchange_id = %exchange.id(),
                        error = ?exchange.exception().map(|e| e.to_string()),
                        "Exchange completed with failure"
                    );
                }
            }
            Err(e) => {
                state.failed.fetch_add(1, Ordering::Relaxed);
                if reply.is_none() {
                    warn!(error = %e, "Exchange was not processed");
                }
            }
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }
}

#[async_trait]
impl Consumer for InMemoryQueueConsumer {
    async fn start(&self, pipeline: Arc<Pipeline>) -> Result<()> {
        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        self.complete_all.store(
            pipeline.shutdown_running_task() == ShutdownRunningTask::CompleteAllTasks,
            Ordering::SeqCst,
        );
        self.state.stopping.store(false, Ordering::SeqCst);
        self.state.suspended.store(false, Ordering::SeqCst);

        {
            let mut workers = self.workers.lock();
            workers.retain(|h| !h.is_finished());
            for _ in 0..self.concurrency {
                workers.push(tokio::spawn(worker_loop(
                    self.state.clone(),
                    pipeline.clone(),
                    cancel.clone(),
                )));
            }
        }
        self.state.accepting.store(true, Ordering::SeqCst);

        info!(consumer = %self.name, route_id = %pipeline.route_id(), workers = self.concurrency, "Consumer started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.accepting.store(false, Ordering::SeqCst);
        self.state.stopping.store(true, Ordering::SeqCst);
        if !self.complete_all.load(Ordering::SeqCst) {
            let rejected = self.state.reject_queued(&self.name);
            if rejected > 0 {
                warn!(consumer = %self.name, rejected, "Discarded queued exchanges on stop");
            }
        }
        self.state.notify.notify_waiters();
        info!(consumer = %self.name, queued = self.queue_size(), "Consumer stopped");
        Ok(())
    }

    async fn suspend(&self) -> Result<()> {
        self.state.accepting.store(false, Ordering::SeqCst);
        self.state.suspended.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
        info!(consumer = %self.name, queued = self.queue_size(), "Consumer suspended");
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.state.suspended.store(false, Ordering::SeqCst);
        self.state.accepting.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
        info!(consumer = %self.name, "Consumer resumed");
        Ok(())
    }

    fn is_suspendable(&self) -> bool {
        true
    }
}

#[async_trait]
impl ShutdownAware for InMemoryQueueConsumer {
    fn name(&self) -> String {
        format!("queue:{}", self.name)
    }

    async fn prepare_shutdown(&self, _suspend_only: bool, forced: bool) {
        self.state.accepting.store(false, Ordering::SeqCst);
        if forced {
            self.state.stopping.store(true, Ordering::SeqCst);
            self.cancel.lock().cancel();
            let rejected = self.state.reject_queued(&self.name);
            warn!(consumer = %self.name, rejected, "Consumer forced to stop");
        }
    }

    async fn pending_exchanges(&self) -> usize {
        if self.state.suspended.load(Ordering::SeqCst) {
            return 0;
        }
        self.queue_size()
    }

    fn defer_shutdown(&self, _task: ShutdownRunningTask) -> bool {
        self.defer
    }
}
