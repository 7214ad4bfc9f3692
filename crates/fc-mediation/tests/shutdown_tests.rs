//! ShutdownStrategy Tests
//!
//! Tests for:
//! - Waiting for inflight exchanges before stopping a route
//! - Timeout handling, forced shutdown and aborted exchange reporting
//! - Route ordering, deferred routes and buffered work
//! - Suspend and resume

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fc_common::Exchange;
use fc_mediation::{
    ErrorHandlerBuilder, FnProcessor, InMemoryQueueConsumer, MediationContext, MediationError, Processor,
    RouteBuilder, RouteService, RouteStatus, ShutdownAware, ShutdownRoute, ShutdownRunningTask,
};
use serde_json::json;

/// Sleeps, then optionally fails
struct SlowProcessor {
    delay: Duration,
    fail: bool,
    started: AtomicU32,
    finished: AtomicU32,
}

impl SlowProcessor {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail: false,
            started: AtomicU32::new(0),
            finished: AtomicU32::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Duration::ZERO)
        }
    }
}

#[async_trait]
impl Processor for SlowProcessor {
    async fn process(&self, _exchange: &mut Exchange) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("downstream unavailable");
        }
        Ok(())
    }
}

/// Route service recording the order routes are asked to prepare for shutdown
struct Recorder {
    name: &'static str,
    log: Arc<parking_lot::Mutex<Vec<String>>>,
}

#[async_trait]
impl ShutdownAware for Recorder {
    fn name(&self) -> String {
        self.name.to_string()
    }

    async fn prepare_shutdown(&self, _suspend_only: bool, _forced: bool) {
        self.log.lock().push(self.name.to_string());
    }
}

#[async_trait]
impl RouteService for Recorder {}

fn noop() -> Arc<dyn Processor> {
    Arc::new(FnProcessor::new(|_: &mut Exchange| Ok(())))
}

async fn wait_for_inflight(context: &MediationContext, count: usize) {
    while context.inflight_repository().size() < count {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_inflight_exchange() {
    let context = MediationContext::new("test").unwrap();
    let consumer = Arc::new(InMemoryQueueConsumer::new("orders", 1));
    let processor = Arc::new(SlowProcessor::new(Duration::from_secs(3)));
    context
        .add_route(RouteBuilder::new("orders").from(consumer.clone()).process(processor.clone()))
        .await
        .unwrap();
    context.start().await.unwrap();

    consumer.offer(Exchange::new(json!(1))).unwrap();
    wait_for_inflight(&context, 1).await;

    let started = tokio::time::Instant::now();
    let outcome = context.stop_route("orders").await.unwrap();

    assert!(outcome.completed);
    assert!(!outcome.timed_out);
    assert!(outcome.aborted_exchange_ids.is_empty());
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(processor.finished.load(Ordering::SeqCst), 1);
    assert_eq!(context.route("orders").unwrap().status(), RouteStatus::Stopped);
    assert!(!context.route("orders").unwrap().pipeline().is_accepting());
    assert!(matches!(
        consumer.offer(Exchange::new(json!(2))),
        Err(MediationError::NotAccepting(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_forces_shutdown_and_reports_aborted() {
    let context = MediationContext::new("test").unwrap();
    context.shutdown_strategy().set_timeout(Duration::from_secs(2)).unwrap();
    let consumer = Arc::new(InMemoryQueueConsumer::new("orders", 1));
    let processor = Arc::new(SlowProcessor::new(Duration::from_secs(600)));
    context
        .add_route(RouteBuilder::new("orders").from(consumer.clone()).process(processor.clone()))
        .await
        .unwrap();
    context.start().await.unwrap();

    let exchange = Exchange::new(json!(1));
    let exchange_id = exchange.id().to_string();
    consumer.offer(exchange).unwrap();
    wait_for_inflight(&context, 1).await;

    let started = tokio::time::Instant::now();
    let outcome = context.stop_route("orders").await.unwrap();

    assert!(!outcome.completed);
    assert!(outcome.timed_out);
    assert_eq!(outcome.aborted_exchange_ids, vec![exchange_id]);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(context.shutdown_strategy().timeout_occurred());
    assert!(context.shutdown_strategy().is_forced());
    assert_eq!(context.route("orders").unwrap().status(), RouteStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_forced_shutdown_interrupts_pending_redelivery() {
    let context = MediationContext::new("test").unwrap();
    context.shutdown_strategy().set_timeout(Duration::from_secs(1)).unwrap();
    let consumer = Arc::new(InMemoryQueueConsumer::new("orders", 1));
    let processor = Arc::new(SlowProcessor::failing());
    let route = RouteBuilder::new("orders")
        .from(consumer.clone())
        .error_handler(
            ErrorHandlerBuilder::default_error_handler()
                .maximum_redeliveries(5)
                .redelivery_delay(Duration::from_secs(60)),
        )
        .process(processor.clone());
    context.add_route(route).await.unwrap();
    context.start().await.unwrap();

    let requester = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.request(Exchange::new(json!(1))).await })
    };
    wait_for_inflight(&context, 1).await;

    let outcome = context.stop_route("orders").await.unwrap();
    assert!(outcome.timed_out);
    assert_eq!(outcome.aborted_exchange_ids.len(), 1);

    // The exchange never completed normally
    let result = requester.await.unwrap();
    assert!(result.map_or(true, |exchange| exchange.is_failed()));
    assert_eq!(processor.started.load(Ordering::SeqCst), 1);
    assert_eq!(context.inflight_repository().size(), 0);
}

#[tokio::test]
async fn test_zero_timeout_rejected() {
    let context = MediationContext::new("test").unwrap();
    context
        .add_route(
            RouteBuilder::new("orders")
                .from(Arc::new(InMemoryQueueConsumer::new("orders", 1)))
                .process(noop()),
        )
        .await
        .unwrap();
    let result = context.stop_route_with_timeout("orders", Duration::ZERO).await;
    assert!(matches!(result, Err(MediationError::Config(_))));
}

#[tokio::test]
async fn test_routes_stop_in_reverse_startup_order() {
    let context = MediationContext::new("test").unwrap();
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for (id, order) in [("first", 1), ("second", 2), ("third", 3)] {
        let route = RouteBuilder::new(id)
            .from(Arc::new(InMemoryQueueConsumer::new(id, 1)))
            .process(noop())
            .service(Arc::new(Recorder { name: id, log: log.clone() }))
            .startup_order(order);
        context.add_route(route).await.unwrap();
    }
    context.start().await.unwrap();
    context.stop().await.unwrap();

    assert_eq!(*log.lock(), vec!["third", "second", "first"]);
}

#[tokio::test]
async fn test_deferred_route_stops_last() {
    let context = MediationContext::new("test").unwrap();
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let deferred = RouteBuilder::new("deferred")
        .from(Arc::new(InMemoryQueueConsumer::new("deferred", 1)))
        .process(noop())
        .service(Arc::new(Recorder {
            name: "deferred",
            log: log.clone(),
        }))
        .startup_order(2)
        .shutdown_route(ShutdownRoute::Defer);
    let by_consumer = RouteBuilder::new("by-consumer")
        .from(Arc::new(InMemoryQueueConsumer::new("by-consumer", 1).with_deferred_shutdown(true)))
        .process(noop())
        .service(Arc::new(Recorder {
            name: "by-consumer",
            log: log.clone(),
        }))
        .startup_order(3);
    let normal = RouteBuilder::new("normal")
        .from(Arc::new(InMemoryQueueConsumer::new("normal", 1)))
        .process(noop())
        .service(Arc::new(Recorder {
            name: "normal",
            log: log.clone(),
        }))
        .startup_order(1);

    for route in [deferred, by_consumer, normal] {
        context.add_route(route).await.unwrap();
    }
    context.start().await.unwrap();
    let outcome = context.stop().await.unwrap();

    assert!(outcome.completed);
    assert_eq!(*log.lock(), vec!["normal", "by-consumer", "deferred"]);
}

#[tokio::test(start_paused = true)]
async fn test_complete_all_tasks_drains_buffer() {
    let context = MediationContext::new("test").unwrap();
    let consumer = Arc::new(InMemoryQueueConsumer::new("orders", 1));
    let processor = Arc::new(SlowProcessor::new(Duration::from_millis(100)));
    context
        .add_route(
            RouteBuilder::new("orders")
                .from(consumer.clone())
                .process(processor.clone())
                .shutdown_running_task(ShutdownRunningTask::CompleteAllTasks),
        )
        .await
        .unwrap();
    context.start().await.unwrap();

    for n in 0..5 {
        consumer.offer(Exchange::new(json!(n))).unwrap();
    }
    wait_for_inflight(&context, 1).await;

    let outcome = context.stop_route("orders").await.unwrap();
    assert!(outcome.completed);
    assert_eq!(consumer.processed_count(), 5);
    assert_eq!(consumer.queue_size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_complete_current_task_only_discards_buffer() {
    let context = MediationContext::new("test").unwrap();
    let consumer = Arc::new(InMemoryQueueConsumer::new("orders", 1));
    let processor = Arc::new(SlowProcessor::new(Duration::from_millis(100)));
    context
        .add_route(RouteBuilder::new("orders").from(consumer.clone()).process(processor.clone()))
        .await
        .unwrap();
    context.start().await.unwrap();

    let waiting = {
        let consumer = consumer.clone();
        let first = Exchange::new(json!(0));
        consumer.offer(first).unwrap();
        tokio::spawn(async move { consumer.request(Exchange::new(json!(1))).await })
    };
    wait_for_inflight(&context, 1).await;

    let outcome = context.stop_route("orders").await.unwrap();
    assert!(outcome.completed);
    assert_eq!(consumer.processed_count(), 1);
    assert!(matches!(waiting.await.unwrap(), Err(MediationError::NotAccepting(_))));
}

#[tokio::test(start_paused = true)]
async fn test_suspend_and_resume() {
    let context = MediationContext::new("test").unwrap();
    let consumer = Arc::new(InMemoryQueueConsumer::new("orders", 1));
    context
        .add_route(RouteBuilder::new("orders").from(consumer.clone()).process(noop()))
        .await
        .unwrap();
    context.start().await.unwrap();

    let outcome = context.suspend_route("orders").await.unwrap();
    assert!(outcome.completed);
    let route = context.route("orders").unwrap();
    assert_eq!(route.status(), RouteStatus::Suspended);
    assert!(consumer.offer(Exchange::new(json!(1))).is_err());

    context.resume_route("orders").await.unwrap();
    assert_eq!(route.status(), RouteStatus::Started);
    let exchange = consumer.request(Exchange::new(json!(2))).await.unwrap();
    assert!(!exchange.is_failed());

    // Only suspended routes can be resumed
    assert!(context.resume_route("orders").await.is_err());
}
