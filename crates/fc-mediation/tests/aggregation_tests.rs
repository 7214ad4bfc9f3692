//! Aggregation Tests
//!
//! Tests for:
//! - Completion by size, predicate, timeout and interval
//! - Concurrent merges under optimistic locking and serial repositories
//! - Forced completion when the route stops
//! - Recovery of unconfirmed groups, including after a restart on a file store
//! - Recovery attempt limits and the recovery dead letter channel

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fc_common::{headers, properties, Exchange, ExchangePattern};
use fc_mediation::aggregation::correlate_by_header;
use fc_mediation::{
    AggregationRepository, AggregationStrategy, Aggregator, FileDurableStore, InMemoryDurableStore,
    InMemoryQueueConsumer, MediationContext, MediationError, MemoryAggregationRepository,
    OptimisticLockRetryPolicy, Predicate, Processor, Producer, RecoverableAggregationRepository, RouteBuilder,
};
use serde_json::{json, Value};

/// Collects bodies into a JSON array on the first exchange of the group
fn collect_bodies() -> Arc<dyn AggregationStrategy> {
    Arc::new(|old: Option<Exchange>, new: Exchange| match old {
        None => {
            let mut first = new.clone();
            first.in_message_mut().body = json!([new.in_message().body.clone()]);
            first
        }
        Some(mut group) => {
            if let Some(items) = group.in_message_mut().body.as_array_mut() {
                items.push(new.in_message().body.clone());
            }
            group
        }
    })
}

/// Output that records completed groups, optionally failing the first calls
struct CaptureOutput {
    failures: u32,
    calls: AtomicU32,
    groups: parking_lot::Mutex<Vec<Exchange>>,
}

impl CaptureOutput {
    fn new() -> Self {
        Self::failing(0)
    }

    fn failing(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            groups: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn groups(&self) -> Vec<Exchange> {
        self.groups.lock().clone()
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for CaptureOutput {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            anyhow::bail!("output unavailable");
        }
        self.groups.lock().push(exchange.clone());
        Ok(())
    }
}

/// Endpoint that records what it receives
struct ParkingEndpoint {
    uri: String,
    received: parking_lot::Mutex<Vec<Exchange>>,
}

#[async_trait]
impl Producer for ParkingEndpoint {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, exchange: &mut Exchange, _pattern: ExchangePattern) -> anyhow::Result<()> {
        self.received.lock().push(exchange.clone());
        Ok(())
    }
}

/// Keeps only the newest exchange, so every merge yields a new exchange id
fn latest_wins() -> Arc<dyn AggregationStrategy> {
    Arc::new(|_old: Option<Exchange>, new: Exchange| new)
}

fn order(customer: &str, body: Value) -> Exchange {
    let mut exchange = Exchange::new(body);
    exchange.in_message_mut().set_header("customer", customer);
    exchange
}

fn fast_retry() -> OptimisticLockRetryPolicy {
    OptimisticLockRetryPolicy {
        retry_delay: Duration::from_millis(1),
        maximum_retry_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

fn sorted_numbers(group: &Exchange) -> Vec<u64> {
    let mut numbers: Vec<u64> = group
        .in_message()
        .body
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    numbers.sort();
    numbers
}

#[tokio::test]
async fn test_completion_by_size() {
    let output = Arc::new(CaptureOutput::new());
    let aggregator = Aggregator::builder("orders", correlate_by_header("customer"), collect_bodies(), output.clone())
        .completion_size(3)
        .build()
        .unwrap();

    for (customer, n) in [("a", 1), ("b", 10), ("a", 2), ("a", 3)] {
        let mut exchange = order(customer, json!(n));
        aggregator.process(&mut exchange).await.unwrap();
        assert!(exchange.is_route_stop());
        assert_eq!(exchange.property(properties::AGGREGATED_CORRELATION_KEY), Some(&json!(customer)));
    }

    let groups = output.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].in_message().body, json!([1, 2, 3]));
    assert_eq!(groups[0].property(properties::AGGREGATED_SIZE), Some(&json!(3)));
    assert_eq!(aggregator.completed_count(), 1);
    // "b" is still open
    assert_eq!(aggregator.open_groups(), 1);
}

#[tokio::test]
async fn test_completion_by_predicate() {
    let output = Arc::new(CaptureOutput::new());
    let last: Arc<dyn Predicate> = Arc::new(|group: &Exchange| {
        group
            .in_message()
            .body
            .as_array()
            .map_or(false, |items| items.contains(&json!("end")))
    });
    let aggregator = Aggregator::builder("orders", correlate_by_header("customer"), collect_bodies(), output.clone())
        .completion_predicate(last)
        .build()
        .unwrap();

    for body in ["x", "y", "end"] {
        aggregator.process(&mut order("a", json!(body))).await.unwrap();
    }
    assert_eq!(output.groups()[0].in_message().body, json!(["x", "y", "end"]));
    assert_eq!(aggregator.open_groups(), 0);
}

#[tokio::test]
async fn test_builder_requires_completion_condition() {
    let result = Aggregator::builder(
        "orders",
        correlate_by_header("customer"),
        collect_bodies(),
        Arc::new(CaptureOutput::new()),
    )
    .build();
    assert!(matches!(result, Err(MediationError::Config(_))));
}

#[tokio::test]
async fn test_missing_correlation_key() {
    let aggregator = Aggregator::builder(
        "orders",
        correlate_by_header("customer"),
        collect_bodies(),
        Arc::new(CaptureOutput::new()),
    )
    .completion_size(2)
    .build()
    .unwrap();

    let err = aggregator.process(&mut Exchange::new(json!(1))).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MediationError>(),
        Some(MediationError::MissingCorrelationKey(_))
    ));
}

async fn aggregate_concurrently(aggregator: Arc<Aggregator>, count: u64) {
    let mut handles = Vec::new();
    for n in 0..count {
        let aggregator = aggregator.clone();
        handles.push(tokio::spawn(async move {
            let mut exchange = order("shared", json!(n));
            aggregator.process(&mut exchange).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_merges_with_optimistic_locking() {
    let output = Arc::new(CaptureOutput::new());
    let conflicts = Arc::new(AtomicU32::new(0));

    /// Strategy wrapper that counts lost compare-and-swap races
    struct Counting {
        inner: Arc<dyn AggregationStrategy>,
        conflicts: Arc<AtomicU32>,
    }

    impl AggregationStrategy for Counting {
        fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Exchange {
            self.inner.aggregate(old, new)
        }

        fn on_optimistic_lock_failure(&self, _key: &str, _attempt: u32) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }
    }

    let strategy = Arc::new(Counting {
        inner: collect_bodies(),
        conflicts: conflicts.clone(),
    });
    let aggregator = Aggregator::builder("orders", correlate_by_header("customer"), strategy, output.clone())
        .repository(Arc::new(MemoryAggregationRepository::with_optimistic_locking()))
        .completion_size(40)
        .lock_retry(fast_retry())
        .build()
        .unwrap();

    aggregate_concurrently(aggregator.clone(), 40).await;

    // Every exchange lands in exactly one completed group, none lost or duplicated
    let groups = output.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(sorted_numbers(&groups[0]), (0..40).collect::<Vec<u64>>());
    assert_eq!(aggregator.open_groups(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_merges_with_serial_repository() {
    let output = Arc::new(CaptureOutput::new());
    let aggregator = Aggregator::builder("orders", correlate_by_header("customer"), collect_bodies(), output.clone())
        .repository(Arc::new(MemoryAggregationRepository::new()))
        .completion_size(10)
        .build()
        .unwrap();

    aggregate_concurrently(aggregator.clone(), 30).await;

    let groups = output.groups();
    assert_eq!(groups.len(), 3);
    let mut all: Vec<u64> = groups.iter().flat_map(sorted_numbers).collect();
    all.sort();
    assert_eq!(all, (0..30).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_stale_compare_and_swap_is_rejected() {
    let repo = MemoryAggregationRepository::with_optimistic_locking();
    let cas = repo.optimistic_locking().unwrap();

    cas.add_expected("k", None, Exchange::new(json!(1))).await.unwrap();
    let stale = repo.get("k").await.unwrap().unwrap();
    cas.add_expected("k", Some(&stale), Exchange::new(json!(2))).await.unwrap();

    let err = cas
        .add_expected("k", Some(&stale), Exchange::new(json!(3)))
        .await
        .unwrap_err();
    assert!(matches!(err, MediationError::OptimisticLocking { .. }));
    assert!(cas.remove_expected("k", &stale).await.is_err());
    assert_eq!(repo.get("k").await.unwrap().unwrap().in_message().body, json!(2));
}

#[tokio::test]
async fn test_lock_retries_exhausted() {
    /// Repository whose compare-and-swap always conflicts
    struct AlwaysConflicts(MemoryAggregationRepository);

    #[async_trait]
    impl AggregationRepository for AlwaysConflicts {
        async fn add(&self, key: &str, exchange: Exchange) -> fc_mediation::Result<Option<Exchange>> {
            self.0.add(key, exchange).await
        }
        async fn get(&self, key: &str) -> fc_mediation::Result<Option<Exchange>> {
            self.0.get(key).await
        }
        async fn remove(&self, key: &str) -> fc_mediation::Result<Option<Exchange>> {
            self.0.remove(key).await
        }
        fn keys(&self) -> Vec<String> {
            self.0.keys()
        }
        fn optimistic_locking(&self) -> Option<&dyn fc_mediation::OptimisticLocking> {
            Some(self)
        }
    }

    #[async_trait]
    impl fc_mediation::OptimisticLocking for AlwaysConflicts {
        async fn add_expected(
            &self,
            key: &str,
            _expected: Option<&Exchange>,
            _exchange: Exchange,
        ) -> fc_mediation::Result<Option<Exchange>> {
            Err(MediationError::OptimisticLocking { key: key.to_string() })
        }
        async fn remove_expected(&self, key: &str, _expected: &Exchange) -> fc_mediation::Result<()> {
            Err(MediationError::OptimisticLocking { key: key.to_string() })
        }
    }

    let aggregator = Aggregator::builder(
        "orders",
        correlate_by_header("customer"),
        collect_bodies(),
        Arc::new(CaptureOutput::new()),
    )
    .repository(Arc::new(AlwaysConflicts(MemoryAggregationRepository::new())))
    .completion_size(5)
    .lock_retry(OptimisticLockRetryPolicy {
        maximum_retries: 3,
        ..fast_retry()
    })
    .build()
    .unwrap();

    let err = aggregator.process(&mut order("a", json!(1))).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MediationError>(),
        Some(MediationError::OptimisticLockingExhausted { attempts: 4, .. })
    ));
}

#[tokio::test]
async fn test_force_completion_when_route_stops() {
    let context = MediationContext::new("test").unwrap();
    let output = Arc::new(CaptureOutput::new());
    let aggregator = Aggregator::builder("orders", correlate_by_header("customer"), collect_bodies(), output.clone())
        .completion_size(10)
        .force_completion_on_stop(true)
        .build()
        .unwrap();

    let route = RouteBuilder::new("orders")
        .from(Arc::new(InMemoryQueueConsumer::new("orders", 1)))
        .aggregate(aggregator.clone());
    context.add_route(route).await.unwrap();
    context.start().await.unwrap();

    context.request("orders", order("a", json!(1))).await.unwrap();
    context.request("orders", order("a", json!(2))).await.unwrap();
    assert!(output.groups().is_empty());

    let outcome = context.stop().await.unwrap();
    assert!(outcome.completed);
    let groups = output.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].in_message().body, json!([1, 2]));
    assert_eq!(aggregator.open_groups(), 0);
}

#[tokio::test]
async fn test_failed_output_is_recovered() {
    let store = Arc::new(InMemoryDurableStore::new());
    let repository = Arc::new(
        RecoverableAggregationRepository::new(Arc::new(MemoryAggregationRepository::with_optimistic_locking()), store.clone())
            .with_recovery_interval(Duration::ZERO),
    );
    let output = Arc::new(CaptureOutput::failing(1));
    let aggregator = Aggregator::builder("orders", correlate_by_header("customer"), collect_bodies(), output.clone())
        .repository(repository.clone())
        .completion_size(2)
        .build()
        .unwrap();

    aggregator.process(&mut order("a", json!(1))).await.unwrap();
    aggregator.process(&mut order("a", json!(2))).await.unwrap();
    assert_eq!(output.calls(), 1);
    assert!(output.groups().is_empty());
    assert_eq!(store.len(), 1);

    assert_eq!(aggregator.recover().await.unwrap(), 1);
    let groups = output.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].in_message().body, json!([1, 2]));
    assert_eq!(groups[0].in_message().header(headers::REDELIVERED), Some(&json!(true)));
    assert!(store.is_empty());

    // Nothing left to recover
    assert_eq!(aggregator.recover().await.unwrap(), 0);
}

#[tokio::test]
async fn test_confirmed_group_is_not_recovered() {
    let store = Arc::new(InMemoryDurableStore::new());
    let repository = Arc::new(
        RecoverableAggregationRepository::new(Arc::new(MemoryAggregationRepository::with_optimistic_locking()), store.clone())
            .with_recovery_interval(Duration::ZERO),
    );
    let output = Arc::new(CaptureOutput::new());
    let aggregator = Aggregator::builder("orders", correlate_by_header("customer"), latest_wins(), output.clone())
        .repository(repository)
        .completion_size(2)
        .build()
        .unwrap();

    let first = order("a", json!(1));
    let second = order("a", json!(2));
    let second_id = second.id().to_string();
    aggregator.process(&mut first.clone()).await.unwrap();
    aggregator.process(&mut second.clone()).await.unwrap();

    let groups = output.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].id(), second_id);
    assert!(store.is_empty());
    assert_eq!(aggregator.recover().await.unwrap(), 0);
    assert_eq!(output.calls(), 1);
}

#[tokio::test]
async fn test_exhausted_recovery_goes_to_dead_letter() {
    let context = MediationContext::new("test").unwrap();
    let parked = Arc::new(ParkingEndpoint {
        uri: "mock:parked".to_string(),
        received: parking_lot::Mutex::new(Vec::new()),
    });
    context.registry().bind_endpoint(parked.clone());

    let store = Arc::new(InMemoryDurableStore::new());
    let repository = Arc::new(
        RecoverableAggregationRepository::new(Arc::new(MemoryAggregationRepository::with_optimistic_locking()), store.clone())
            .with_recovery_interval(Duration::ZERO)
            .with_maximum_redeliveries(2)
            .with_dead_letter_uri("mock:parked"),
    );
    let output = Arc::new(CaptureOutput::failing(u32::MAX));
    let aggregator = Aggregator::builder("orders", correlate_by_header("customer"), collect_bodies(), output.clone())
        .repository(repository)
        .completion_size(2)
        .build()
        .unwrap();
    let route = RouteBuilder::new("orders")
        .from(Arc::new(InMemoryQueueConsumer::new("orders", 1)))
        .aggregate(aggregator.clone());
    context.add_route(route).await.unwrap();
    context.start().await.unwrap();

    context.request("orders", order("a", json!(1))).await.unwrap();
    context.request("orders", order("a", json!(2))).await.unwrap();
    assert_eq!(output.calls(), 1);
    assert_eq!(store.len(), 1);

    // Two recovery attempts, both failing
    assert_eq!(aggregator.recover().await.unwrap(), 1);
    assert_eq!(aggregator.recover().await.unwrap(), 1);
    assert_eq!(output.calls(), 3);
    assert!(parked.received.lock().is_empty());
    assert_eq!(store.len(), 1);

    // Out of attempts: parked instead of re-emitted
    assert_eq!(aggregator.recover().await.unwrap(), 0);
    assert_eq!(output.calls(), 3);
    let received = parked.received.lock().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].in_message().body, json!([1, 2]));
    assert_eq!(received[0].in_message().header(headers::REDELIVERY_COUNTER), Some(&json!(2)));
    assert!(received[0].is_redelivery_exhausted());
    assert!(store.is_empty());
    context.stop().await.unwrap();
}

#[tokio::test]
async fn test_recovery_limit_requires_dead_letter() {
    let repository = Arc::new(
        RecoverableAggregationRepository::new(
            Arc::new(MemoryAggregationRepository::with_optimistic_locking()),
            Arc::new(InMemoryDurableStore::new()),
        )
        .with_maximum_redeliveries(3),
    );
    let result = Aggregator::builder(
        "orders",
        correlate_by_header("customer"),
        collect_bodies(),
        Arc::new(CaptureOutput::new()),
    )
    .repository(repository)
    .completion_size(2)
    .build();
    assert!(matches!(result, Err(MediationError::Config(_))));
}

#[tokio::test]
async fn test_completion_timeout_and_interval_are_exclusive() {
    let result = Aggregator::builder(
        "orders",
        correlate_by_header("customer"),
        collect_bodies(),
        Arc::new(CaptureOutput::new()),
    )
    .completion_timeout(Duration::from_secs(1))
    .completion_interval(Duration::from_secs(1))
    .build();
    assert!(matches!(result, Err(MediationError::Config(_))));
}

async fn start_route(aggregator: &Arc<Aggregator>) -> MediationContext {
    let context = MediationContext::new("test").unwrap();
    let route = RouteBuilder::new("orders")
        .from(Arc::new(InMemoryQueueConsumer::new("orders", 1)))
        .aggregate(aggregator.clone());
    context.add_route(route).await.unwrap();
    context.start().await.unwrap();
    context
}

#[tokio::test(start_paused = true)]
async fn test_completion_timeout_closes_idle_group() {
    let output = Arc::new(CaptureOutput::new());
    let aggregator = Aggregator::builder("orders", correlate_by_header("customer"), collect_bodies(), output.clone())
        .completion_size(10)
        .completion_timeout(Duration::from_secs(2))
        .timeout_checker_interval(Duration::from_millis(500))
        .build()
        .unwrap();
    let context = start_route(&aggregator).await;

    context.request("orders", order("a", json!(1))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    context.request("orders", order("a", json!(2))).await.unwrap();

    // Each exchange restarts the idle clock
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(output.groups().is_empty());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let groups = output.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].in_message().body, json!([1, 2]));
    assert_eq!(groups[0].property(properties::AGGREGATED_COMPLETED_BY), Some(&json!("timeout")));
    assert_eq!(aggregator.open_groups(), 0);
    context.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_completion_interval_closes_every_group() {
    let output = Arc::new(CaptureOutput::new());
    let aggregator = Aggregator::builder("orders", correlate_by_header("customer"), collect_bodies(), output.clone())
        .completion_interval(Duration::from_secs(1))
        .build()
        .unwrap();
    let context = start_route(&aggregator).await;

    context.request("orders", order("a", json!(1))).await.unwrap();
    context.request("orders", order("b", json!(2))).await.unwrap();
    context.request("orders", order("a", json!(3))).await.unwrap();
    assert!(output.groups().is_empty());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let mut bodies: Vec<Value> = output.groups().iter().map(|g| g.in_message().body.clone()).collect();
    bodies.sort_by_key(|b| b.to_string());
    assert_eq!(bodies, vec![json!([1, 3]), json!([2])]);
    assert!(output
        .groups()
        .iter()
        .all(|g| g.property(properties::AGGREGATED_COMPLETED_BY) == Some(&json!("interval"))));
    assert_eq!(aggregator.open_groups(), 0);
    context.stop().await.unwrap();
}

#[tokio::test]
async fn test_groups_survive_restart_on_file_store() {
    let dir = tempfile::tempdir().unwrap();

    // First run: one group left open, one completed but never confirmed
    {
        let repository = RecoverableAggregationRepository::new(
            Arc::new(MemoryAggregationRepository::with_optimistic_locking()),
            Arc::new(FileDurableStore::open(dir.path()).await.unwrap()),
        );
        repository.add("open", order("open", json!([1]))).await.unwrap();
        repository.add("done", order("done", json!([2]))).await.unwrap();
        repository.remove("done").await.unwrap();
    }

    // Restart: nothing is live, so both stored exchanges are recoverable
    let store = Arc::new(FileDurableStore::open(dir.path()).await.unwrap());
    let repository = Arc::new(RecoverableAggregationRepository::new(
        Arc::new(MemoryAggregationRepository::with_optimistic_locking()),
        store,
    ));
    let recoverable = repository.recoverable().unwrap();
    let pending = recoverable.scan().await.unwrap();
    assert_eq!(pending.len(), 2);

    let id = pending.iter().next().unwrap().clone();
    let recovered = recoverable.recover(&id).await.unwrap().unwrap();
    assert_eq!(recovered.id(), id);
    assert!(recovered.property(properties::AGGREGATED_CORRELATION_KEY).is_some());
    assert!(recoverable.recover(&id).await.unwrap().is_none());

    // Route start re-emits whatever is left
    let output = Arc::new(CaptureOutput::new());
    let aggregator = Aggregator::builder("orders", correlate_by_header("customer"), collect_bodies(), output.clone())
        .repository(repository)
        .completion_size(5)
        .build()
        .unwrap();
    let context = MediationContext::new("test").unwrap();
    context
        .add_route(
            RouteBuilder::new("orders")
                .from(Arc::new(InMemoryQueueConsumer::new("orders", 1)))
                .aggregate(aggregator),
        )
        .await
        .unwrap();
    context.start().await.unwrap();
    assert_eq!(output.groups().len(), 1);
    context.stop().await.unwrap();
}
