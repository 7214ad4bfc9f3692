//! Aggregator - merges correlated exchanges and emits completed groups

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use fc_common::{headers, properties, Exchange, ExchangePattern};
use fc_config::AggregationSettings;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::OptimisticLockRetryPolicy;
use super::{AggregationRepository, MemoryAggregationRepository, OptimisticLocking, Recoverable};
use crate::engine_metrics;
use crate::processor::{Predicate, Processor, Producer};
use crate::registry::Registry;
use crate::route::RouteService;
use crate::shutdown::ShutdownAware;
use crate::{MediationError, Result};

const DEFAULT_TIMEOUT_CHECKER_INTERVAL: Duration = Duration::from_secs(1);

/// A completed group and why it completed
type Completed = (Exchange, &'static str);

/// Derives the correlation key of an exchange
pub type CorrelationExpression = Arc<dyn Fn(&Exchange) -> Option<String> + Send + Sync>;

/// Correlate on an in-message header
pub fn correlate_by_header(name: &str) -> CorrelationExpression {
    let name = name.to_string();
    Arc::new(move |exchange: &Exchange| exchange.in_message().header(&name).map(value_to_key))
}

/// Correlate on a top-level field of a JSON object body
pub fn correlate_by_body_field(field: &str) -> CorrelationExpression {
    let field = field.to_string();
    Arc::new(move |exchange: &Exchange| exchange.in_message().body.get(&field).map(value_to_key))
}

fn value_to_key(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Merges a new exchange into the group so far
pub trait AggregationStrategy: Send + Sync {
    /// `old` is `None` for the first exchange of a group
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Exchange;

    /// Called when a merge lost a compare-and-swap race and will be recomputed
    fn on_optimistic_lock_failure(&self, key: &str, attempt: u32) {
        debug!(key, attempt, "Aggregation lost optimistic locking race, retrying");
    }
}

impl<F> AggregationStrategy for F
where
    F: Fn(Option<Exchange>, Exchange) -> Exchange + Send + Sync,
{
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Exchange {
        self(old, new)
    }
}

pub struct AggregatorBuilder {
    id: String,
    correlation: CorrelationExpression,
    strategy: Arc<dyn AggregationStrategy>,
    output: Arc<dyn Processor>,
    repository: Option<Arc<dyn AggregationRepository>>,
    completion_size: Option<usize>,
    completion_predicate: Option<Arc<dyn Predicate>>,
    completion_timeout: Option<Duration>,
    completion_interval: Option<Duration>,
    timeout_checker_interval: Duration,
    lock_retry: OptimisticLockRetryPolicy,
    force_completion_on_stop: bool,
    complete_all_on_stop: bool,
}

impl AggregatorBuilder {
    pub fn repository(mut self, repository: Arc<dyn AggregationRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn completion_size(mut self, size: usize) -> Self {
        self.completion_size = Some(size);
        self
    }

    pub fn completion_predicate(mut self, predicate: Arc<dyn Predicate>) -> Self {
        self.completion_predicate = Some(predicate);
        self
    }

    /// Complete a group once it received nothing new for `timeout`
    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = Some(timeout);
        self
    }

    /// How often groups are checked against the completion timeout
    pub fn timeout_checker_interval(mut self, interval: Duration) -> Self {
        self.timeout_checker_interval = interval;
        self
    }

    /// Complete every open group on a fixed period
    pub fn completion_interval(mut self, interval: Duration) -> Self {
        self.completion_interval = Some(interval);
        self
    }

    pub fn lock_retry(mut self, policy: OptimisticLockRetryPolicy) -> Self {
        self.lock_retry = policy;
        self
    }

    /// Complete every open group when the route stops
    pub fn force_completion_on_stop(mut self, force: bool) -> Self {
        self.force_completion_on_stop = force;
        self
    }

    /// Hold shutdown until open groups completed on their own
    pub fn complete_all_on_stop(mut self, complete_all: bool) -> Self {
        self.complete_all_on_stop = complete_all;
        self
    }

    /// Apply completion, stop and lock retry settings
    pub fn settings(mut self, settings: &AggregationSettings) -> Self {
        if let Some(size) = settings.completion_size {
            self.completion_size = Some(size);
        }
        if let Some(ms) = settings.completion_timeout_ms {
            self.completion_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = settings.completion_interval_ms {
            self.completion_interval = Some(Duration::from_millis(ms));
        }
        self.force_completion_on_stop = settings.force_completion_on_stop;
        self.complete_all_on_stop = settings.complete_all_on_stop;
        self.lock_retry = OptimisticLockRetryPolicy::from_settings(&settings.lock_retry);
        self
    }

    pub fn build(self) -> Result<Arc<Aggregator>> {
        let invalid = |msg: &str| Err(MediationError::Config(format!("aggregator {} {}", self.id, msg)));

        if self.completion_size.is_none()
            && self.completion_predicate.is_none()
            && self.completion_timeout.is_none()
            && self.completion_interval.is_none()
            && !self.force_completion_on_stop
        {
            return invalid(
                "needs a completion size, predicate, timeout, interval or force completion on stop",
            );
        }
        if self.completion_size == Some(0) {
            return invalid("completion size must be positive");
        }
        if self.completion_timeout.is_some() && self.completion_interval.is_some() {
            return invalid("can use only one of completion timeout or completion interval");
        }
        if self.completion_timeout.map_or(false, |t| t.is_zero())
            || self.completion_interval.map_or(false, |i| i.is_zero())
            || self.timeout_checker_interval.is_zero()
        {
            return invalid("completion timeout and interval must be positive");
        }
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(MemoryAggregationRepository::with_optimistic_locking()));
        if let Some(recoverable) = repository.recoverable() {
            let max = recoverable.maximum_redeliveries().unwrap_or(0);
            match recoverable.dead_letter_uri() {
                Some(_) if max == 0 => return invalid("recovery dead letter needs positive maximum redeliveries"),
                None if max > 0 => return invalid("recovery maximum redeliveries needs a dead letter uri"),
                _ => {}
            }
        }

        Ok(Arc::new_cyclic(|me| Aggregator {
            me: me.clone(),
            id: self.id,
            correlation: self.correlation,
            strategy: self.strategy,
            output: self.output,
            repository,
            completion_size: self.completion_size,
            completion_predicate: self.completion_predicate,
            completion_timeout: self.completion_timeout,
            completion_interval: self.completion_interval,
            timeout_checker_interval: self.timeout_checker_interval,
            lock_retry: self.lock_retry,
            force_completion_on_stop: self.force_completion_on_stop,
            complete_all_on_stop: self.complete_all_on_stop,
            serial: tokio::sync::Mutex::new(()),
            preparing: AtomicBool::new(false),
            completing: DashSet::new(),
            last_activity: DashMap::new(),
            recovery_attempts: DashMap::new(),
            dead_letter: Mutex::new(None),
            completed: AtomicU64::new(0),
            background: Mutex::new(None),
        }))
    }
}

/// Route step that groups exchanges by correlation key. Incoming exchanges
/// end their route at the aggregator; completed groups go to `output`.
pub struct Aggregator {
    me: Weak<Aggregator>,
    id: String,
    correlation: CorrelationExpression,
    strategy: Arc<dyn AggregationStrategy>,
    output: Arc<dyn Processor>,
    repository: Arc<dyn AggregationRepository>,
    completion_size: Option<usize>,
    completion_predicate: Option<Arc<dyn Predicate>>,
    completion_timeout: Option<Duration>,
    completion_interval: Option<Duration>,
    timeout_checker_interval: Duration,
    lock_retry: OptimisticLockRetryPolicy,
    force_completion_on_stop: bool,
    complete_all_on_stop: bool,
    /// Serializes merges when the repository has no compare-and-swap
    serial: tokio::sync::Mutex<()>,
    preparing: AtomicBool,
    /// Ids of completed groups whose output is still running
    completing: DashSet<String>,
    /// Correlation key to the time its group last received an exchange
    last_activity: DashMap<String, Instant>,
    /// Recovered exchange id to the redelivery attempts made for it
    recovery_attempts: DashMap<String, u32>,
    dead_letter: Mutex<Option<Arc<dyn Producer>>>,
    completed: AtomicU64,
    background: Mutex<Option<(CancellationToken, Vec<JoinHandle<()>>)>>,
}

impl Aggregator {
    pub fn builder(
        id: &str,
        correlation: CorrelationExpression,
        strategy: Arc<dyn AggregationStrategy>,
        output: Arc<dyn Processor>,
    ) -> AggregatorBuilder {
        AggregatorBuilder {
            id: id.to_string(),
            correlation,
            strategy,
            output,
            repository: None,
            completion_size: None,
            completion_predicate: None,
            completion_timeout: None,
            completion_interval: None,
            timeout_checker_interval: DEFAULT_TIMEOUT_CHECKER_INTERVAL,
            lock_retry: OptimisticLockRetryPolicy::default(),
            force_completion_on_stop: false,
            complete_all_on_stop: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn repository(&self) -> &Arc<dyn AggregationRepository> {
        &self.repository
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn open_groups(&self) -> usize {
        self.repository.keys().len()
    }

    /// Resolve the endpoint exhausted recovered groups are sent to
    pub(crate) fn bind_endpoints(&self, registry: &Registry) -> Result<()> {
        let Some(uri) = self.repository.recoverable().and_then(|r| r.dead_letter_uri()) else {
            return Ok(());
        };
        let producer = registry.lookup_endpoint(uri)?;
        *self.dead_letter.lock() = Some(producer);
        Ok(())
    }

    /// Merge `incoming` into its group, returning the group and the
    /// completion reason if it completed
    async fn aggregate(&self, key: &str, incoming: Exchange) -> Result<Option<Completed>> {
        match self.repository.optimistic_locking() {
            Some(cas) => self.aggregate_optimistic(cas, key, incoming).await,
            None => {
                let _serial = self.serial.lock().await;
                self.aggregate_serial(key, incoming).await
            }
        }
    }

    async fn aggregate_serial(&self, key: &str, incoming: Exchange) -> Result<Option<Completed>> {
        let old = self.repository.get(key).await?;
        let (merged, reason) = self.merge(key, old.clone(), incoming);
        let Some(reason) = reason else {
            self.repository.add(key, merged).await?;
            self.last_activity.insert(key.to_string(), Instant::now());
            return Ok(None);
        };
        self.complete_group(key, old.as_ref(), &merged).await?;
        Ok(Some((merged, reason)))
    }

    /// Read, merge, compare-and-swap; recompute the merge on conflict
    async fn aggregate_optimistic(
        &self,
        cas: &dyn OptimisticLocking,
        key: &str,
        incoming: Exchange,
    ) -> Result<Option<Completed>> {
        let mut attempt = 0;
        loop {
            let old = self.repository.get(key).await?;
            let (merged, reason) = self.merge(key, old.clone(), incoming.clone());

            let written = match reason {
                None => cas.add_expected(key, old.as_ref(), merged).await.map(|_| {
                    self.last_activity.insert(key.to_string(), Instant::now());
                    None
                }),
                Some(reason) => self
                    .complete_group(key, old.as_ref(), &merged)
                    .await
                    .map(|_| Some((merged, reason))),
            };

            match written {
                Ok(done) => return Ok(done),
                Err(MediationError::OptimisticLocking { .. }) => {
                    attempt += 1;
                    engine_metrics::record_lock_conflict(&self.id);
                    if !self.lock_retry.should_retry(attempt) {
                        return Err(MediationError::OptimisticLockingExhausted {
                            key: key.to_string(),
                            attempts: attempt,
                        });
                    }
                    self.strategy.on_optimistic_lock_failure(key, attempt);
                    self.lock_retry.wait(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn merge(&self, key: &str, old: Option<Exchange>, incoming: Exchange) -> (Exchange, Option<&'static str>) {
        let size = old
            .as_ref()
            .and_then(|o| o.property(properties::AGGREGATED_SIZE))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            + 1;
        let mut merged = self.strategy.aggregate(old, incoming);
        merged.set_property(properties::AGGREGATED_SIZE, size);
        merged.set_property(properties::AGGREGATED_CORRELATION_KEY, key.to_string());

        let reason = if self.completion_size.map_or(false, |n| size >= n as u64) {
            Some("size")
        } else if self.completion_predicate.as_ref().map_or(false, |p| p.matches(&merged)) {
            Some("predicate")
        } else {
            None
        };
        (merged, reason)
    }

    /// Remove the group of `key` as completed by `completed`. The id is
    /// marked completing before the repository stores the completed copy,
    /// so a recovery scan cannot pick it up while the output runs.
    async fn complete_group(&self, key: &str, expected: Option<&Exchange>, completed: &Exchange) -> Result<()> {
        self.completing.insert(completed.id().to_string());
        let result = match self.repository.optimistic_locking() {
            Some(cas) => cas.complete_expected(key, expected, completed).await,
            None => self.repository.complete(key, completed).await,
        };
        match result {
            Ok(()) => {
                self.last_activity.remove(key);
                Ok(())
            }
            Err(e) => {
                self.completing.remove(completed.id());
                Err(e)
            }
        }
    }

    /// Complete the open group of `key` outside of a merge. Returns false
    /// when another path completed or changed it first.
    async fn complete_open_group(&self, key: &str, reason: &'static str) -> Result<bool> {
        let serial = if self.repository.supports_optimistic_locking() {
            None
        } else {
            Some(self.serial.lock().await)
        };
        let Some(group) = self.repository.get(key).await? else {
            return Ok(false);
        };
        match self.complete_group(key, Some(&group), &group).await {
            Ok(()) => {}
            Err(MediationError::OptimisticLocking { .. }) => {
                debug!(aggregator = %self.id, key, reason, "Group changed before it could complete");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        drop(serial);
        self.emit(group, reason).await?;
        Ok(true)
    }

    /// Send a completed group to the output. On success the group is
    /// confirmed, otherwise it stays recoverable. Returns whether the output
    /// accepted it.
    async fn emit(&self, mut group: Exchange, reason: &str) -> Result<bool> {
        let group_id = group.id().to_string();
        self.completing.insert(group_id.clone());
        engine_metrics::record_completion(&self.id, reason);
        group.set_property(properties::AGGREGATED_COMPLETED_BY, reason);

        let result = match self.output.process(&mut group).await {
            Ok(()) => match group.take_exception() {
                Some(err) => Err(anyhow::anyhow!("{}", err)),
                None => Ok(()),
            },
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                debug!(aggregator = %self.id, exchange_id = %group_id, reason, "Aggregation completed");
                self.repository.confirm(&group_id).await.map(|_| true)
            }
            Err(e) => {
                error!(
                    aggregator = %self.id,
                    exchange_id = %group_id,
                    recoverable = self.repository.supports_recovery(),
                    error = %e,
                    "Aggregation output failed"
                );
                Ok(false)
            }
        };
        self.completing.remove(&group_id);
        outcome
    }

    /// Complete every open group regardless of completion criteria
    pub async fn force_completion(&self) -> usize {
        self.complete_open_groups("force", |_| true).await
    }

    async fn complete_open_groups(&self, reason: &'static str, due: impl Fn(&str) -> bool) -> usize {
        let mut completed = 0;
        for key in self.repository.keys() {
            if !due(&key) {
                continue;
            }
            match self.complete_open_group(&key, reason).await {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(aggregator = %self.id, key = %key, reason, error = %e, "Could not complete aggregation group")
                }
            }
        }
        if completed > 0 {
            info!(aggregator = %self.id, groups = completed, reason, "Completed open aggregation groups");
        }
        completed
    }

    /// Complete groups idle for longer than the completion timeout
    async fn complete_timed_out(&self, timeout: Duration) -> usize {
        self.complete_open_groups("timeout", |key| {
            self.last_activity
                .get(key)
                .map_or(true, |last| last.elapsed() >= timeout)
        })
        .await
    }

    /// Re-emit stored groups that were never confirmed. Returns the number
    /// re-emitted; groups out of attempts go to the recovery dead letter.
    pub async fn recover(&self) -> Result<usize> {
        let Some(recoverable) = self.repository.recoverable() else {
            return Ok(0);
        };
        let maximum = recoverable.maximum_redeliveries().filter(|max| *max > 0);
        let mut recovered = 0;
        for exchange_id in recoverable.scan().await? {
            if self.completing.contains(&exchange_id) {
                continue;
            }
            let Some(mut group) = recoverable.recover(&exchange_id).await? else {
                continue;
            };
            let key = group
                .property(properties::AGGREGATED_CORRELATION_KEY)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            let attempts = self.recovery_attempts.get(&exchange_id).map_or(0, |a| *a);
            if let Some(max) = maximum {
                if attempts >= max {
                    self.dead_letter_recovered(recoverable, &key, group, attempts).await?;
                    continue;
                }
                group.in_message_mut().set_header(headers::REDELIVERY_MAX_COUNTER, max);
            }
            let attempt = attempts + 1;
            self.recovery_attempts.insert(exchange_id.clone(), attempt);
            group.in_message_mut().set_header(headers::REDELIVERY_COUNTER, attempt);

            info!(aggregator = %self.id, exchange_id = %exchange_id, attempt, "Recovering aggregated exchange");
            if self.emit(group.clone(), "recovered").await? {
                self.recovery_attempts.remove(&exchange_id);
            } else {
                recoverable.store_completed(&key, &group).await?;
            }
            recovered += 1;
        }
        if recovered > 0 {
            engine_metrics::record_recovered(&self.id, recovered);
        }
        Ok(recovered)
    }

    async fn dead_letter_recovered(
        &self,
        recoverable: &dyn Recoverable,
        key: &str,
        mut group: Exchange,
        attempts: u32,
    ) -> Result<()> {
        let uri = recoverable.dead_letter_uri().unwrap_or_default().to_string();
        warn!(
            aggregator = %self.id,
            exchange_id = %group.id(),
            attempts,
            dead_letter = %uri,
            "Recovered exchange is exhausted, moving it to the dead letter channel"
        );
        group.in_message_mut().set_header(headers::REDELIVERY_COUNTER, attempts);
        group.set_redelivery_exhausted(true);

        let producer = self.dead_letter.lock().clone();
        let sent = match producer {
            Some(producer) => producer.send(&mut group, ExchangePattern::InOnly).await,
            None => Err(anyhow::anyhow!("dead letter endpoint {} is not bound", uri)),
        };
        engine_metrics::record_dead_letter(&self.id, sent.is_ok());
        match sent {
            Ok(()) => {
                self.recovery_attempts.remove(group.id());
                Ok(())
            }
            Err(e) => {
                error!(
                    aggregator = %self.id,
                    exchange_id = %group.id(),
                    error = %e,
                    "Failed to move recovered exchange to the dead letter channel"
                );
                group.set_redelivery_exhausted(false);
                recoverable.store_completed(key, &group).await
            }
        }
    }

    /// Run `tick` every `period` until the aggregator stops
    fn spawn_periodic<F, Fut>(
        &self,
        token: &CancellationToken,
        period: Duration,
        name: &'static str,
        tick: F,
    ) -> Option<JoinHandle<()>>
    where
        F: Fn(Arc<Aggregator>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let this = self.me.upgrade()?;
        let token = token.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick(this.clone()).await,
                    _ = token.cancelled() => {
                        debug!(aggregator = %this.id, task = name, "Aggregation task shutting down");
                        break;
                    }
                }
            }
        }))
    }

    fn start_background(&self) {
        let token = CancellationToken::new();
        let mut handles = Vec::new();

        if let Some(interval) = self
            .repository
            .recoverable()
            .map(|r| r.recovery_interval())
            .filter(|i| !i.is_zero())
        {
            handles.extend(self.spawn_periodic(&token, interval, "recovery", |this| async move {
                if let Err(e) = this.recover().await {
                    warn!(aggregator = %this.id, error = %e, "Aggregation recovery failed");
                }
            }));
        }
        if let Some(timeout) = self.completion_timeout {
            let period = self.timeout_checker_interval.min(timeout);
            handles.extend(self.spawn_periodic(&token, period, "completion-timeout", move |this| async move {
                this.complete_timed_out(timeout).await;
            }));
        }
        if let Some(interval) = self.completion_interval {
            handles.extend(self.spawn_periodic(&token, interval, "completion-interval", |this| async move {
                this.complete_open_groups("interval", |_| true).await;
            }));
        }

        if let Some((previous, _)) = self.background.lock().replace((token, handles)) {
            previous.cancel();
        }
    }
}

#[async_trait]
impl Processor for Aggregator {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        if self.preparing.load(Ordering::SeqCst) {
            return Err(MediationError::ShutdownInProgress.into());
        }
        let key = (self.correlation)(exchange)
            .ok_or_else(|| MediationError::MissingCorrelationKey(exchange.id().to_string()))?;

        let mut incoming = exchange.clone();
        incoming.set_exception(None);
        if let Some((group, reason)) = self.aggregate(&key, incoming).await? {
            self.emit(group, reason).await?;
        }

        exchange.set_property(properties::AGGREGATED_CORRELATION_KEY, key);
        exchange.set_route_stop(true);
        Ok(())
    }
}

#[async_trait]
impl ShutdownAware for Aggregator {
    fn name(&self) -> String {
        format!("aggregator:{}", self.id)
    }

    async fn prepare_shutdown(&self, suspend_only: bool, forced: bool) {
        self.preparing.store(true, Ordering::SeqCst);
        if self.force_completion_on_stop && !suspend_only && !forced {
            self.force_completion().await;
        }
    }

    async fn pending_exchanges(&self) -> usize {
        let completing = self.completing.len();
        if self.complete_all_on_stop {
            completing + self.open_groups()
        } else {
            completing
        }
    }

    fn on_resume(&self) {
        self.preparing.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl RouteService for Aggregator {
    async fn start(&self) -> Result<()> {
        self.preparing.store(false, Ordering::SeqCst);
        if let Some(recoverable) = self.repository.recoverable() {
            let interval = recoverable.recovery_interval();
            let recovered = self.recover().await?;
            info!(
                aggregator = %self.id,
                recovered,
                interval_ms = interval.as_millis() as u64,
                maximum_redeliveries = ?recoverable.maximum_redeliveries(),
                dead_letter = ?recoverable.dead_letter_uri(),
                "Aggregation recovery enabled"
            );
        }
        self.start_background();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some((cancel, _handles)) = self.background.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}
