//! ErrorHandler - redelivery state machine with optional dead-letter channel
//!
//! Each processing step of a route is wrapped by an [`ErrorHandler`]. A failed
//! attempt is evaluated against the [`RedeliveryPolicy`]; while retries remain
//! the exchange is restored to its pre-attempt state and redelivered after the
//! computed delay. Once exhausted, the exchange is either handed to the
//! dead-letter destination (always one-way) or completed with its final
//! failure for upstream callers to observe.
//!
//! Delays either sleep in the exchange's own task (synchronous mode) or are
//! scheduled on a pool from the [`ExecutorManager`](crate::executor::ExecutorManager)
//! (asynchronous mode). Either way callers get a [`DeliveryHandle`].

mod task;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fc_common::{Exchange, ExchangeError};
use fc_config::{DeadLetterSettings, RedeliverySettings};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::context::MediationContext;
use crate::executor::ThreadPool;
use crate::processor::{Predicate, Processor, Producer};
use crate::redelivery::RedeliveryPolicy;
use crate::shutdown::{ForcedShutdown, ShutdownAware};
use crate::{MediationError, Result};

pub use task::DeliveryHandle;
use task::RedeliveryTask;

type ErrorMatcher = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Overrides applied when a caught failure matches
#[derive(Clone)]
pub struct ExceptionPolicy {
    name: String,
    matcher: ErrorMatcher,
    redelivery_policy: Option<RedeliveryPolicy>,
    retry_while: Option<Arc<dyn Predicate>>,
    on_redelivery: Option<Arc<dyn Processor>>,
    handled: Option<bool>,
}

impl ExceptionPolicy {
    pub fn new<F>(name: &str, matcher: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            matcher: Arc::new(matcher),
            redelivery_policy: None,
            retry_while: None,
            on_redelivery: None,
            handled: None,
        }
    }

    /// Matches failures whose root error downcasts to `E`
    pub fn for_type<E>(name: &str) -> Self
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::new(name, |err| err.downcast_ref::<E>().is_some())
    }

    pub fn redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery_policy = Some(policy);
        self
    }

    pub fn retry_while(mut self, predicate: Arc<dyn Predicate>) -> Self {
        self.retry_while = Some(predicate);
        self
    }

    pub fn on_redelivery(mut self, processor: Arc<dyn Processor>) -> Self {
        self.on_redelivery = Some(processor);
        self
    }

    /// `true` clears the failure once exhausted, `false` keeps it even after a dead-letter send
    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = Some(handled);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, error: &ExchangeError) -> bool {
        (self.matcher)(error.inner())
    }
}

/// Declarative error handler configuration, resolved by [`ErrorHandlerBuilder::build`]
#[derive(Clone)]
pub struct ErrorHandlerBuilder {
    dead_letter_uri: Option<String>,
    dead_letter_producer: Option<Arc<dyn Producer>>,
    policy: Option<RedeliveryPolicy>,
    retry_while: Option<Arc<dyn Predicate>>,
    retry_while_ref: Option<String>,
    on_redelivery: Option<Arc<dyn Processor>>,
    on_exception_occurred: Option<Arc<dyn Processor>>,
    on_prepare_failure: Option<Arc<dyn Processor>>,
    use_original_message: bool,
    use_original_body: bool,
    dead_letter_handle_new_exception: bool,
    executor_profile: Option<String>,
    executor: Option<Arc<ThreadPool>>,
    exception_policies: Vec<ExceptionPolicy>,
}

impl Default for ErrorHandlerBuilder {
    fn default() -> Self {
        Self {
            dead_letter_uri: None,
            dead_letter_producer: None,
            policy: None,
            retry_while: None,
            retry_while_ref: None,
            on_redelivery: None,
            on_exception_occurred: None,
            on_prepare_failure: None,
            use_original_message: false,
            use_original_body: false,
            dead_letter_handle_new_exception: true,
            executor_profile: None,
            executor: None,
            exception_policies: Vec::new(),
        }
    }
}

impl ErrorHandlerBuilder {
    /// No dead-letter destination: exhausted failures stay on the exchange
    pub fn default_error_handler() -> Self {
        Self::default()
    }

    /// Exhausted exchanges are sent to the endpoint registered under `uri`
    pub fn dead_letter_channel(uri: &str) -> Self {
        Self {
            dead_letter_uri: Some(uri.to_string()),
            ..Self::default()
        }
    }

    pub fn from_settings(redelivery: &RedeliverySettings, dead_letter: &DeadLetterSettings) -> Result<Self> {
        let mut builder = match &dead_letter.dead_letter_uri {
            Some(uri) => Self::dead_letter_channel(uri),
            None => Self::default_error_handler(),
        };
        builder.policy = Some(RedeliveryPolicy::from_settings(redelivery)?);
        builder.retry_while_ref = redelivery.retry_while.clone();
        builder.use_original_message = dead_letter.use_original_message;
        builder.use_original_body = dead_letter.use_original_body;
        builder.dead_letter_handle_new_exception = dead_letter.dead_letter_handle_new_exception;
        Ok(builder)
    }

    /// Use a producer directly instead of a registry lookup
    pub fn dead_letter_producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.dead_letter_uri = Some(producer.endpoint_uri().to_string());
        self.dead_letter_producer = Some(producer);
        self
    }

    pub fn redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn maximum_redeliveries(mut self, n: i32) -> Self {
        let policy = self.policy.take().unwrap_or_default();
        self.policy = Some(policy.maximum_redeliveries(n));
        self
    }

    pub fn redelivery_delay(mut self, delay: std::time::Duration) -> Self {
        let policy = self.policy.take().unwrap_or_default();
        self.policy = Some(policy.redelivery_delay(delay));
        self
    }

    pub fn async_delayed_redelivery(mut self) -> Self {
        let policy = self.policy.take().unwrap_or_default();
        self.policy = Some(policy.async_delayed_redelivery(true));
        self
    }

    pub fn retry_while(mut self, predicate: Arc<dyn Predicate>) -> Self {
        self.retry_while = Some(predicate);
        self
    }

    /// Resolve the retry-while predicate from the registry at build time
    pub fn retry_while_ref(mut self, id: &str) -> Self {
        self.retry_while_ref = Some(id.to_string());
        self
    }

    pub fn on_redelivery(mut self, processor: Arc<dyn Processor>) -> Self {
        self.on_redelivery = Some(processor);
        self
    }

    pub fn on_exception_occurred(mut self, processor: Arc<dyn Processor>) -> Self {
        self.on_exception_occurred = Some(processor);
        self
    }

    pub fn on_prepare_failure(mut self, processor: Arc<dyn Processor>) -> Self {
        self.on_prepare_failure = Some(processor);
        self
    }

    pub fn use_original_message(mut self) -> Self {
        self.use_original_message = true;
        self
    }

    pub fn use_original_body(mut self) -> Self {
        self.use_original_body = true;
        self
    }

    pub fn dead_letter_handle_new_exception(mut self, handle: bool) -> Self {
        self.dead_letter_handle_new_exception = handle;
        self
    }

    /// Thread pool profile for asynchronous delays, instead of the shared pool
    pub fn executor_profile(mut self, profile_id: &str) -> Self {
        self.executor_profile = Some(profile_id.to_string());
        self
    }

    pub fn executor(mut self, pool: Arc<ThreadPool>) -> Self {
        self.executor = Some(pool);
        self
    }

    pub fn exception_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.exception_policies.push(policy);
        self
    }

    pub fn is_dead_letter_channel(&self) -> bool {
        self.dead_letter_uri.is_some()
    }

    /// Validate, resolve references and wrap `output`
    pub fn build(
        &self,
        context: &MediationContext,
        route_id: &str,
        output: Arc<dyn Processor>,
    ) -> Result<Arc<ErrorHandler>> {
        if self.use_original_message && self.use_original_body {
            return Err(MediationError::Config(
                "use_original_message and use_original_body are mutually exclusive".to_string(),
            ));
        }

        let policy = self
            .policy
            .clone()
            .unwrap_or_else(|| context.default_redelivery_policy().clone());

        let retry_while = match (&self.retry_while, &self.retry_while_ref) {
            (Some(predicate), _) => Some(predicate.clone()),
            (None, Some(id)) => Some(context.registry().lookup_predicate(id)?),
            (None, None) => None,
        };

        let dead_letter = match (&self.dead_letter_producer, &self.dead_letter_uri) {
            (Some(producer), _) => Some(producer.clone()),
            (None, Some(uri)) => Some(context.registry().lookup_endpoint(uri)?),
            (None, None) => None,
        };

        let needs_executor = policy.async_delayed_redelivery
            || self.exception_policies.iter().any(|p| {
                p.redelivery_policy
                    .as_ref()
                    .map_or(false, |r| r.async_delayed_redelivery)
            });
        let executor = match (&self.executor, &self.executor_profile) {
            _ if !needs_executor => None,
            (Some(pool), _) => Some(pool.clone()),
            (None, Some(profile)) => Some(context.executor_manager().new_scheduled_thread_pool(
                route_id,
                "ErrorHandlerRedeliveryTask",
                Some(profile),
            )?),
            (None, None) => Some(context.error_handler_executor()?),
        };

        debug!(
            route_id,
            dead_letter_uri = ?self.dead_letter_uri,
            maximum_redeliveries = policy.maximum_redeliveries,
            async_delayed = policy.async_delayed_redelivery,
            "Built error handler"
        );

        Ok(Arc::new(ErrorHandler {
            route_id: route_id.to_string(),
            output,
            policy,
            retry_while,
            dead_letter_uri: self.dead_letter_uri.clone(),
            dead_letter,
            dead_letter_handle_new_exception: self.dead_letter_handle_new_exception,
            use_original_message: self.use_original_message,
            use_original_body: self.use_original_body,
            on_redelivery: self.on_redelivery.clone(),
            on_exception_occurred: self.on_exception_occurred.clone(),
            on_prepare_failure: self.on_prepare_failure.clone(),
            exception_policies: self.exception_policies.clone(),
            executor,
            forced: context.shutdown_strategy().forced_signal(),
            preparing_shutdown: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }
}

/// Wraps one processing step with redelivery and failure handling
pub struct ErrorHandler {
    route_id: String,
    output: Arc<dyn Processor>,
    policy: RedeliveryPolicy,
    retry_while: Option<Arc<dyn Predicate>>,
    dead_letter_uri: Option<String>,
    dead_letter: Option<Arc<dyn Producer>>,
    dead_letter_handle_new_exception: bool,
    use_original_message: bool,
    use_original_body: bool,
    on_redelivery: Option<Arc<dyn Processor>>,
    on_exception_occurred: Option<Arc<dyn Processor>>,
    on_prepare_failure: Option<Arc<dyn Processor>>,
    exception_policies: Vec<ExceptionPolicy>,
    executor: Option<Arc<ThreadPool>>,
    forced: ForcedShutdown,
    preparing_shutdown: AtomicBool,
    stopped: AtomicBool,
}

impl ErrorHandler {
    /// Start processing `exchange`. The returned handle resolves once the
    /// exchange is done, successfully or not, and can cancel a pending delay.
    pub fn process(self: &Arc<Self>, exchange: Exchange) -> DeliveryHandle {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let exchange_id = exchange.id().to_string();

        let span = tracing::debug_span!("error_handler", route_id = %self.route_id, exchange_id = %exchange_id);
        let task = RedeliveryTask::new(self.clone(), exchange, reply_tx, cancel.clone());
        tokio::spawn(task.drive(false).instrument(span));

        DeliveryHandle::new(exchange_id, reply_rx, cancel)
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn redelivery_policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    pub fn is_dead_letter_channel(&self) -> bool {
        self.dead_letter.is_some()
    }

    pub fn dead_letter_uri(&self) -> Option<&str> {
        self.dead_letter_uri.as_deref()
    }

    pub fn executor(&self) -> Option<&Arc<ThreadPool>> {
        self.executor.as_ref()
    }

    pub fn is_preparing_shutdown(&self) -> bool {
        self.preparing_shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_started(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        self.preparing_shutdown.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn exception_policy_for(&self, error: &ExchangeError) -> Option<&ExceptionPolicy> {
        self.exception_policies.iter().find(|p| p.matches(error))
    }

    fn redelivery_possible(&self) -> bool {
        self.policy.is_redelivery_enabled()
            || self.retry_while.is_some()
            || self
                .exception_policies
                .iter()
                .any(|p| p.redelivery_policy.as_ref().map_or(false, |r| r.is_redelivery_enabled()))
    }

    /// Whether an attempt may start. Redeliveries are vetoed while preparing
    /// to shut down unless the policy allows redelivery while stopping.
    fn is_run_allowed(&self, counter: u32, allow_while_stopping: bool) -> bool {
        if self.forced.is_forced() {
            return false;
        }
        if counter > 0 {
            if allow_while_stopping {
                return true;
            }
            if self.is_preparing_shutdown() {
                return false;
            }
        }
        !self.is_stopped()
    }

    fn is_redelivery_allowed(&self, allow_while_stopping: bool) -> bool {
        allow_while_stopping || (!self.is_preparing_shutdown() && !self.is_stopped())
    }
}

#[async_trait]
impl ShutdownAware for ErrorHandler {
    fn name(&self) -> String {
        format!("error-handler:{}", self.route_id)
    }

    async fn prepare_shutdown(&self, suspend_only: bool, forced: bool) {
        debug!(route_id = %self.route_id, suspend_only, forced, "Error handler preparing for shutdown");
        self.preparing_shutdown.store(true, Ordering::SeqCst);
    }

    fn on_resume(&self) {
        self.preparing_shutdown.store(false, Ordering::SeqCst);
    }
}
