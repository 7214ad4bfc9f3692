//! Per-exchange redelivery state machine
//!
//! Processing -> Evaluating -> Delaying -> Processing ... until the exchange
//! succeeds, or Evaluating decides it is exhausted and Handling runs the
//! failure path. Every path ends in `complete`, which hands the exchange
//! back through the [`DeliveryHandle`] exactly once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use fc_common::{headers, properties, Exchange, ExchangeError, ExchangePattern, Message};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ErrorHandler;
use crate::engine_metrics;
use crate::executor::PoolTask;
use crate::processor::{Predicate, Processor};
use crate::redelivery::{log_at, RedeliveryPolicy};
use crate::{MediationError, Result};

/// Awaitable completion of an exchange handed to an [`ErrorHandler`]
pub struct DeliveryHandle {
    exchange_id: String,
    reply: oneshot::Receiver<Exchange>,
    cancel: CancellationToken,
}

impl DeliveryHandle {
    pub(super) fn new(exchange_id: String, reply: oneshot::Receiver<Exchange>, cancel: CancellationToken) -> Self {
        Self {
            exchange_id,
            reply,
            cancel,
        }
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    /// Interrupt a pending redelivery delay. The exchange still completes,
    /// exhausted with a rejected-execution failure.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Future for DeliveryHandle {
    type Output = Result<Exchange>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.reply)
            .poll(cx)
            .map(|reply| reply.map_err(|_| MediationError::DeliveryCancelled(this.exchange_id.clone())))
    }
}

/// Failure-scoped state, created on the first failure
struct RedeliveryState {
    counter: u32,
    first_failure_at: Instant,
    caught: Option<ExchangeError>,
    policy: RedeliveryPolicy,
    retry_while: Option<Arc<dyn Predicate>>,
    on_redelivery: Option<Arc<dyn Processor>>,
    handled: Option<bool>,
}

pub(super) struct RedeliveryTask {
    handler: Arc<ErrorHandler>,
    exchange: Exchange,
    /// In-message before the first attempt, restored before each redelivery
    snapshot: Option<Message>,
    state: Option<RedeliveryState>,
    reply: Option<oneshot::Sender<Exchange>>,
    cancel: CancellationToken,
}

impl RedeliveryTask {
    pub(super) fn new(
        handler: Arc<ErrorHandler>,
        exchange: Exchange,
        reply: oneshot::Sender<Exchange>,
        cancel: CancellationToken,
    ) -> Self {
        let snapshot = handler
            .redelivery_possible()
            .then(|| exchange.in_message().clone());
        Self {
            handler,
            exchange,
            snapshot,
            state: None,
            reply: Some(reply),
            cancel,
        }
    }

    fn counter(&self) -> u32 {
        self.state.as_ref().map_or(0, |s| s.counter)
    }

    fn allow_while_stopping(&self) -> bool {
        self.state
            .as_ref()
            .map_or(self.handler.policy.allow_redelivery_while_stopping, |s| {
                s.policy.allow_redelivery_while_stopping
            })
    }

    /// Run the state machine. `resuming` is true when entered after a delay.
    pub(super) async fn drive(mut self, mut resuming: bool) {
        loop {
            if resuming && self.cancel.is_cancelled() {
                self.interrupted("redelivery cancelled").await;
                return;
            }
            if !self.handler.is_run_allowed(self.counter(), self.allow_while_stopping()) {
                self.not_allowed().await;
                return;
            }

            let attempt_ok = if resuming { self.prepare_redelivery().await } else { true };
            resuming = true;

            if attempt_ok {
                if let Err(err) = self.handler.output.process(&mut self.exchange).await {
                    self.exchange.set_exception(Some(ExchangeError::new(err)));
                }
            }

            if !self.exchange.is_failed() {
                if self.counter() > 0 {
                    debug!(attempt = self.counter(), "Redelivery succeeded");
                }
                self.complete();
                return;
            }

            let delay = match self.evaluate().await {
                Some(delay) => delay,
                None => {
                    self.handle_exhausted().await;
                    self.complete();
                    return;
                }
            };

            if delay.is_zero() {
                continue;
            }

            if self.use_async_delay() {
                if let Some(executor) = self.handler.executor.clone() {
                    // On rejection the pool calls `reject`, which finishes the exchange
                    let _ = executor.schedule(delay, Box::new(self));
                    return;
                }
            }

            if let Err(reason) = self.sleep(delay).await {
                self.interrupted(reason).await;
                return;
            }
        }
    }

    fn use_async_delay(&self) -> bool {
        let asynchronous = self
            .state
            .as_ref()
            .map_or(self.handler.policy.async_delayed_redelivery, |s| s.policy.async_delayed_redelivery);
        asynchronous && !self.exchange.is_transacted()
    }

    async fn sleep(&self, delay: Duration) -> std::result::Result<(), &'static str> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.handler.forced.wait() => Err("forced shutdown while awaiting redelivery"),
            _ = self.cancel.cancelled() => Err("redelivery cancelled"),
        }
    }

    /// Evaluate a failed attempt. Returns the delay before the next attempt,
    /// or `None` once the exchange is exhausted.
    async fn evaluate(&mut self) -> Option<Duration> {
        let caught = self.exchange.exception()?.clone();
        let handler = self.handler.clone();

        let state = self.state.get_or_insert_with(|| RedeliveryState {
            counter: 0,
            first_failure_at: Instant::now(),
            caught: None,
            policy: handler.policy.clone(),
            retry_while: handler.retry_while.clone(),
            on_redelivery: handler.on_redelivery.clone(),
            handled: None,
        });

        match handler.exception_policy_for(&caught) {
            Some(matched) => {
                state.policy = matched.redelivery_policy.clone().unwrap_or_else(|| handler.policy.clone());
                state.retry_while = matched.retry_while.clone().or_else(|| handler.retry_while.clone());
                state.on_redelivery = matched.on_redelivery.clone().or_else(|| handler.on_redelivery.clone());
                state.handled = matched.handled;
            }
            None => {
                state.policy = handler.policy.clone();
                state.retry_while = handler.retry_while.clone();
                state.on_redelivery = handler.on_redelivery.clone();
                state.handled = None;
            }
        }
        state.caught = Some(caught.clone());
        self.exchange.set_exception_caught(Some(caught.clone()));

        if let Some(callback) = &handler.on_exception_occurred {
            if let Err(err) = callback.process(&mut self.exchange).await {
                warn!(error = %err, "on_exception_occurred processor failed, ignoring");
            }
        }

        let state = self.state.as_mut()?;
        if self.exchange.is_rollback_only() {
            self.exchange.set_redelivery_exhausted(true);
            return None;
        }

        state.counter += 1;
        let attempt = state.counter;
        let message = self.exchange.in_message_mut();
        message.set_header(headers::REDELIVERED, true);
        message.set_header(headers::REDELIVERY_COUNTER, attempt);
        if state.policy.maximum_redeliveries > 0 {
            message.set_header(headers::REDELIVERY_MAX_COUNTER, state.policy.maximum_redeliveries);
        }

        let exhausted = self.exchange.is_redelivery_exhausted()
            || state
                .policy
                .should_exhaust(attempt, &self.exchange, state.retry_while.as_deref())
            || !handler.is_redelivery_allowed(state.policy.allow_redelivery_while_stopping);
        if exhausted {
            self.exchange.set_redelivery_exhausted(true);
            return None;
        }

        let delay = self
            .exchange
            .in_message()
            .header(headers::REDELIVERY_DELAY)
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or_else(|| state.policy.next_delay(attempt));

        let logging = &state.policy.logging;
        if logging.should_log_attempt(attempt) {
            if logging.log_retry_stack_trace {
                log_at!(
                    logging.retry_attempted_level,
                    route_id = %handler.route_id,
                    exchange_id = %self.exchange.id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = ?caught,
                    "Failed delivery, redelivery scheduled"
                );
            } else {
                log_at!(
                    logging.retry_attempted_level,
                    route_id = %handler.route_id,
                    exchange_id = %self.exchange.id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %caught,
                    "Failed delivery, redelivery scheduled"
                );
            }
        }
        Some(delay)
    }

    /// Restore the exchange to its pre-attempt state. Returns false when the
    /// on-redelivery callback failed, which counts as a failed attempt.
    async fn prepare_redelivery(&mut self) -> bool {
        let Some(state) = self.state.as_ref() else {
            return true;
        };
        let attempt = state.counter;
        let max = state.policy.maximum_redeliveries;
        let on_redelivery = state.on_redelivery.clone();

        if let Some(snapshot) = &self.snapshot {
            self.exchange.set_in_message(snapshot.clone());
            let message = self.exchange.in_message_mut();
            message.set_header(headers::REDELIVERED, true);
            message.set_header(headers::REDELIVERY_COUNTER, attempt);
            if max > 0 {
                message.set_header(headers::REDELIVERY_MAX_COUNTER, max);
            }
        }
        self.exchange.set_out_message(None);
        self.exchange.set_exception(None);
        engine_metrics::record_redelivery_attempt(&self.handler.route_id, attempt);

        if let Some(callback) = on_redelivery {
            if let Err(err) = callback.process(&mut self.exchange).await {
                self.exchange.set_exception(Some(ExchangeError::new(err)));
                return false;
            }
        }
        true
    }

    /// Run was vetoed before an attempt
    async fn not_allowed(&mut self) {
        if self.handler.forced.is_forced() {
            self.interrupted("forced shutdown in progress").await;
            return;
        }
        if self.counter() == 0 {
            let error = MediationError::RejectedExecution(format!(
                "error handler for route {} is stopped",
                self.handler.route_id
            ));
            self.exchange.set_exception(Some(ExchangeError::new(error)));
            self.complete();
            return;
        }
        debug!(attempt = self.counter(), "Redelivery vetoed by shutdown, exhausting");
        self.exchange.set_redelivery_exhausted(true);
        self.handle_exhausted().await;
        self.complete();
    }

    /// A pending delay was interrupted or the task was dropped by its pool
    async fn interrupted(&mut self, reason: &str) {
        let error = ExchangeError::new(MediationError::RejectedExecution(reason.to_string()));
        self.exchange.set_exception(Some(error.clone()));
        self.exchange.set_exception_caught(Some(error.clone()));
        self.exchange.set_redelivery_exhausted(true);
        if let Some(state) = self.state.as_mut() {
            state.caught = Some(error);
        }

        if self.handler.forced.is_forced() {
            warn!(
                route_id = %self.handler.route_id,
                exchange_id = %self.exchange.id(),
                reason,
                "Exchange abandoned by forced shutdown"
            );
            engine_metrics::record_exhausted(&self.handler.route_id, "aborted");
            self.complete();
            return;
        }
        self.handle_exhausted().await;
        self.complete();
    }

    /// Handling: deliver to the failure processor and resolve the error state
    async fn handle_exhausted(&mut self) {
        let handler = self.handler.clone();
        let caught = self
            .state
            .as_ref()
            .and_then(|s| s.caught.clone())
            .or_else(|| self.exchange.exception().cloned());
        let Some(caught) = caught else {
            return;
        };
        let explicit_handled = self.state.as_ref().and_then(|s| s.handled);
        let policy = self
            .state
            .as_ref()
            .map_or_else(|| handler.policy.clone(), |s| s.policy.clone());

        if self.exchange.is_rollback_only() {
            self.exchange.set_exception(Some(caught.clone()));
            self.exchange.set_error_handler_handled(Some(false));
            engine_metrics::record_exhausted(&handler.route_id, "rollback");
            log_at!(
                policy.logging.retries_exhausted_level,
                route_id = %handler.route_id,
                exchange_id = %self.exchange.id(),
                error = %caught,
                "Exchange marked rollback only, not handled"
            );
            return;
        }

        let mut new_exception = None;
        if handler.dead_letter.is_some() || handler.on_prepare_failure.is_some() || explicit_handled.is_some() {
            self.exchange.set_exception(None);
            self.apply_original_message();
            self.exchange
                .set_property(properties::FAILURE_ROUTE_ID, handler.route_id.clone());

            if let Some(callback) = &handler.on_prepare_failure {
                if let Err(err) = callback.process(&mut self.exchange).await {
                    warn!(error = %err, "on_prepare_failure processor failed, ignoring");
                }
            }

            if let Some(dead_letter) = &handler.dead_letter {
                self.exchange
                    .set_property(properties::FAILURE_ENDPOINT, dead_letter.endpoint_uri().to_string());
                let pattern = self.exchange.pattern();
                let sent = dead_letter.send(&mut self.exchange, ExchangePattern::InOnly).await;
                self.exchange.set_pattern(pattern);

                new_exception = match sent {
                    Err(err) => Some(ExchangeError::new(err)),
                    Ok(()) => self.exchange.take_exception(),
                };
                engine_metrics::record_dead_letter(&handler.route_id, new_exception.is_none());
            }
        }

        let is_dead_letter = handler.dead_letter.is_some();
        let handled = match explicit_handled {
            Some(handled) => handled,
            None => is_dead_letter && (new_exception.is_none() || handler.dead_letter_handle_new_exception),
        };

        self.exchange.set_failure_handled(is_dead_letter || handled);
        self.exchange.set_redelivery_exhausted(true);

        let outcome = match (&new_exception, handled) {
            (Some(new_err), true) => {
                if policy.logging.log_new_exception {
                    warn!(
                        route_id = %handler.route_id,
                        exchange_id = %self.exchange.id(),
                        error = %new_err,
                        "Dead letter channel failed, new failure handled"
                    );
                }
                self.exchange.set_exception(None);
                self.exchange.set_error_handler_handled(Some(true));
                "handled"
            }
            (None, true) => {
                self.exchange.set_exception(None);
                self.exchange.set_error_handler_handled(Some(true));
                "handled"
            }
            (Some(new_err), false) if is_dead_letter => {
                self.exchange.set_exception(Some(new_err.clone()));
                self.exchange.set_error_handler_handled(Some(false));
                "dead_letter_failed"
            }
            (_, false) => {
                self.exchange.set_exception(Some(caught.clone()));
                self.exchange.set_error_handler_handled(Some(false));
                "unhandled"
            }
        };
        engine_metrics::record_exhausted(&handler.route_id, outcome);
        self.log_exhausted(&policy, &caught, handled, new_exception.is_some());
    }

    fn apply_original_message(&mut self) {
        let original = self
            .exchange
            .original_in()
            .cloned()
            .or_else(|| self.snapshot.clone());
        let Some(original) = original else {
            return;
        };
        if self.handler.use_original_message {
            self.exchange.set_in_message(original);
        } else if self.handler.use_original_body {
            self.exchange.in_message_mut().body = original.body;
        }
    }

    fn log_exhausted(&self, policy: &RedeliveryPolicy, caught: &ExchangeError, handled: bool, new_exception: bool) {
        let logging = &policy.logging;
        if !logging.log_exhausted || (handled && !new_exception && !logging.log_handled) {
            return;
        }
        let attempts = self.counter();
        let failing_for_ms = self
            .state
            .as_ref()
            .map_or(0, |s| s.first_failure_at.elapsed().as_millis() as u64);
        let target = self.handler.dead_letter_uri.as_deref().unwrap_or("none");

        if logging.log_stack_trace {
            log_at!(
                logging.retries_exhausted_level,
                route_id = %self.handler.route_id,
                exchange_id = %self.exchange.id(),
                attempts,
                failing_for_ms,
                handled,
                dead_letter = target,
                error = ?caught,
                "Exhausted after delivery attempts"
            );
        } else {
            log_at!(
                logging.retries_exhausted_level,
                route_id = %self.handler.route_id,
                exchange_id = %self.exchange.id(),
                attempts,
                failing_for_ms,
                handled,
                dead_letter = target,
                error = %caught,
                "Exhausted after delivery attempts"
            );
        }
    }

    /// Hand the exchange back. Failure state is discarded with the task.
    fn complete(&mut self) {
        self.state = None;
        if let Some(reply) = self.reply.take() {
            let exchange = std::mem::take(&mut self.exchange);
            let _ = reply.send(exchange);
        }
    }
}

impl PoolTask for RedeliveryTask {
    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        (*self).drive(true).boxed()
    }

    fn interruption(&self) -> Option<BoxFuture<'static, ()>> {
        let cancel = self.cancel.clone();
        let forced = self.handler.forced.clone();
        Some(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = forced.wait() => {}
                }
            }
            .boxed(),
        )
    }

    fn reject(self: Box<Self>, reason: &str) {
        let reason = format!("redelivery rejected: {}", reason);
        let mut task = *self;
        tokio::spawn(async move {
            task.interrupted(&reason).await;
        });
    }
}

impl Drop for RedeliveryTask {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            let error = MediationError::RejectedExecution("redelivery task dropped before completion".to_string());
            let mut exchange = std::mem::take(&mut self.exchange);
            exchange.set_exception(Some(ExchangeError::new(error)));
            exchange.set_redelivery_exhausted(true);
            let _ = reply.send(exchange);
        }
    }
}
