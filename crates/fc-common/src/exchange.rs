//! Exchange data model
//!
//! An [`Exchange`] is one message in flight through a route. Its identity is
//! fixed at creation; the messages, properties and failure state are mutated
//! by each processing step.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header names set on the in message by the error handler
pub mod headers {
    /// `true` once the exchange has been redelivered at least once
    pub const REDELIVERED: &str = "FlowCatalystRedelivered";
    /// Number of redelivery attempts made so far
    pub const REDELIVERY_COUNTER: &str = "FlowCatalystRedeliveryCounter";
    /// Configured maximum redeliveries (only set when bounded)
    pub const REDELIVERY_MAX_COUNTER: &str = "FlowCatalystRedeliveryMaxCounter";
    /// Per-exchange override of the next redelivery delay, in milliseconds
    pub const REDELIVERY_DELAY: &str = "FlowCatalystRedeliveryDelay";
}

/// Property names shared between the mediation components
pub mod properties {
    pub const FAILURE_ROUTE_ID: &str = "FlowCatalystFailureRouteId";
    pub const FAILURE_ENDPOINT: &str = "FlowCatalystFailureEndpoint";
    pub const AGGREGATED_SIZE: &str = "FlowCatalystAggregatedSize";
    pub const AGGREGATED_CORRELATION_KEY: &str = "FlowCatalystAggregatedCorrelationKey";
    /// Why an aggregated group completed: size, predicate, timeout, interval, force or recovered
    pub const AGGREGATED_COMPLETED_BY: &str = "FlowCatalystAggregatedCompletedBy";
    pub const AGGREGATION_VERSION: &str = "FlowCatalystAggregationVersion";
}

/// Interaction pattern of an exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ExchangePattern {
    /// One-way, no reply is expected
    #[default]
    InOnly,
    /// Request/reply
    InOut,
}

/// A message body plus headers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub body: Value,
    #[serde(default)]
    pub headers: HashMap<String, Value>,
}

impl Message {
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }
}

/// Failure stored on an exchange.
///
/// Cheap to clone so the same failure can be held in the exception slot and
/// the exception-caught slot at once.
#[derive(Clone)]
pub struct ExchangeError(Arc<anyhow::Error>);

impl ExchangeError {
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(error.into()))
    }

    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// True if both handles point at the same underlying failure
    pub fn same_as(&self, other: &ExchangeError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl From<anyhow::Error> for ExchangeError {
    fn from(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

/// One message in flight through the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    id: String,
    pattern: ExchangePattern,
    created_at: DateTime<Utc>,
    #[serde(default)]
    from_route_id: Option<String>,
    #[serde(rename = "in")]
    in_message: Message,
    #[serde(rename = "out", default)]
    out_message: Option<Message>,
    #[serde(default)]
    properties: HashMap<String, Value>,
    /// Input as it was when the unit of work started
    #[serde(default)]
    original_in: Option<Message>,
    #[serde(skip)]
    exception: Option<ExchangeError>,
    #[serde(skip)]
    exception_caught: Option<ExchangeError>,
    #[serde(default)]
    failure_handled: bool,
    #[serde(default)]
    redelivery_exhausted: bool,
    #[serde(default)]
    rollback_only: bool,
    #[serde(default)]
    route_stop: bool,
    #[serde(default)]
    transacted: bool,
    #[serde(default)]
    error_handler_handled: Option<bool>,
    #[serde(skip)]
    done: bool,
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new(Value::Null)
    }
}

impl Exchange {
    /// Create an `InOnly` exchange with a fresh id
    pub fn new(body: impl Into<Value>) -> Self {
        Self::with_message(Message::new(body))
    }

    pub fn with_message(message: Message) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern: ExchangePattern::InOnly,
            created_at: Utc::now(),
            from_route_id: None,
            in_message: message,
            out_message: None,
            properties: HashMap::new(),
            original_in: None,
            exception: None,
            exception_caught: None,
            failure_handled: false,
            redelivery_exhausted: false,
            rollback_only: false,
            route_stop: false,
            transacted: false,
            error_handler_handled: None,
            done: false,
        }
    }

    pub fn with_pattern(mut self, pattern: ExchangePattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn from_route_id(&self) -> Option<&str> {
        self.from_route_id.as_deref()
    }

    pub fn set_from_route_id(&mut self, route_id: impl Into<String>) {
        self.from_route_id = Some(route_id.into());
    }

    pub fn in_message(&self) -> &Message {
        &self.in_message
    }

    pub fn in_message_mut(&mut self) -> &mut Message {
        &mut self.in_message
    }

    pub fn set_in_message(&mut self, message: Message) {
        self.in_message = message;
    }

    pub fn out_message(&self) -> Option<&Message> {
        self.out_message.as_ref()
    }

    pub fn set_out_message(&mut self, message: Option<Message>) {
        self.out_message = message;
    }

    /// The out message if a step produced one, otherwise the in message
    pub fn message(&self) -> &Message {
        self.out_message.as_ref().unwrap_or(&self.in_message)
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    /// Record the current in message as the unit-of-work original.
    /// Has no effect once an original has been captured.
    pub fn capture_original(&mut self) {
        if self.original_in.is_none() {
            self.original_in = Some(self.in_message.clone());
        }
    }

    pub fn original_in(&self) -> Option<&Message> {
        self.original_in.as_ref()
    }

    pub fn exception(&self) -> Option<&ExchangeError> {
        self.exception.as_ref()
    }

    pub fn set_exception(&mut self, error: Option<ExchangeError>) {
        self.exception = error;
    }

    pub fn take_exception(&mut self) -> Option<ExchangeError> {
        self.exception.take()
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    /// The failure the error handler caught, kept after the exception slot is cleared
    pub fn exception_caught(&self) -> Option<&ExchangeError> {
        self.exception_caught.as_ref()
    }

    pub fn set_exception_caught(&mut self, error: Option<ExchangeError>) {
        self.exception_caught = error;
    }

    pub fn is_failure_handled(&self) -> bool {
        self.failure_handled
    }

    pub fn set_failure_handled(&mut self, handled: bool) {
        self.failure_handled = handled;
    }

    pub fn is_redelivery_exhausted(&self) -> bool {
        self.redelivery_exhausted
    }

    pub fn set_redelivery_exhausted(&mut self, exhausted: bool) {
        self.redelivery_exhausted = exhausted;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    pub fn set_rollback_only(&mut self, rollback_only: bool) {
        self.rollback_only = rollback_only;
    }

    pub fn is_route_stop(&self) -> bool {
        self.route_stop
    }

    pub fn set_route_stop(&mut self, stop: bool) {
        self.route_stop = stop;
    }

    pub fn is_transacted(&self) -> bool {
        self.transacted
    }

    pub fn set_transacted(&mut self, transacted: bool) {
        self.transacted = transacted;
    }

    pub fn error_handler_handled(&self) -> Option<bool> {
        self.error_handler_handled
    }

    pub fn set_error_handler_handled(&mut self, handled: Option<bool>) {
        self.error_handler_handled = handled;
    }

    /// Mark the exchange as done. Returns `true` only for the first call.
    pub fn mark_done(&mut self) -> bool {
        !std::mem::replace(&mut self.done, true)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// A copy with a new id that shares nothing with this exchange
    pub fn correlated_copy(&self) -> Exchange {
        let mut copy = self.clone();
        copy.id = uuid::Uuid::new_v4().to_string();
        copy.done = false;
        copy
    }

    /// Redelivery counter from the in message headers, 0 when absent
    pub fn redelivery_counter(&self) -> u32 {
        self.in_message
            .header(headers::REDELIVERY_COUNTER)
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(0)
    }
}
