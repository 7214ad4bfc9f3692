//! Pipeline - runs an exchange through a route's error-handled steps

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fc_common::Exchange;
use tracing::{debug, Instrument};

use super::inflight::InflightRepository;
use super::ShutdownRunningTask;
use crate::error_handler::ErrorHandler;
use crate::{MediationError, Result};

pub struct Pipeline {
    route_id: String,
    steps: Vec<Arc<ErrorHandler>>,
    inflight: Arc<InflightRepository>,
    accepting: AtomicBool,
    shutdown_running_task: ShutdownRunningTask,
}

impl Pipeline {
    pub(crate) fn new(
        route_id: &str,
        steps: Vec<Arc<ErrorHandler>>,
        inflight: Arc<InflightRepository>,
        shutdown_running_task: ShutdownRunningTask,
    ) -> Self {
        Self {
            route_id: route_id.to_string(),
            steps,
            inflight,
            accepting: AtomicBool::new(false),
            shutdown_running_task,
        }
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn steps(&self) -> &[Arc<ErrorHandler>] {
        &self.steps
    }

    pub fn shutdown_running_task(&self) -> ShutdownRunningTask {
        self.shutdown_running_task
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub(crate) fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Run `exchange` through every step. Stops early once the exchange fails,
    /// an error handler dealt with a failure, or a step asks the route to stop.
    /// The returned exchange is done.
    pub async fn process(&self, mut exchange: Exchange) -> Result<Exchange> {
        if !self.is_accepting() {
            return Err(MediationError::NotAccepting(self.route_id.clone()));
        }

        exchange.set_from_route_id(self.route_id.clone());
        exchange.capture_original();
        let _inflight = self.inflight.add(&self.route_id, exchange.id());
        let span = tracing::debug_span!("route", route_id = %self.route_id, exchange_id = %exchange.id());

        async move {
            for step in &self.steps {
                exchange = step.process(exchange).await?;
                let failure_dealt_with = exchange.is_failure_handled() || exchange.error_handler_handled().is_some();
                if exchange.is_failed() || failure_dealt_with || exchange.is_route_stop() {
                    debug!(
                        failed = exchange.is_failed(),
                        failure_dealt_with,
                        route_stop = exchange.is_route_stop(),
                        "Pipeline stopped early"
                    );
                    break;
                }
            }
            exchange.mark_done();
            Ok(exchange)
        }
        .instrument(span)
        .await
    }
}
