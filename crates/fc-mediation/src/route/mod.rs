//! Routes: a consumer feeding a pipeline of error-handled steps

mod consumer;
mod inflight;
mod pipeline;

use std::sync::Arc;

use async_trait::async_trait;
use fc_common::Exchange;
use parking_lot::RwLock;
use tracing::info;

use crate::aggregation::Aggregator;
use crate::context::MediationContext;
use crate::error_handler::{ErrorHandler, ErrorHandlerBuilder};
use crate::processor::{Processor, Producer};
use crate::shutdown::ShutdownAware;
use crate::{MediationError, Result};

pub use consumer::{Consumer, InMemoryQueueConsumer};
pub use inflight::{InflightExchange, InflightGuard, InflightRepository};
pub use pipeline::Pipeline;

/// Whether a route stops with the others or after them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownRoute {
    #[default]
    Default,
    Defer,
}

/// What a stopping route still completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownRunningTask {
    /// Inflight exchanges only, buffered ones are discarded
    #[default]
    CompleteCurrentTaskOnly,
    /// Inflight exchanges and everything the consumer has buffered
    CompleteAllTasks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Stopped,
    Started,
    Suspended,
}

/// A stateful component owned by a route, started and stopped with it
#[async_trait]
pub trait RouteService: ShutdownAware {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RouteService for ErrorHandler {
    async fn start(&self) -> Result<()> {
        self.mark_started();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.mark_stopped();
        Ok(())
    }
}

/// Sends the exchange to a producer using the exchange's own pattern
struct SendProcessor {
    producer: Arc<dyn Producer>,
}

#[async_trait]
impl Processor for SendProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let pattern = exchange.pattern();
        self.producer.send(exchange, pattern).await
    }
}

enum Step {
    Process(Arc<dyn Processor>),
    To(String),
    Aggregate(Arc<Aggregator>),
}

/// Describes a route, turned into a [`Route`] by [`MediationContext::add_route`]
pub struct RouteBuilder {
    id: String,
    startup_order: Option<i32>,
    consumer: Option<Arc<dyn Consumer>>,
    error_handler: Option<ErrorHandlerBuilder>,
    error_handler_ref: Option<String>,
    steps: Vec<Step>,
    services: Vec<Arc<dyn RouteService>>,
    shutdown_route: ShutdownRoute,
    shutdown_running_task: ShutdownRunningTask,
}

impl RouteBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            startup_order: None,
            consumer: None,
            error_handler: None,
            error_handler_ref: None,
            steps: Vec::new(),
            services: Vec::new(),
            shutdown_route: ShutdownRoute::Default,
            shutdown_running_task: ShutdownRunningTask::CompleteCurrentTaskOnly,
        }
    }

    pub fn from(mut self, consumer: Arc<dyn Consumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn error_handler(mut self, builder: ErrorHandlerBuilder) -> Self {
        self.error_handler = Some(builder);
        self
    }

    /// Error handler bound in the registry under `id`
    pub fn error_handler_ref(mut self, id: &str) -> Self {
        self.error_handler_ref = Some(id.to_string());
        self
    }

    pub fn process(mut self, processor: Arc<dyn Processor>) -> Self {
        self.steps.push(Step::Process(processor));
        self
    }

    /// Send to the endpoint registered under `uri`
    pub fn to(mut self, uri: &str) -> Self {
        self.steps.push(Step::To(uri.to_string()));
        self
    }

    pub fn aggregate(mut self, aggregator: Arc<Aggregator>) -> Self {
        self.steps.push(Step::Aggregate(aggregator));
        self
    }

    pub fn service(mut self, service: Arc<dyn RouteService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn startup_order(mut self, order: i32) -> Self {
        self.startup_order = Some(order);
        self
    }

    pub fn shutdown_route(mut self, shutdown_route: ShutdownRoute) -> Self {
        self.shutdown_route = shutdown_route;
        self
    }

    pub fn shutdown_running_task(mut self, task: ShutdownRunningTask) -> Self {
        self.shutdown_running_task = task;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn build(self, context: &MediationContext, default_order: i32) -> Result<Route> {
        let consumer = self
            .consumer
            .ok_or_else(|| MediationError::Config(format!("route {} has no consumer", self.id)))?;
        if self.steps.is_empty() {
            return Err(MediationError::Config(format!("route {} has no steps", self.id)));
        }

        let error_handler = match (self.error_handler, &self.error_handler_ref) {
            (Some(builder), _) => builder,
            (None, Some(id)) => context.registry().lookup_error_handler(id)?,
            (None, None) => context.default_error_handler(),
        };

        let mut services: Vec<Arc<dyn RouteService>> = Vec::new();
        let mut handlers = Vec::with_capacity(self.steps.len());
        for step in self.steps {
            let processor: Arc<dyn Processor> = match step {
                Step::Process(processor) => processor,
                Step::To(uri) => Arc::new(SendProcessor {
                    producer: context.registry().lookup_endpoint(&uri)?,
                }),
                Step::Aggregate(aggregator) => {
                    aggregator.bind_endpoints(context.registry())?;
                    services.push(aggregator.clone());
                    aggregator
                }
            };
            let handler = error_handler.build(context, &self.id, processor)?;
            services.push(handler.clone());
            handlers.push(handler);
        }
        services.extend(self.services);

        let pipeline = Arc::new(Pipeline::new(
            &self.id,
            handlers,
            context.inflight_repository().clone(),
            self.shutdown_running_task,
        ));

        Ok(Route {
            id: self.id,
            startup_order: self.startup_order.unwrap_or(default_order),
            consumer,
            pipeline,
            services,
            shutdown_route: self.shutdown_route,
            shutdown_running_task: self.shutdown_running_task,
            status: RwLock::new(RouteStatus::Stopped),
        })
    }
}

pub struct Route {
    id: String,
    startup_order: i32,
    consumer: Arc<dyn Consumer>,
    pipeline: Arc<Pipeline>,
    services: Vec<Arc<dyn RouteService>>,
    shutdown_route: ShutdownRoute,
    shutdown_running_task: ShutdownRunningTask,
    status: RwLock<RouteStatus>,
}

impl Route {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn startup_order(&self) -> i32 {
        self.startup_order
    }

    pub fn consumer(&self) -> &Arc<dyn Consumer> {
        &self.consumer
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn services(&self) -> &[Arc<dyn RouteService>] {
        &self.services
    }

    pub fn error_handlers(&self) -> &[Arc<ErrorHandler>] {
        self.pipeline.steps()
    }

    pub fn shutdown_route(&self) -> ShutdownRoute {
        self.shutdown_route
    }

    pub fn shutdown_running_task(&self) -> ShutdownRunningTask {
        self.shutdown_running_task
    }

    pub fn status(&self) -> RouteStatus {
        *self.status.read()
    }

    pub(crate) fn set_status(&self, status: RouteStatus) {
        *self.status.write() = status;
    }

    pub(crate) async fn start(&self) -> Result<()> {
        for service in &self.services {
            service.start().await?;
        }
        self.pipeline.set_accepting(true);
        self.consumer.start(self.pipeline.clone()).await?;
        self.set_status(RouteStatus::Started);
        info!(route_id = %self.id, steps = self.pipeline.steps().len(), "Route started");
        Ok(())
    }

    pub(crate) async fn resume(&self) -> Result<()> {
        for service in &self.services {
            service.on_resume();
        }
        self.pipeline.set_accepting(true);
        if self.consumer.is_suspendable() {
            self.consumer.resume().await?;
        } else {
            self.consumer.start(self.pipeline.clone()).await?;
        }
        self.set_status(RouteStatus::Started);
        info!(route_id = %self.id, "Route resumed");
        Ok(())
    }
}
