//! MediationContext - owns routes, shared services and their lifecycle
//!
//! The context is built once from a [`MediationConfig`] and passed down
//! explicitly; nothing here is global. It supplies the default redelivery
//! policy and error handler, the registry, the executor manager, the
//! shutdown strategy and a clock, and broadcasts lifecycle events.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fc_common::Exchange;
use fc_config::MediationConfig;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::error_handler::ErrorHandlerBuilder;
use crate::executor::{ExecutorManager, ThreadPool};
use crate::lifecycle::{LifecycleConfig, LifecycleManager};
use crate::redelivery::RedeliveryPolicy;
use crate::registry::Registry;
use crate::route::{InflightRepository, Route, RouteBuilder, RouteStatus};
use crate::shutdown::{ShutdownOutcome, ShutdownStrategy};
use crate::{MediationError, Result};

/// Time source
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn instant(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    Starting,
    Started,
    Stopping,
    Stopped,
    RouteStarted(String),
    RouteStopped(String),
    RouteSuspended(String),
    RouteResumed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
}

pub struct MediationContext {
    name: String,
    clock: Arc<dyn Clock>,
    registry: Arc<Registry>,
    executor_manager: Arc<ExecutorManager>,
    inflight: Arc<InflightRepository>,
    shutdown_strategy: Arc<ShutdownStrategy>,
    default_policy: RedeliveryPolicy,
    default_error_handler: RwLock<ErrorHandlerBuilder>,
    error_handler_executor: Mutex<Option<Arc<ThreadPool>>>,
    routes: RwLock<Vec<Arc<Route>>>,
    status: RwLock<ContextStatus>,
    events: broadcast::Sender<ContextEvent>,
    lifecycle_config: LifecycleConfig,
    lifecycle: Mutex<Option<LifecycleManager>>,
}

impl MediationContext {
    /// Context with default configuration
    pub fn new(name: &str) -> Result<Self> {
        let mut config = MediationConfig::default();
        config.context.name = name.to_string();
        Self::from_config(&config)
    }

    pub fn from_config(config: &MediationConfig) -> Result<Self> {
        config.validate()?;
        let name = config.context.name.clone();
        let registry = Arc::new(Registry::new());
        let executor_manager = Arc::new(ExecutorManager::from_settings(
            &name,
            &config.context.thread_name_pattern,
            &config.thread_pools,
            registry.clone(),
        )?);
        let inflight = Arc::new(InflightRepository::new());
        let shutdown_strategy = Arc::new(ShutdownStrategy::from_settings(&config.shutdown, inflight.clone())?);
        let default_policy = RedeliveryPolicy::from_settings(&config.redelivery)?;
        let default_error_handler = ErrorHandlerBuilder::from_settings(&config.redelivery, &config.dead_letter)?;
        let (events, _) = broadcast::channel(64);

        let lifecycle_config = LifecycleConfig {
            inflight_stall_check_interval: Duration::from_secs(config.context.inflight_stall_check_interval_secs.max(1)),
            inflight_stall_threshold: Duration::from_secs(config.context.inflight_stall_threshold_secs),
            ..LifecycleConfig::default()
        };

        info!(
            context = %name,
            maximum_redeliveries = default_policy.maximum_redeliveries,
            dead_letter_uri = ?config.dead_letter.dead_letter_uri,
            shutdown_timeout_ms = config.shutdown.timeout_ms,
            "Created mediation context"
        );

        Ok(Self {
            name,
            clock: Arc::new(SystemClock),
            registry,
            executor_manager,
            inflight,
            shutdown_strategy,
            default_policy,
            default_error_handler: RwLock::new(default_error_handler),
            error_handler_executor: Mutex::new(None),
            routes: RwLock::new(Vec::new()),
            status: RwLock::new(ContextStatus::Created),
            events,
            lifecycle_config,
            lifecycle: Mutex::new(None),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn executor_manager(&self) -> &Arc<ExecutorManager> {
        &self.executor_manager
    }

    pub fn inflight_repository(&self) -> &Arc<InflightRepository> {
        &self.inflight
    }

    pub fn shutdown_strategy(&self) -> &Arc<ShutdownStrategy> {
        &self.shutdown_strategy
    }

    pub fn default_redelivery_policy(&self) -> &RedeliveryPolicy {
        &self.default_policy
    }

    /// Error handler used by routes that do not configure their own
    pub fn default_error_handler(&self) -> ErrorHandlerBuilder {
        self.default_error_handler.read().clone()
    }

    pub fn set_default_error_handler(&self, builder: ErrorHandlerBuilder) {
        *self.default_error_handler.write() = builder;
    }

    /// Shared pool for asynchronous redelivery delays, created on first use
    pub fn error_handler_executor(&self) -> Result<Arc<ThreadPool>> {
        let mut slot = self.error_handler_executor.lock();
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }
        let pool = self
            .executor_manager
            .new_scheduled_thread_pool("ErrorHandler", "ErrorHandlerRedeliveryTask", None)?;
        *slot = Some(pool.clone());
        Ok(pool)
    }

    pub fn status(&self) -> ContextStatus {
        *self.status.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ContextEvent) {
        let _ = self.events.send(event);
    }

    /// Build a route. It starts right away when the context is already started.
    pub async fn add_route(&self, builder: RouteBuilder) -> Result<Arc<Route>> {
        if self.routes.read().iter().any(|r| r.id() == builder.id()) {
            return Err(MediationError::Config(format!("route {} already exists", builder.id())));
        }
        let default_order = self.routes.read().len() as i32 + 1000;
        let route = Arc::new(builder.build(self, default_order)?);
        self.routes.write().push(route.clone());

        if self.status() == ContextStatus::Started {
            route.start().await?;
            self.emit(ContextEvent::RouteStarted(route.id().to_string()));
        }
        Ok(route)
    }

    pub fn route(&self, route_id: &str) -> Result<Arc<Route>> {
        self.routes
            .read()
            .iter()
            .find(|r| r.id() == route_id)
            .cloned()
            .ok_or_else(|| MediationError::RouteNotFound(route_id.to_string()))
    }

    /// Routes in startup order
    pub fn routes(&self) -> Vec<Arc<Route>> {
        let mut routes = self.routes.read().clone();
        routes.sort_by_key(|r| r.startup_order());
        routes
    }

    /// Run an exchange straight through a route's pipeline, bypassing its consumer
    pub async fn request(&self, route_id: &str, exchange: Exchange) -> Result<Exchange> {
        let route = self.route(route_id)?;
        route.pipeline().process(exchange).await
    }

    pub async fn start(&self) -> Result<()> {
        match self.status() {
            ContextStatus::Started | ContextStatus::Starting => return Ok(()),
            ContextStatus::Stopping | ContextStatus::Stopped => {
                return Err(MediationError::Config(format!(
                    "context {} has been stopped and cannot be restarted",
                    self.name
                )))
            }
            ContextStatus::Created => {}
        }

        let started = self.clock.instant();
        *self.status.write() = ContextStatus::Starting;
        self.emit(ContextEvent::Starting);
        self.shutdown_strategy.reset();

        for route in self.routes() {
            if let Err(e) = route.start().await {
                error!(route_id = %route.id(), error = %e, "Failed to start route");
                *self.status.write() = ContextStatus::Created;
                return Err(e);
            }
            self.emit(ContextEvent::RouteStarted(route.id().to_string()));
        }

        *self.lifecycle.lock() = Some(LifecycleManager::start(
            self.inflight.clone(),
            self.executor_manager.clone(),
            self.lifecycle_config.clone(),
        ));

        *self.status.write() = ContextStatus::Started;
        self.emit(ContextEvent::Started);
        info!(
            context = %self.name,
            routes = self.routes.read().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Mediation context started"
        );
        Ok(())
    }

    /// Gracefully stop every route, then shut down thread pools and background tasks
    pub async fn stop(&self) -> Result<ShutdownOutcome> {
        if matches!(self.status(), ContextStatus::Stopped | ContextStatus::Stopping) {
            return Ok(ShutdownOutcome {
                completed: true,
                ..Default::default()
            });
        }
        *self.status.write() = ContextStatus::Stopping;
        self.emit(ContextEvent::Stopping);
        info!(context = %self.name, "Mediation context is shutting down");

        let routes: Vec<Arc<Route>> = self
            .routes()
            .into_iter()
            .filter(|r| r.status() != RouteStatus::Stopped)
            .collect();
        let outcome = self.shutdown_strategy.shutdown(&routes).await;
        for route in &routes {
            self.emit(ContextEvent::RouteStopped(route.id().to_string()));
        }
        if outcome.timed_out && !outcome.aborted_exchange_ids.is_empty() {
            warn!(
                aborted = outcome.aborted_exchange_ids.len(),
                "Exchanges were aborted by the forced shutdown"
            );
        }

        self.executor_manager.shutdown_all().await;
        self.error_handler_executor.lock().take();

        let lifecycle = self.lifecycle.lock().take();
        if let Some(lifecycle) = lifecycle {
            lifecycle.shutdown().await;
        }

        *self.status.write() = ContextStatus::Stopped;
        self.emit(ContextEvent::Stopped);
        info!(context = %self.name, completed = outcome.completed, "Mediation context stopped");
        Ok(outcome)
    }

    /// Stop without waiting for inflight exchanges
    pub async fn stop_forced(&self) -> Result<ShutdownOutcome> {
        let routes = self.routes();
        let outcome = self.shutdown_strategy.shutdown_forced(&routes).await;
        let graceful = self.stop().await?;
        Ok(ShutdownOutcome {
            completed: outcome.completed && graceful.completed,
            timed_out: graceful.timed_out,
            aborted_exchange_ids: outcome.aborted_exchange_ids,
        })
    }

    pub async fn start_route(&self, route_id: &str) -> Result<()> {
        let route = self.route(route_id)?;
        match route.status() {
            RouteStatus::Started => Ok(()),
            RouteStatus::Suspended => self.resume_route(route_id).await,
            RouteStatus::Stopped => {
                self.shutdown_strategy.reset();
                route.start().await?;
                self.emit(ContextEvent::RouteStarted(route_id.to_string()));
                Ok(())
            }
        }
    }

    pub async fn stop_route(&self, route_id: &str) -> Result<ShutdownOutcome> {
        let route = self.route(route_id)?;
        let outcome = self.shutdown_strategy.shutdown(&[route]).await;
        self.emit(ContextEvent::RouteStopped(route_id.to_string()));
        Ok(outcome)
    }

    pub async fn stop_route_with_timeout(&self, route_id: &str, timeout: Duration) -> Result<ShutdownOutcome> {
        let route = self.route(route_id)?;
        let outcome = self.shutdown_strategy.shutdown_with_timeout(&[route], timeout).await?;
        self.emit(ContextEvent::RouteStopped(route_id.to_string()));
        Ok(outcome)
    }

    pub async fn suspend_route(&self, route_id: &str) -> Result<ShutdownOutcome> {
        let route = self.route(route_id)?;
        let outcome = self.shutdown_strategy.suspend(&[route]).await;
        self.emit(ContextEvent::RouteSuspended(route_id.to_string()));
        Ok(outcome)
    }

    pub async fn resume_route(&self, route_id: &str) -> Result<()> {
        let route = self.route(route_id)?;
        if route.status() != RouteStatus::Suspended {
            return Err(MediationError::Config(format!("route {} is not suspended", route_id)));
        }
        self.shutdown_strategy.reset();
        route.resume().await?;
        self.emit(ContextEvent::RouteResumed(route_id.to_string()));
        Ok(())
    }
}
