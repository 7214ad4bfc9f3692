//! ShutdownStrategy - graceful, ordered stop or suspend of routes
//!
//! Routes are walked in startup order (reversed by default). Each route's
//! services are told to prepare, its consumer stops taking new work, and the
//! strategy waits for inflight and pending exchanges to drain. Routes marked
//! [`ShutdownRoute::Defer`] keep consuming until every other route has
//! drained. If the timeout elapses first, remaining work is either forced
//! down or left running, depending on `shutdown_now_on_timeout`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fc_config::ShutdownSettings;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine_metrics;
use crate::route::{InflightRepository, Route, RouteStatus, ShutdownRoute, ShutdownRunningTask};
use crate::{MediationError, Result};

/// Implemented by components that take part in a graceful shutdown
#[async_trait]
pub trait ShutdownAware: Send + Sync {
    fn name(&self) -> String;

    /// Called before the owning route's consumer stops. `forced` is set when
    /// the strategy gave up waiting and is shutting down immediately.
    async fn prepare_shutdown(&self, suspend_only: bool, forced: bool);

    /// Exchanges held outside the inflight repository that must complete first
    async fn pending_exchanges(&self) -> usize {
        0
    }

    /// Keep running until other routes have drained
    fn defer_shutdown(&self, _task: ShutdownRunningTask) -> bool {
        false
    }

    /// The owning route was resumed after a suspend
    fn on_resume(&self) {}
}

/// Read side of the forced-shutdown signal
#[derive(Clone)]
pub struct ForcedShutdown {
    rx: watch::Receiver<bool>,
}

impl ForcedShutdown {
    pub fn is_forced(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a forced shutdown is signalled
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|forced| *forced).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Result of a shutdown or suspend run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownOutcome {
    /// Every route drained within the timeout
    pub completed: bool,
    pub timed_out: bool,
    /// Exchanges still inflight when the routes were forced down
    pub aborted_exchange_ids: Vec<String>,
}

pub struct ShutdownStrategy {
    timeout: RwLock<Duration>,
    shutdown_now_on_timeout: bool,
    shutdown_routes_in_reverse_order: bool,
    suppress_logging_on_timeout: bool,
    log_inflight_exchanges_on_timeout: bool,
    poll_interval: Duration,
    inflight: Arc<InflightRepository>,
    forced_tx: watch::Sender<bool>,
    timeout_occurred: AtomicBool,
}

impl ShutdownStrategy {
    pub fn new(inflight: Arc<InflightRepository>) -> Self {
        let (forced_tx, _) = watch::channel(false);
        Self {
            timeout: RwLock::new(Duration::from_secs(45)),
            shutdown_now_on_timeout: true,
            shutdown_routes_in_reverse_order: true,
            suppress_logging_on_timeout: false,
            log_inflight_exchanges_on_timeout: true,
            poll_interval: Duration::from_secs(1),
            inflight,
            forced_tx,
            timeout_occurred: AtomicBool::new(false),
        }
    }

    pub fn from_settings(settings: &ShutdownSettings, inflight: Arc<InflightRepository>) -> Result<Self> {
        let mut strategy = Self::new(inflight);
        strategy.set_timeout(Duration::from_millis(settings.timeout_ms))?;
        strategy.shutdown_now_on_timeout = settings.shutdown_now_on_timeout;
        strategy.shutdown_routes_in_reverse_order = settings.shutdown_routes_in_reverse_order;
        strategy.suppress_logging_on_timeout = settings.suppress_logging_on_timeout;
        strategy.log_inflight_exchanges_on_timeout = settings.log_inflight_exchanges_on_timeout;
        strategy.poll_interval = Duration::from_millis(settings.poll_interval_ms.max(1));
        Ok(strategy)
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.read()
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(MediationError::Config("shutdown timeout must be greater than zero".to_string()));
        }
        *self.timeout.write() = timeout;
        Ok(())
    }

    pub fn set_shutdown_now_on_timeout(&mut self, now: bool) {
        self.shutdown_now_on_timeout = now;
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval.max(Duration::from_millis(1));
    }

    pub fn set_shutdown_routes_in_reverse_order(&mut self, reverse: bool) {
        self.shutdown_routes_in_reverse_order = reverse;
    }

    pub fn forced_signal(&self) -> ForcedShutdown {
        ForcedShutdown {
            rx: self.forced_tx.subscribe(),
        }
    }

    pub fn is_forced(&self) -> bool {
        *self.forced_tx.borrow()
    }

    /// True if the last run hit its timeout
    pub fn timeout_occurred(&self) -> bool {
        self.timeout_occurred.load(Ordering::SeqCst)
    }

    /// Clear the forced flag before routes are started again
    pub fn reset(&self) {
        self.forced_tx.send_replace(false);
        self.timeout_occurred.store(false, Ordering::SeqCst);
    }

    pub async fn shutdown(&self, routes: &[Arc<Route>]) -> ShutdownOutcome {
        let timeout = self.timeout();
        self.run(routes, false, timeout).await
    }

    pub async fn shutdown_with_timeout(&self, routes: &[Arc<Route>], timeout: Duration) -> Result<ShutdownOutcome> {
        if timeout.is_zero() {
            return Err(MediationError::Config("shutdown timeout must be greater than zero".to_string()));
        }
        Ok(self.run(routes, false, timeout).await)
    }

    pub async fn suspend(&self, routes: &[Arc<Route>]) -> ShutdownOutcome {
        let timeout = self.timeout();
        self.run(routes, true, timeout).await
    }

    /// Stop immediately without waiting for inflight exchanges
    pub async fn shutdown_forced(&self, routes: &[Arc<Route>]) -> ShutdownOutcome {
        let ordered = self.ordered(routes);
        warn!(routes = ordered.len(), "Forcing shutdown of routes now");
        let aborted = self.inflight_ids(&ordered);
        self.force(&ordered, false).await;
        self.finish(&ordered, false).await;
        ShutdownOutcome {
            completed: aborted.is_empty(),
            timed_out: false,
            aborted_exchange_ids: aborted,
        }
    }

    fn ordered(&self, routes: &[Arc<Route>]) -> Vec<Arc<Route>> {
        let mut ordered = routes.to_vec();
        ordered.sort_by_key(|r| r.startup_order());
        if self.shutdown_routes_in_reverse_order {
            ordered.reverse();
        }
        ordered
    }

    async fn run(&self, routes: &[Arc<Route>], suspend_only: bool, timeout: Duration) -> ShutdownOutcome {
        let started = Instant::now();
        let deadline = started + timeout;
        let action = if suspend_only { "suspend" } else { "shutdown" };
        self.timeout_occurred.store(false, Ordering::SeqCst);

        let ordered = self.ordered(routes);
        if ordered.is_empty() {
            return ShutdownOutcome {
                completed: true,
                ..Default::default()
            };
        }
        info!(
            routes = ordered.len(),
            timeout_secs = timeout.as_secs(),
            "Starting to graceful {} routes",
            action
        );

        let (deferred, immediate): (Vec<Arc<Route>>, Vec<Arc<Route>>) = ordered
            .iter()
            .cloned()
            .partition(|r| self.is_deferred(r));

        for route in &immediate {
            self.stop_intake(route, suspend_only).await;
        }
        let mut drained = self.await_drain(&immediate, deadline).await;

        if drained && !deferred.is_empty() {
            debug!(routes = deferred.len(), "Stopping deferred routes");
            for route in &deferred {
                self.stop_intake(route, suspend_only).await;
            }
            drained = self.await_drain(&deferred, deadline).await;
        }

        let mut aborted = Vec::new();
        if !drained {
            self.timeout_occurred.store(true, Ordering::SeqCst);
            let inflight = self.inflight_ids(&ordered);
            if self.log_inflight_exchanges_on_timeout && !self.suppress_logging_on_timeout {
                self.log_inflight(&ordered);
            }
            if self.shutdown_now_on_timeout {
                if !self.suppress_logging_on_timeout {
                    warn!(
                        timeout_secs = timeout.as_secs(),
                        inflight = inflight.len(),
                        "Timeout occurred during graceful {}. Forcing the routes to be shut down now",
                        action
                    );
                }
                self.force(&ordered, suspend_only).await;
                aborted = inflight;
            } else if !self.suppress_logging_on_timeout {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    inflight = inflight.len(),
                    "Timeout occurred during graceful {}. Remaining exchanges are left running",
                    action
                );
            }
        }

        self.finish(&ordered, suspend_only).await;

        let elapsed = started.elapsed();
        engine_metrics::record_shutdown(elapsed, !drained);
        info!(
            routes = ordered.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            timed_out = !drained,
            "Graceful {} of routes completed",
            action
        );

        ShutdownOutcome {
            completed: drained,
            timed_out: !drained,
            aborted_exchange_ids: aborted,
        }
    }

    fn is_deferred(&self, route: &Route) -> bool {
        route.shutdown_route() == ShutdownRoute::Defer
            || route.consumer().defer_shutdown(route.shutdown_running_task())
    }

    /// Prepare the route's services and stop (or suspend) its consumer
    async fn stop_intake(&self, route: &Route, suspend_only: bool) {
        for service in route.services() {
            service.prepare_shutdown(suspend_only, false).await;
        }
        let consumer = route.consumer();
        consumer.prepare_shutdown(suspend_only, false).await;

        let result = if suspend_only && consumer.is_suspendable() {
            consumer.suspend().await
        } else {
            consumer.stop().await
        };
        if let Err(e) = result {
            warn!(route_id = %route.id(), error = %e, "Error stopping route consumer, continuing");
        }
    }

    async fn pending_for(&self, route: &Route) -> usize {
        let mut pending = self.inflight.route_count(route.id());
        if route.shutdown_running_task() == ShutdownRunningTask::CompleteAllTasks {
            pending += route.consumer().pending_exchanges().await;
        }
        for service in route.services() {
            pending += service.pending_exchanges().await;
        }
        pending
    }

    /// Poll until every route has no inflight or pending exchanges, or the deadline passes
    async fn await_drain(&self, routes: &[Arc<Route>], deadline: Instant) -> bool {
        loop {
            let mut total = 0;
            let mut waiting = Vec::new();
            for route in routes {
                let pending = self.pending_for(route).await;
                if pending > 0 {
                    waiting.push(format!("{}={}", route.id(), pending));
                    total += pending;
                }
            }
            if total == 0 {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = deadline - now;
            info!(
                pending = total,
                routes = %waiting.join(", "),
                remaining_secs = remaining.as_secs(),
                "Waiting as there are still inflight and pending exchanges to complete"
            );
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    async fn force(&self, routes: &[Arc<Route>], suspend_only: bool) {
        self.forced_tx.send_replace(true);
        for route in routes {
            for service in route.services() {
                service.prepare_shutdown(suspend_only, true).await;
            }
            let consumer = route.consumer();
            consumer.prepare_shutdown(suspend_only, true).await;
            if let Err(e) = consumer.stop().await {
                warn!(route_id = %route.id(), error = %e, "Error forcing route consumer to stop");
            }
        }
    }

    async fn finish(&self, routes: &[Arc<Route>], suspend_only: bool) {
        for route in routes {
            route.pipeline().set_accepting(false);
            if suspend_only {
                route.set_status(RouteStatus::Suspended);
                continue;
            }
            for service in route.services() {
                if let Err(e) = service.stop().await {
                    warn!(route_id = %route.id(), service = %service.name(), error = %e, "Error stopping route service");
                }
            }
            route.set_status(RouteStatus::Stopped);
            info!(route_id = %route.id(), "Route shutdown complete");
        }
    }

    fn inflight_ids(&self, routes: &[Arc<Route>]) -> Vec<String> {
        routes
            .iter()
            .flat_map(|r| self.inflight.exchange_ids_for_route(r.id()))
            .collect()
    }

    fn log_inflight(&self, routes: &[Arc<Route>]) {
        for route in routes {
            for entry in self.inflight.browse_route(route.id()) {
                warn!(
                    route_id = %entry.route_id,
                    exchange_id = %entry.exchange_id,
                    duration_ms = entry.duration().as_millis() as u64,
                    "Inflight exchange at shutdown timeout"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_rejected() {
        let strategy = ShutdownStrategy::new(Arc::new(InflightRepository::new()));
        assert!(strategy.set_timeout(Duration::ZERO).is_err());
        assert_eq!(strategy.timeout(), Duration::from_secs(45));
        strategy.set_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(strategy.timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_forced_signal() {
        let strategy = ShutdownStrategy::new(Arc::new(InflightRepository::new()));
        let signal = strategy.forced_signal();
        assert!(!signal.is_forced());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });
        strategy.forced_tx.send_replace(true);
        waiter.await.unwrap();
        assert!(signal.is_forced());

        strategy.reset();
        assert!(!signal.is_forced());
    }

    #[tokio::test]
    async fn test_empty_route_list_completes() {
        let strategy = ShutdownStrategy::new(Arc::new(InflightRepository::new()));
        let outcome = strategy.shutdown(&[]).await;
        assert!(outcome.completed);
        assert!(!strategy.timeout_occurred());
    }
}
