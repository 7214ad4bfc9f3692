//! Lifecycle Manager - Background tasks for a running mediation context
//!
//! Handles:
//! - Inflight stall monitoring
//! - Thread pool statistics reporting
//! - Ad-hoc periodic tasks registered by the context

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::engine_metrics;
use crate::executor::ExecutorManager;
use crate::route::InflightRepository;

/// Configuration for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Interval for inflight stall checks
    pub inflight_stall_check_interval: Duration,
    /// Exchanges inflight for longer than this are reported
    pub inflight_stall_threshold: Duration,
    /// Interval for thread pool statistics
    pub pool_stats_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            inflight_stall_check_interval: Duration::from_secs(60),
            inflight_stall_threshold: Duration::from_secs(300),
            pool_stats_interval: Duration::from_secs(30),
        }
    }
}

/// Owns the context's background tasks and stops them together
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
}

impl LifecycleManager {
    /// Start all lifecycle tasks
    pub fn start(
        inflight: Arc<InflightRepository>,
        executor_manager: Arc<ExecutorManager>,
        config: LifecycleConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let lifecycle = Self { shutdown_tx };

        // Inflight stall monitor
        {
            let threshold = config.inflight_stall_threshold;
            lifecycle.spawn_periodic("inflight-stall-monitor", config.inflight_stall_check_interval, move || {
                let inflight = inflight.clone();
                async move {
                    let stalled = inflight.stalled(threshold);
                    for entry in &stalled {
                        warn!(
                            route_id = %entry.route_id,
                            exchange_id = %entry.exchange_id,
                            inflight_secs = entry.duration().as_secs(),
                            "Exchange has been inflight longer than the stall threshold"
                        );
                    }
                    if stalled.is_empty() {
                        debug!(inflight = inflight.size(), "Inflight check: OK");
                    }
                }
            });
        }

        // Thread pool statistics
        {
            lifecycle.spawn_periodic("pool-stats", config.pool_stats_interval, move || {
                let executor_manager = executor_manager.clone();
                async move {
                    for pool in executor_manager.pools() {
                        let stats = pool.stats();
                        engine_metrics::set_pool_queue_size(&stats.id, stats.queued);
                        engine_metrics::set_pool_active_workers(&stats.id, stats.active);
                        debug!(
                            pool = %stats.id,
                            workers = stats.current_workers,
                            active = stats.active,
                            queued = stats.queued,
                            delayed = stats.delayed,
                            completed = stats.completed,
                            rejected = stats.rejected,
                            "Thread pool stats"
                        );
                    }
                }
            });
        }

        info!("Lifecycle manager started with all background tasks");
        lifecycle
    }

    /// Run `task` every `interval` until the lifecycle manager shuts down
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, interval: Duration, task: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        task().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!(task = name, "Background task shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Signal shutdown to all lifecycle tasks
    pub async fn shutdown(&self) {
        info!("Lifecycle manager shutting down...");
        let _ = self.shutdown_tx.send(());
    }

    /// Get the shutdown sender for spawning additional tasks
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_config() {
        let config = LifecycleConfig::default();
        assert_eq!(config.inflight_stall_check_interval, Duration::from_secs(60));
        assert_eq!(config.inflight_stall_threshold, Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_stops_on_shutdown() {
        let lifecycle = LifecycleManager {
            shutdown_tx: broadcast::channel(1).0,
        };
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        lifecycle.spawn_periodic("test", Duration::from_millis(100), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        let before = ticks.load(Ordering::SeqCst);
        assert!(before >= 3);

        lifecycle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(ticks.load(Ordering::SeqCst) <= before + 1);
    }
}
