//! ExecutorManager - creates, names, tracks and shuts down thread pools

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fc_config::ThreadPoolsSettings;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::naming::ThreadNamer;
use super::pool::ThreadPool;
use super::profile::{PoolSettings, ThreadPoolProfile};
use crate::registry::Registry;
use crate::Result;

/// Creates thread pools from profiles and owns their shutdown
pub struct ExecutorManager {
    context_name: String,
    namer: Arc<ThreadNamer>,
    registry: Arc<Registry>,
    default_profile: RwLock<ThreadPoolProfile>,
    pools: DashMap<String, Arc<ThreadPool>>,
    pool_counter: AtomicU64,
    /// How often progress is logged while awaiting termination
    await_termination_log_interval: Duration,
    /// Grace period for each pool during `shutdown_all`
    shutdown_await_termination: Duration,
}

impl ExecutorManager {
    pub fn new(context_name: &str, thread_name_pattern: &str, registry: Arc<Registry>) -> Result<Self> {
        Ok(Self {
            context_name: context_name.to_string(),
            namer: Arc::new(ThreadNamer::new(thread_name_pattern, context_name)?),
            registry,
            default_profile: RwLock::new(ThreadPoolProfile::built_in_default()),
            pools: DashMap::new(),
            pool_counter: AtomicU64::new(0),
            await_termination_log_interval: Duration::from_secs(2),
            shutdown_await_termination: Duration::from_secs(10),
        })
    }

    /// Build from configuration, registering every named profile in the registry
    pub fn from_settings(
        context_name: &str,
        thread_name_pattern: &str,
        settings: &ThreadPoolsSettings,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let mut manager = Self::new(context_name, thread_name_pattern, registry)?;
        manager.await_termination_log_interval =
            Duration::from_millis(settings.await_termination_log_interval_ms.max(1));
        manager.shutdown_await_termination = Duration::from_millis(settings.shutdown_await_termination_ms);

        let mut default = ThreadPoolProfile::from_settings(&settings.default)?
            .merged_over(&ThreadPoolProfile::built_in_default());
        default.default_profile = true;
        manager.set_default_profile(default)?;

        for profile in &settings.profiles {
            manager.register_profile(ThreadPoolProfile::from_settings(profile)?);
        }
        Ok(manager)
    }

    pub fn context_name(&self) -> &str {
        &self.context_name
    }

    pub fn thread_name_pattern(&self) -> &str {
        self.namer.pattern()
    }

    pub fn default_profile(&self) -> ThreadPoolProfile {
        self.default_profile.read().clone()
    }

    /// Replace the default profile. Fields left unset fall back to the built-in defaults.
    pub fn set_default_profile(&self, profile: ThreadPoolProfile) -> Result<()> {
        let mut profile = profile.merged_over(&ThreadPoolProfile::built_in_default());
        profile.default_profile = true;
        profile.resolve(&ThreadPoolProfile::built_in_default())?;
        info!(profile = %profile.id, "Using default thread pool profile");
        *self.default_profile.write() = profile;
        Ok(())
    }

    pub fn register_profile(&self, profile: ThreadPoolProfile) {
        debug!(profile = %profile.id, "Registered thread pool profile");
        self.registry.bind_profile(profile);
    }

    pub fn set_await_termination_log_interval(&mut self, interval: Duration) {
        self.await_termination_log_interval = interval;
    }

    pub fn set_shutdown_await_termination(&mut self, timeout: Duration) {
        self.shutdown_await_termination = timeout;
    }

    /// Resolve a profile id. The default profile id resolves to the default profile.
    pub fn resolve_profile(&self, profile_id: &str) -> Result<ThreadPoolProfile> {
        let default = self.default_profile.read();
        if profile_id == default.id {
            return Ok(default.clone());
        }
        self.registry.lookup_profile(profile_id)
    }

    /// Pool from a named profile
    pub fn new_thread_pool(&self, source: &str, name: &str, profile_id: &str) -> Result<Arc<ThreadPool>> {
        let profile = self.resolve_profile(profile_id)?;
        self.new_thread_pool_with(source, name, &profile)
    }

    /// Pool from an inline profile, unset fields inherit from the default profile
    pub fn new_thread_pool_with(
        &self,
        source: &str,
        name: &str,
        profile: &ThreadPoolProfile,
    ) -> Result<Arc<ThreadPool>> {
        let settings = profile.resolve(&self.default_profile.read())?;
        Ok(self.create_pool(source, name, settings))
    }

    pub fn new_default_thread_pool(&self, source: &str, name: &str) -> Result<Arc<ThreadPool>> {
        let profile = self.default_profile();
        self.new_thread_pool_with(source, name, &profile)
    }

    /// One worker, unbounded queue, so tasks run in submission order
    pub fn new_single_thread_executor(&self, source: &str, name: &str) -> Result<Arc<ThreadPool>> {
        let profile = ThreadPoolProfile::new(name)
            .pool_size(1)
            .max_pool_size(1)
            .max_queue_size(-1);
        self.new_thread_pool_with(source, name, &profile)
    }

    /// Pool used for delayed work: core workers only, unbounded queue
    pub fn new_scheduled_thread_pool(
        &self,
        source: &str,
        name: &str,
        profile_id: Option<&str>,
    ) -> Result<Arc<ThreadPool>> {
        let profile = match profile_id {
            Some(id) => self.resolve_profile(id)?,
            None => self.default_profile(),
        };
        let mut settings = profile.resolve(&self.default_profile.read())?;
        settings.max_pool_size = settings.pool_size.max(1);
        settings.max_queue_size = None;
        Ok(self.create_pool(source, name, settings))
    }

    fn create_pool(&self, source: &str, name: &str, settings: PoolSettings) -> Arc<ThreadPool> {
        let n = self.pool_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}-{}-{}", source, name, n);
        let long_name = format!("{} ({})", name, source);
        let pool = Arc::new(ThreadPool::new(
            id.clone(),
            name.to_string(),
            long_name,
            settings,
            self.namer.clone(),
        ));
        self.pools.insert(id, pool.clone());
        pool
    }

    /// Every pool created and not yet shut down
    pub fn pools(&self) -> Vec<Arc<ThreadPool>> {
        self.pools.iter().map(|e| e.value().clone()).collect()
    }

    pub fn shutdown(&self, pool: &ThreadPool) {
        pool.shutdown();
        self.pools.remove(pool.id());
    }

    /// Force shutdown. Returns the number of tasks that never ran.
    pub fn shutdown_now(&self, pool: &ThreadPool) -> usize {
        let dropped = pool.shutdown_now();
        self.pools.remove(pool.id());
        dropped
    }

    /// Orderly shutdown, then force shutdown if the pool has not terminated within `timeout`.
    /// Returns true if the pool terminated without being forced.
    pub async fn shutdown_graceful(&self, pool: &ThreadPool, timeout: Duration) -> bool {
        pool.shutdown();
        let terminated = self.await_termination(pool, timeout).await;
        if !terminated {
            warn!(
                pool = %pool.id(),
                timeout_ms = timeout.as_millis() as u64,
                "Thread pool did not terminate in time, forcing shutdown"
            );
            pool.shutdown_now();
        }
        self.pools.remove(pool.id());
        terminated
    }

    /// Await termination, logging progress periodically
    pub async fn await_termination(&self, pool: &ThreadPool, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return pool.is_terminated();
            }
            let slice = remaining.min(self.await_termination_log_interval);
            if pool.await_termination(slice).await {
                return true;
            }
            let stats = pool.stats();
            info!(
                pool = %pool.id(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                active = stats.active,
                queued = stats.queued,
                delayed = stats.delayed,
                "Waiting for thread pool to terminate"
            );
        }
    }

    /// Shut down every tracked pool. Daemon pools are forced, others get a grace period.
    pub async fn shutdown_all(&self) {
        let pools = self.pools();
        if pools.is_empty() {
            return;
        }
        info!(count = pools.len(), "Shutting down thread pools");

        let mut graceful = Vec::new();
        for pool in pools {
            if pool.settings().daemon {
                self.shutdown_now(&pool);
            } else {
                pool.shutdown();
                graceful.push(pool);
            }
        }

        let timeout = self.shutdown_await_termination;
        let results = futures::future::join_all(
            graceful.iter().map(|pool| self.shutdown_graceful(pool, timeout)),
        )
        .await;
        let forced = results.iter().filter(|terminated| !**terminated).count();
        if forced > 0 {
            warn!(forced, "Some thread pools had to be forced to shut down");
        }
    }
}
