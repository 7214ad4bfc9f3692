//! FlowCatalyst Mediation Configuration
//!
//! This crate provides TOML-based configuration with environment variable override support.
//! Every section uses `#[serde(default)]`, so a partial file only overrides what it names.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Recognised rejected-policy names
pub const REJECTED_POLICIES: &[&str] = &["Abort", "CallerRuns", "Discard", "DiscardOldest"];

/// Recognised logging-level names
pub const LOGGING_LEVELS: &[&str] = &["OFF", "TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Root mediation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediationConfig {
    pub context: ContextSettings,
    pub redelivery: RedeliverySettings,
    pub dead_letter: DeadLetterSettings,
    pub shutdown: ShutdownSettings,
    pub thread_pools: ThreadPoolsSettings,
    pub aggregation: AggregationSettings,
    pub metrics: MetricsSettings,
}

/// Context identity and diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    pub name: String,
    /// Thread name pattern, tokens: #name# #counter# #contextId# #longName#
    pub thread_name_pattern: String,
    /// Inflight exchanges older than this are reported by the stall monitor
    pub inflight_stall_threshold_secs: u64,
    pub inflight_stall_check_interval_secs: u64,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            name: "flowcatalyst".to_string(),
            thread_name_pattern: "FlowCatalyst (#contextId#) thread ##counter# - #name#".to_string(),
            inflight_stall_threshold_secs: 300,
            inflight_stall_check_interval_secs: 60,
        }
    }
}

/// Default redelivery policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliverySettings {
    /// 0 disables retry, -1 means unlimited
    pub maximum_redeliveries: i32,
    pub redelivery_delay_ms: u64,
    pub back_off_multiplier: f64,
    pub use_exponential_backoff: bool,
    pub maximum_redelivery_delay_ms: u64,
    pub use_collision_avoidance: bool,
    pub collision_avoidance_percent: f64,
    /// "limit:delay;limit:delay"
    pub delay_pattern: Option<String>,
    pub async_delayed_redelivery: bool,
    pub allow_redelivery_while_stopping: bool,
    /// Registry id of a retry-while predicate
    pub retry_while: Option<String>,
    pub retry_attempted_log_level: String,
    pub retries_exhausted_log_level: String,
    pub log_stack_trace: bool,
    pub log_retry_stack_trace: bool,
    pub log_retry_attempted: bool,
    pub log_exhausted: bool,
    pub log_handled: bool,
    pub log_new_exception: bool,
    pub retry_attempted_log_interval: u32,
}

impl Default for RedeliverySettings {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay_ms: 1000,
            back_off_multiplier: 1.0,
            use_exponential_backoff: false,
            maximum_redelivery_delay_ms: 60_000,
            use_collision_avoidance: false,
            collision_avoidance_percent: 15.0,
            delay_pattern: None,
            async_delayed_redelivery: false,
            allow_redelivery_while_stopping: false,
            retry_while: None,
            retry_attempted_log_level: "DEBUG".to_string(),
            retries_exhausted_log_level: "ERROR".to_string(),
            log_stack_trace: true,
            log_retry_stack_trace: false,
            log_retry_attempted: true,
            log_exhausted: true,
            log_handled: false,
            log_new_exception: true,
            retry_attempted_log_interval: 1,
        }
    }
}

/// Dead-letter channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterSettings {
    /// When unset the default error handler is used
    pub dead_letter_uri: Option<String>,
    pub use_original_message: bool,
    pub use_original_body: bool,
    pub dead_letter_handle_new_exception: bool,
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            dead_letter_uri: None,
            use_original_message: false,
            use_original_body: false,
            dead_letter_handle_new_exception: true,
        }
    }
}

/// Graceful shutdown settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    pub timeout_ms: u64,
    pub shutdown_now_on_timeout: bool,
    pub shutdown_routes_in_reverse_order: bool,
    pub suppress_logging_on_timeout: bool,
    pub log_inflight_exchanges_on_timeout: bool,
    /// How often the drain loop re-checks inflight counts
    pub poll_interval_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 45_000,
            shutdown_now_on_timeout: true,
            shutdown_routes_in_reverse_order: true,
            suppress_logging_on_timeout: false,
            log_inflight_exchanges_on_timeout: true,
            poll_interval_ms: 1000,
        }
    }
}

/// A thread pool profile. Unset fields inherit from the default profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolProfileSettings {
    pub id: String,
    pub pool_size: Option<usize>,
    pub max_pool_size: Option<usize>,
    pub keep_alive_ms: Option<u64>,
    /// Negative means unbounded
    pub max_queue_size: Option<i64>,
    pub allow_core_thread_timeout: Option<bool>,
    pub rejected_policy: Option<String>,
    pub daemon: Option<bool>,
}

/// Thread pool profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolsSettings {
    pub default: ThreadPoolProfileSettings,
    pub profiles: Vec<ThreadPoolProfileSettings>,
    /// Interval for progress logging while awaiting pool termination
    pub await_termination_log_interval_ms: u64,
    pub shutdown_await_termination_ms: u64,
}

impl Default for ThreadPoolsSettings {
    fn default() -> Self {
        Self {
            default: ThreadPoolProfileSettings {
                id: "defaultThreadPoolProfile".to_string(),
                pool_size: Some(10),
                max_pool_size: Some(20),
                keep_alive_ms: Some(60_000),
                max_queue_size: Some(1000),
                allow_core_thread_timeout: Some(false),
                rejected_policy: Some("CallerRuns".to_string()),
                daemon: Some(true),
            },
            profiles: Vec::new(),
            await_termination_log_interval_ms: 2000,
            shutdown_await_termination_ms: 10_000,
        }
    }
}

/// Aggregation repository settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSettings {
    pub optimistic_locking: bool,
    /// Directory for the file-backed durable store; unset keeps recovery in memory
    pub store_dir: Option<String>,
    pub recovery_interval_ms: u64,
    /// Recovery attempts before a recovered group goes to `recovery_dead_letter_uri`
    pub recovery_maximum_redeliveries: Option<u32>,
    pub recovery_dead_letter_uri: Option<String>,
    pub completion_size: Option<usize>,
    /// Complete a group after this long without a new exchange
    pub completion_timeout_ms: Option<u64>,
    /// Complete every open group on this fixed period
    pub completion_interval_ms: Option<u64>,
    pub force_completion_on_stop: bool,
    pub complete_all_on_stop: bool,
    pub lock_retry: LockRetrySettings,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            optimistic_locking: true,
            store_dir: None,
            recovery_interval_ms: 5000,
            recovery_maximum_redeliveries: None,
            recovery_dead_letter_uri: None,
            completion_size: None,
            completion_timeout_ms: None,
            completion_interval_ms: None,
            force_completion_on_stop: false,
            complete_all_on_stop: false,
            lock_retry: LockRetrySettings::default(),
        }
    }
}

/// Optimistic lock retry loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockRetrySettings {
    /// 0 means retry forever
    pub maximum_retries: u32,
    pub retry_delay_ms: u64,
    pub maximum_retry_delay_ms: u64,
    pub exponential_backoff: bool,
    pub random_backoff: bool,
}

impl Default for LockRetrySettings {
    fn default() -> Self {
        Self {
            maximum_retries: 0,
            retry_delay_ms: 50,
            maximum_retry_delay_ms: 1000,
            exponential_backoff: true,
            random_backoff: false,
        }
    }
}

/// Prometheus exporter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9000,
        }
    }
}

impl MediationConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MediationConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Reject settings that cannot be turned into a working engine
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::ValidationError(msg)) };

        if self.dead_letter.use_original_message && self.dead_letter.use_original_body {
            return invalid(
                "use_original_message and use_original_body are mutually exclusive".to_string(),
            );
        }
        if self.shutdown.timeout_ms == 0 {
            return invalid("shutdown.timeout_ms must be greater than zero".to_string());
        }
        if self.redelivery.back_off_multiplier <= 0.0 {
            return invalid(format!(
                "redelivery.back_off_multiplier must be positive, got {}",
                self.redelivery.back_off_multiplier
            ));
        }
        if !(0.0..=100.0).contains(&self.redelivery.collision_avoidance_percent) {
            return invalid(format!(
                "redelivery.collision_avoidance_percent must be within 0..=100, got {}",
                self.redelivery.collision_avoidance_percent
            ));
        }
        for level in [
            &self.redelivery.retry_attempted_log_level,
            &self.redelivery.retries_exhausted_log_level,
        ] {
            if !LOGGING_LEVELS.iter().any(|l| l.eq_ignore_ascii_case(level)) {
                return invalid(format!("unknown logging level '{}'", level));
            }
        }

        for profile in std::iter::once(&self.thread_pools.default).chain(&self.thread_pools.profiles) {
            validate_profile(profile)?;
        }
        if self.thread_pools.profiles.iter().any(|p| p.id.is_empty()) {
            return invalid("thread pool profiles must have an id".to_string());
        }

        let aggregation = &self.aggregation;
        if aggregation.completion_timeout_ms.is_some() && aggregation.completion_interval_ms.is_some() {
            return invalid("aggregation.completion_timeout_ms and completion_interval_ms are mutually exclusive".to_string());
        }
        if aggregation.completion_timeout_ms == Some(0) || aggregation.completion_interval_ms == Some(0) {
            return invalid("aggregation completion timeout and interval must be positive".to_string());
        }
        if aggregation.recovery_dead_letter_uri.is_some()
            && aggregation.recovery_maximum_redeliveries.map_or(true, |max| max == 0)
        {
            return invalid(
                "aggregation.recovery_dead_letter_uri needs a positive recovery_maximum_redeliveries".to_string(),
            );
        }

        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# FlowCatalyst Mediation Configuration
# Environment variables override these settings

[context]
name = "flowcatalyst"
thread_name_pattern = "FlowCatalyst (#contextId#) thread ##counter# - #name#"

[redelivery]
maximum_redeliveries = 3        # 0 disables retry, -1 is unlimited
redelivery_delay_ms = 1000
back_off_multiplier = 2.0
maximum_redelivery_delay_ms = 60000
use_collision_avoidance = false
# delay_pattern = "1:1000;5:5000"
async_delayed_redelivery = true
allow_redelivery_while_stopping = false

[dead_letter]
dead_letter_uri = "log:dead-letter"
use_original_message = true
dead_letter_handle_new_exception = true

[shutdown]
timeout_ms = 45000
shutdown_now_on_timeout = true

[thread_pools.default]
pool_size = 10
max_pool_size = 20
keep_alive_ms = 60000
max_queue_size = 1000
rejected_policy = "CallerRuns"

[[thread_pools.profiles]]
id = "redelivery"
pool_size = 4
max_pool_size = 4

[aggregation]
optimistic_locking = true
# store_dir = "./data/aggregation"
recovery_interval_ms = 5000
# recovery_maximum_redeliveries = 5
# recovery_dead_letter_uri = "log:aggregation-dead-letter"
completion_size = 3
# completion_timeout_ms = 30000

[metrics]
enabled = false
port = 9000
"#
        .to_string()
    }
}

fn validate_profile(profile: &ThreadPoolProfileSettings) -> Result<(), ConfigError> {
    if let (Some(size), Some(max)) = (profile.pool_size, profile.max_pool_size) {
        if max < size {
            return Err(ConfigError::ValidationError(format!(
                "thread pool profile '{}': max_pool_size {} is less than pool_size {}",
                profile.id, max, size
            )));
        }
    }
    if let Some(policy) = &profile.rejected_policy {
        if !REJECTED_POLICIES.contains(&policy.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "thread pool profile '{}': unknown rejected_policy '{}'",
                profile.id, policy
            )));
        }
    }
    Ok(())
}
