//! Configuration loader with file and environment variable support

use crate::{ConfigError, MediationConfig};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "mediation.toml",
    "./config/config.toml",
    "./config/mediation.toml",
    "/etc/flowcatalyst/mediation.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found), apply environment variable
    /// overrides, then validate the result
    pub fn load(&self) -> Result<MediationConfig, ConfigError> {
        let mut config = MediationConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = MediationConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured file not found, searching standard paths");
        }

        if let Ok(path) = env::var("FLOWCATALYST_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS.iter().map(PathBuf::from).find(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut MediationConfig) -> Result<(), ConfigError> {
        // Context
        if let Ok(val) = env::var("FLOWCATALYST_CONTEXT_NAME") {
            config.context.name = val;
        }
        if let Ok(val) = env::var("FLOWCATALYST_THREAD_NAME_PATTERN") {
            config.context.thread_name_pattern = val;
        }

        // Redelivery
        override_parsed("FLOWCATALYST_REDELIVERY_MAX", &mut config.redelivery.maximum_redeliveries)?;
        override_parsed("FLOWCATALYST_REDELIVERY_DELAY_MS", &mut config.redelivery.redelivery_delay_ms)?;
        override_parsed("FLOWCATALYST_REDELIVERY_BACKOFF_MULTIPLIER", &mut config.redelivery.back_off_multiplier)?;
        override_parsed(
            "FLOWCATALYST_REDELIVERY_MAX_DELAY_MS",
            &mut config.redelivery.maximum_redelivery_delay_ms,
        )?;
        override_parsed(
            "FLOWCATALYST_REDELIVERY_COLLISION_AVOIDANCE",
            &mut config.redelivery.use_collision_avoidance,
        )?;
        override_parsed("FLOWCATALYST_REDELIVERY_ASYNC", &mut config.redelivery.async_delayed_redelivery)?;
        override_parsed(
            "FLOWCATALYST_REDELIVERY_WHILE_STOPPING",
            &mut config.redelivery.allow_redelivery_while_stopping,
        )?;
        if let Ok(val) = env::var("FLOWCATALYST_REDELIVERY_DELAY_PATTERN") {
            config.redelivery.delay_pattern = Some(val).filter(|v| !v.is_empty());
        }

        // Dead letter
        if let Ok(val) = env::var("FLOWCATALYST_DEAD_LETTER_URI") {
            config.dead_letter.dead_letter_uri = Some(val).filter(|v| !v.is_empty());
        }
        override_parsed("FLOWCATALYST_USE_ORIGINAL_MESSAGE", &mut config.dead_letter.use_original_message)?;
        override_parsed("FLOWCATALYST_USE_ORIGINAL_BODY", &mut config.dead_letter.use_original_body)?;

        // Shutdown
        override_parsed("FLOWCATALYST_SHUTDOWN_TIMEOUT_MS", &mut config.shutdown.timeout_ms)?;
        override_parsed(
            "FLOWCATALYST_SHUTDOWN_NOW_ON_TIMEOUT",
            &mut config.shutdown.shutdown_now_on_timeout,
        )?;

        // Default thread pool profile
        if let Ok(val) = env::var("FLOWCATALYST_POOL_SIZE") {
            config.thread_pools.default.pool_size = Some(parse_env("FLOWCATALYST_POOL_SIZE", &val)?);
        }
        if let Ok(val) = env::var("FLOWCATALYST_MAX_POOL_SIZE") {
            config.thread_pools.default.max_pool_size = Some(parse_env("FLOWCATALYST_MAX_POOL_SIZE", &val)?);
        }
        if let Ok(val) = env::var("FLOWCATALYST_MAX_QUEUE_SIZE") {
            config.thread_pools.default.max_queue_size = Some(parse_env("FLOWCATALYST_MAX_QUEUE_SIZE", &val)?);
        }
        if let Ok(val) = env::var("FLOWCATALYST_REJECTED_POLICY") {
            config.thread_pools.default.rejected_policy = Some(val);
        }

        // Aggregation
        if let Ok(val) = env::var("FLOWCATALYST_AGGREGATION_STORE_DIR") {
            config.aggregation.store_dir = Some(val).filter(|v| !v.is_empty());
        }
        override_parsed(
            "FLOWCATALYST_AGGREGATION_RECOVERY_INTERVAL_MS",
            &mut config.aggregation.recovery_interval_ms,
        )?;
        if let Ok(val) = env::var("FLOWCATALYST_AGGREGATION_COMPLETION_TIMEOUT_MS") {
            config.aggregation.completion_timeout_ms =
                Some(parse_env("FLOWCATALYST_AGGREGATION_COMPLETION_TIMEOUT_MS", &val)?);
        }

        // Metrics
        override_parsed("FLOWCATALYST_METRICS_ENABLED", &mut config.metrics.enabled)?;
        override_parsed("FLOWCATALYST_METRICS_PORT", &mut config.metrics.port)?;

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn override_parsed<T: FromStr>(name: &str, target: &mut T) -> Result<(), ConfigError> {
    if let Ok(val) = env::var(name) {
        *target = parse_env(name, &val)?;
    }
    Ok(())
}

fn parse_env<T: FromStr>(name: &str, val: &str) -> Result<T, ConfigError> {
    val.trim()
        .parse()
        .map_err(|_| ConfigError::EnvError(format!("{} has invalid value '{}'", name, val)))
}
