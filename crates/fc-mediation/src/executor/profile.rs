use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use fc_config::ThreadPoolProfileSettings;

use crate::{MediationError, Result};

pub const DEFAULT_PROFILE_ID: &str = "defaultThreadPoolProfile";

/// What a pool does with a task it has no room for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectedPolicy {
    /// Fail the submission
    Abort,
    /// Run the task on the submitting flow of control
    #[default]
    CallerRuns,
    /// Drop the new task
    Discard,
    /// Drop the oldest queued task and queue the new one
    DiscardOldest,
}

impl RejectedPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectedPolicy::Abort => "Abort",
            RejectedPolicy::CallerRuns => "CallerRuns",
            RejectedPolicy::Discard => "Discard",
            RejectedPolicy::DiscardOldest => "DiscardOldest",
        }
    }
}

impl fmt::Display for RejectedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RejectedPolicy {
    type Err = MediationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Abort" => Ok(RejectedPolicy::Abort),
            "CallerRuns" => Ok(RejectedPolicy::CallerRuns),
            "Discard" => Ok(RejectedPolicy::Discard),
            "DiscardOldest" => Ok(RejectedPolicy::DiscardOldest),
            other => Err(MediationError::Config(format!("unknown rejected policy '{}'", other))),
        }
    }
}

/// Named thread pool configuration. Unset fields are taken from the default profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadPoolProfile {
    pub id: String,
    pub default_profile: bool,
    pub pool_size: Option<usize>,
    pub max_pool_size: Option<usize>,
    pub keep_alive: Option<Duration>,
    /// Negative means unbounded
    pub max_queue_size: Option<i64>,
    pub allow_core_thread_timeout: Option<bool>,
    pub rejected_policy: Option<RejectedPolicy>,
    pub daemon: Option<bool>,
}

impl ThreadPoolProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// The profile used when nothing else is configured
    pub fn built_in_default() -> Self {
        Self {
            id: DEFAULT_PROFILE_ID.to_string(),
            default_profile: true,
            pool_size: Some(10),
            max_pool_size: Some(20),
            keep_alive: Some(Duration::from_secs(60)),
            max_queue_size: Some(1000),
            allow_core_thread_timeout: Some(false),
            rejected_policy: Some(RejectedPolicy::CallerRuns),
            daemon: Some(true),
        }
    }

    pub fn from_settings(settings: &ThreadPoolProfileSettings) -> Result<Self> {
        let rejected_policy = settings
            .rejected_policy
            .as_deref()
            .map(RejectedPolicy::from_str)
            .transpose()?;

        Ok(Self {
            id: settings.id.clone(),
            default_profile: false,
            pool_size: settings.pool_size,
            max_pool_size: settings.max_pool_size,
            keep_alive: settings.keep_alive_ms.map(Duration::from_millis),
            max_queue_size: settings.max_queue_size,
            allow_core_thread_timeout: settings.allow_core_thread_timeout,
            rejected_policy,
            daemon: settings.daemon,
        })
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = Some(size);
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    pub fn max_queue_size(mut self, size: i64) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    pub fn allow_core_thread_timeout(mut self, allow: bool) -> Self {
        self.allow_core_thread_timeout = Some(allow);
        self
    }

    pub fn rejected_policy(mut self, policy: RejectedPolicy) -> Self {
        self.rejected_policy = Some(policy);
        self
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = Some(daemon);
        self
    }

    /// Fill every unset field from `fallback`
    pub fn merged_over(&self, fallback: &ThreadPoolProfile) -> ThreadPoolProfile {
        ThreadPoolProfile {
            id: self.id.clone(),
            default_profile: self.default_profile,
            pool_size: self.pool_size.or(fallback.pool_size),
            max_pool_size: self.max_pool_size.or(fallback.max_pool_size),
            keep_alive: self.keep_alive.or(fallback.keep_alive),
            max_queue_size: self.max_queue_size.or(fallback.max_queue_size),
            allow_core_thread_timeout: self.allow_core_thread_timeout.or(fallback.allow_core_thread_timeout),
            rejected_policy: self.rejected_policy.or(fallback.rejected_policy),
            daemon: self.daemon.or(fallback.daemon),
        }
    }

    /// Resolve against the default profile into concrete settings
    pub fn resolve(&self, default: &ThreadPoolProfile) -> Result<PoolSettings> {
        let merged = self
            .merged_over(default)
            .merged_over(&ThreadPoolProfile::built_in_default());

        let pool_size = merged.pool_size.unwrap_or(10);
        let mut max_pool_size = merged.max_pool_size.unwrap_or(20);
        if self.pool_size.is_some() && self.max_pool_size.is_none() && max_pool_size < pool_size {
            // an explicit core size above the inherited max lifts the max with it
            max_pool_size = pool_size;
        }
        if max_pool_size < pool_size || max_pool_size == 0 {
            return Err(MediationError::Config(format!(
                "thread pool profile '{}': max pool size {} must be at least 1 and not below pool size {}",
                self.id, max_pool_size, pool_size
            )));
        }

        Ok(PoolSettings {
            pool_size,
            max_pool_size,
            keep_alive: merged.keep_alive.unwrap_or(Duration::from_secs(60)),
            max_queue_size: merged
                .max_queue_size
                .and_then(|n| usize::try_from(n).ok()),
            allow_core_thread_timeout: merged.allow_core_thread_timeout.unwrap_or(false),
            rejected_policy: merged.rejected_policy.unwrap_or_default(),
            daemon: merged.daemon.unwrap_or(true),
        })
    }
}

/// Fully resolved pool configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub pool_size: usize,
    pub max_pool_size: usize,
    pub keep_alive: Duration,
    /// `None` means unbounded
    pub max_queue_size: Option<usize>,
    pub allow_core_thread_timeout: bool,
    pub rejected_policy: RejectedPolicy,
    pub daemon: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_profile_inherits_unset_fields() {
        let default = ThreadPoolProfile::built_in_default();
        let profile = ThreadPoolProfile::new("fast")
            .pool_size(2)
            .max_pool_size(4)
            .rejected_policy(RejectedPolicy::Abort);

        let settings = profile.resolve(&default).unwrap();
        assert_eq!(settings.pool_size, 2);
        assert_eq!(settings.max_pool_size, 4);
        assert_eq!(settings.rejected_policy, RejectedPolicy::Abort);
        assert_eq!(settings.max_queue_size, Some(1000));
        assert_eq!(settings.keep_alive, Duration::from_secs(60));
        assert!(settings.daemon);
    }

    #[test]
    fn test_custom_default_profile_is_used() {
        let default = ThreadPoolProfile::built_in_default().max_queue_size(-1).daemon(false);
        let settings = ThreadPoolProfile::new("x").resolve(&default).unwrap();
        assert_eq!(settings.max_queue_size, None);
        assert!(!settings.daemon);
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        let default = ThreadPoolProfile::built_in_default();
        let profile = ThreadPoolProfile::new("bad").pool_size(8).max_pool_size(2);
        assert!(profile.resolve(&default).is_err());
    }

    #[test]
    fn test_core_size_above_inherited_max() {
        let default = ThreadPoolProfile::built_in_default();
        let settings = ThreadPoolProfile::new("big").pool_size(50).resolve(&default).unwrap();
        assert_eq!(settings.max_pool_size, 50);
    }

    #[test]
    fn test_rejected_policy_parse() {
        assert_eq!("DiscardOldest".parse::<RejectedPolicy>().unwrap(), RejectedPolicy::DiscardOldest);
        assert!("Nope".parse::<RejectedPolicy>().is_err());
    }
}
