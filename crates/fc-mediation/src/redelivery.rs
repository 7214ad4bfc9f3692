//! RedeliveryPolicy - delay, backoff and exhaustion decisions
//!
//! Pure computation over an attempt index. One policy instance is shared by
//! every exchange flowing through an error handler.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use fc_common::Exchange;
use fc_config::RedeliverySettings;
use rand::Rng;

use crate::processor::Predicate;
use crate::{MediationError, Result};

/// Level used for a redelivery log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingLevel {
    Off,
    Trace,
    #[default]
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LoggingLevel {
    type Err = MediationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "OFF" => Ok(LoggingLevel::Off),
            "TRACE" => Ok(LoggingLevel::Trace),
            "DEBUG" => Ok(LoggingLevel::Debug),
            "INFO" => Ok(LoggingLevel::Info),
            "WARN" => Ok(LoggingLevel::Warn),
            "ERROR" => Ok(LoggingLevel::Error),
            other => Err(MediationError::Config(format!("unknown logging level '{}'", other))),
        }
    }
}

/// Emit a tracing event at a runtime-selected [`LoggingLevel`]
macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            $crate::redelivery::LoggingLevel::Off => {}
            $crate::redelivery::LoggingLevel::Trace => tracing::trace!($($arg)+),
            $crate::redelivery::LoggingLevel::Debug => tracing::debug!($($arg)+),
            $crate::redelivery::LoggingLevel::Info => tracing::info!($($arg)+),
            $crate::redelivery::LoggingLevel::Warn => tracing::warn!($($arg)+),
            $crate::redelivery::LoggingLevel::Error => tracing::error!($($arg)+),
        }
    };
}
pub(crate) use log_at;

/// Which outcomes are logged, and how
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryLogging {
    pub retry_attempted_level: LoggingLevel,
    pub retries_exhausted_level: LoggingLevel,
    pub log_retry_attempted: bool,
    pub log_exhausted: bool,
    pub log_handled: bool,
    pub log_new_exception: bool,
    pub log_stack_trace: bool,
    pub log_retry_stack_trace: bool,
    /// Log every n-th retry attempt
    pub retry_attempted_log_interval: u32,
}

impl Default for RedeliveryLogging {
    fn default() -> Self {
        Self {
            retry_attempted_level: LoggingLevel::Debug,
            retries_exhausted_level: LoggingLevel::Error,
            log_retry_attempted: true,
            log_exhausted: true,
            log_handled: false,
            log_new_exception: true,
            log_stack_trace: true,
            log_retry_stack_trace: false,
            retry_attempted_log_interval: 1,
        }
    }
}

impl RedeliveryLogging {
    pub fn should_log_attempt(&self, attempt: u32) -> bool {
        self.log_retry_attempted
            && self.retry_attempted_level != LoggingLevel::Off
            && attempt % self.retry_attempted_log_interval.max(1) == 0
    }
}

/// Attempt-range delay overrides, e.g. `"1:100;5:1000;10:5000"`.
///
/// The entry with the greatest limit not above the attempt wins.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayPattern {
    entries: Vec<(u32, Duration)>,
}

impl DelayPattern {
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        self.entries
            .iter()
            .take_while(|(limit, _)| *limit <= attempt)
            .last()
            .map(|(_, delay)| *delay)
    }
}

impl FromStr for DelayPattern {
    type Err = MediationError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || MediationError::Config(format!("invalid delay pattern '{}'", s));

        let mut entries = Vec::new();
        for group in s.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let (limit, delay) = group.split_once(':').ok_or_else(invalid)?;
            let limit: u32 = limit.trim().parse().map_err(|_| invalid())?;
            let delay: u64 = delay.trim().parse().map_err(|_| invalid())?;
            entries.push((limit, Duration::from_millis(delay)));
        }
        if entries.is_empty() {
            return Err(invalid());
        }
        entries.sort_by_key(|(limit, _)| *limit);
        Ok(Self { entries })
    }
}

impl fmt::Display for DelayPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|(limit, delay)| format!("{}:{}", limit, delay.as_millis()))
            .collect();
        f.write_str(&parts.join(";"))
    }
}

/// Immutable redelivery configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    /// 0 disables redelivery, negative means unlimited
    pub maximum_redeliveries: i32,
    pub redelivery_delay: Duration,
    pub back_off_multiplier: f64,
    pub maximum_redelivery_delay: Duration,
    /// Jitter as a percentage of the delay, `None` when collision avoidance is off
    pub collision_avoidance_percent: Option<f64>,
    pub delay_pattern: Option<DelayPattern>,
    pub async_delayed_redelivery: bool,
    pub allow_redelivery_while_stopping: bool,
    pub logging: RedeliveryLogging,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay: Duration::from_millis(1000),
            back_off_multiplier: 1.0,
            maximum_redelivery_delay: Duration::from_millis(60_000),
            collision_avoidance_percent: None,
            delay_pattern: None,
            async_delayed_redelivery: false,
            allow_redelivery_while_stopping: false,
            logging: RedeliveryLogging::default(),
        }
    }
}

impl RedeliveryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &RedeliverySettings) -> Result<Self> {
        let mut policy = Self::new()
            .maximum_redeliveries(settings.maximum_redeliveries)
            .redelivery_delay(Duration::from_millis(settings.redelivery_delay_ms))
            .back_off_multiplier(settings.back_off_multiplier)
            .maximum_redelivery_delay(Duration::from_millis(settings.maximum_redelivery_delay_ms))
            .async_delayed_redelivery(settings.async_delayed_redelivery)
            .allow_redelivery_while_stopping(settings.allow_redelivery_while_stopping);

        if settings.use_exponential_backoff {
            policy = policy.use_exponential_backoff();
        }
        if settings.use_collision_avoidance {
            policy = policy.collision_avoidance_percent(settings.collision_avoidance_percent);
        }
        if let Some(pattern) = &settings.delay_pattern {
            policy = policy.delay_pattern(pattern)?;
        }

        policy.logging = RedeliveryLogging {
            retry_attempted_level: settings.retry_attempted_log_level.parse()?,
            retries_exhausted_level: settings.retries_exhausted_log_level.parse()?,
            log_retry_attempted: settings.log_retry_attempted,
            log_exhausted: settings.log_exhausted,
            log_handled: settings.log_handled,
            log_new_exception: settings.log_new_exception,
            log_stack_trace: settings.log_stack_trace,
            log_retry_stack_trace: settings.log_retry_stack_trace,
            retry_attempted_log_interval: settings.retry_attempted_log_interval,
        };
        Ok(policy)
    }

    pub fn maximum_redeliveries(mut self, n: i32) -> Self {
        self.maximum_redeliveries = n;
        self
    }

    pub fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn back_off_multiplier(mut self, multiplier: f64) -> Self {
        self.back_off_multiplier = multiplier;
        self
    }

    /// Doubles the delay per attempt unless a larger multiplier is set
    pub fn use_exponential_backoff(mut self) -> Self {
        if self.back_off_multiplier <= 1.0 {
            self.back_off_multiplier = 2.0;
        }
        self
    }

    pub fn maximum_redelivery_delay(mut self, delay: Duration) -> Self {
        self.maximum_redelivery_delay = delay;
        self
    }

    /// 15% jitter
    pub fn use_collision_avoidance(self) -> Self {
        self.collision_avoidance_percent(15.0)
    }

    pub fn collision_avoidance_percent(mut self, percent: f64) -> Self {
        self.collision_avoidance_percent = Some(percent.clamp(0.0, 100.0));
        self
    }

    pub fn delay_pattern(mut self, pattern: &str) -> Result<Self> {
        self.delay_pattern = Some(pattern.parse()?);
        Ok(self)
    }

    pub fn async_delayed_redelivery(mut self, enabled: bool) -> Self {
        self.async_delayed_redelivery = enabled;
        self
    }

    pub fn allow_redelivery_while_stopping(mut self, allow: bool) -> Self {
        self.allow_redelivery_while_stopping = allow;
        self
    }

    pub fn retry_attempted_log_level(mut self, level: LoggingLevel) -> Self {
        self.logging.retry_attempted_level = level;
        self
    }

    pub fn retries_exhausted_log_level(mut self, level: LoggingLevel) -> Self {
        self.logging.retries_exhausted_level = level;
        self
    }

    pub fn log_handled(mut self, log: bool) -> Self {
        self.logging.log_handled = log;
        self
    }

    pub fn log_stack_trace(mut self, log: bool) -> Self {
        self.logging.log_stack_trace = log;
        self
    }

    pub fn log_retry_stack_trace(mut self, log: bool) -> Self {
        self.logging.log_retry_stack_trace = log;
        self
    }

    pub fn retry_attempted_log_interval(mut self, interval: u32) -> Self {
        self.logging.retry_attempted_log_interval = interval;
        self
    }

    /// True if redelivery can ever happen under this policy
    pub fn is_redelivery_enabled(&self) -> bool {
        self.maximum_redeliveries != 0
    }

    /// Delay before redelivery attempt `attempt` (1 = first redelivery)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        if let Some(delay) = self.delay_pattern.as_ref().and_then(|p| p.delay_for(attempt)) {
            return delay;
        }

        let max_ms = self.maximum_redelivery_delay.as_secs_f64() * 1000.0;
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base_ms = self.redelivery_delay.as_secs_f64() * 1000.0 * self.back_off_multiplier.powi(exponent);
        let mut delay_ms = if base_ms.is_finite() { base_ms.min(max_ms) } else { max_ms };

        if let Some(percent) = self.collision_avoidance_percent {
            let factor = percent / 100.0;
            if factor > 0.0 {
                let variance = rand::rng().random_range(-factor..=factor);
                delay_ms += delay_ms * variance;
            }
        }

        Duration::from_secs_f64(delay_ms.clamp(0.0, max_ms) / 1000.0)
    }

    /// True once redelivery must stop: the counter passed the maximum
    /// (unless unlimited) or the retry-while predicate no longer holds.
    pub fn should_exhaust(&self, attempt: u32, exchange: &Exchange, retry_while: Option<&dyn Predicate>) -> bool {
        let counter_exhausted =
            self.maximum_redeliveries >= 0 && i64::from(attempt) > i64::from(self.maximum_redeliveries);
        let predicate_stops = retry_while.map_or(false, |p| !p.matches(exchange));
        counter_exhausted || predicate_stops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_common::ExchangeError;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_defaults() {
        let policy = RedeliveryPolicy::default();
        assert_eq!(policy.maximum_redeliveries, 0);
        assert_eq!(policy.next_delay(1), ms(1000));
        assert_eq!(policy.next_delay(5), ms(1000));
        assert!(!policy.allow_redelivery_while_stopping);
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let policy = RedeliveryPolicy::new()
            .redelivery_delay(ms(100))
            .back_off_multiplier(2.0)
            .maximum_redelivery_delay(ms(5000));

        assert_eq!(policy.next_delay(1), ms(100));
        assert_eq!(policy.next_delay(2), ms(200));
        assert_eq!(policy.next_delay(3), ms(400));

        let mut previous = Duration::ZERO;
        for attempt in 1..200 {
            let delay = policy.next_delay(attempt);
            assert!(delay >= previous, "attempt {} went backwards", attempt);
            assert!(delay <= ms(5000));
            previous = delay;
        }
        assert_eq!(policy.next_delay(1000), ms(5000));
    }

    #[test]
    fn test_collision_avoidance_stays_in_bounds() {
        let policy = RedeliveryPolicy::new()
            .redelivery_delay(ms(1000))
            .collision_avoidance_percent(20.0)
            .maximum_redelivery_delay(ms(1100));

        for _ in 0..500 {
            let delay = policy.next_delay(1);
            assert!(delay >= ms(799), "{:?}", delay);
            assert!(delay <= ms(1100), "{:?}", delay);
        }
    }

    #[test]
    fn test_delay_pattern_overrides_backoff() {
        let policy = RedeliveryPolicy::new()
            .redelivery_delay(ms(10))
            .back_off_multiplier(3.0)
            .delay_pattern("5:1000;2:300")
            .unwrap();

        assert_eq!(policy.next_delay(1), ms(10));
        assert_eq!(policy.next_delay(2), ms(300));
        assert_eq!(policy.next_delay(4), ms(300));
        assert_eq!(policy.next_delay(5), ms(1000));
        assert_eq!(policy.next_delay(50), ms(1000));
        assert_eq!(policy.delay_pattern.as_ref().unwrap().to_string(), "2:300;5:1000");
    }

    #[test]
    fn test_invalid_delay_pattern() {
        assert!("".parse::<DelayPattern>().is_err());
        assert!("5-1000".parse::<DelayPattern>().is_err());
        assert!("a:b".parse::<DelayPattern>().is_err());
    }

    #[test]
    fn test_exhaustion_by_counter() {
        let policy = RedeliveryPolicy::new().maximum_redeliveries(2);
        let exchange = Exchange::default();
        assert!(!policy.should_exhaust(1, &exchange, None));
        assert!(!policy.should_exhaust(2, &exchange, None));
        assert!(policy.should_exhaust(3, &exchange, None));

        let disabled = RedeliveryPolicy::new();
        assert!(disabled.should_exhaust(1, &exchange, None));
    }

    #[test]
    fn test_unlimited_stops_only_on_predicate() {
        let policy = RedeliveryPolicy::new().maximum_redeliveries(-1);
        let mut exchange = Exchange::default();
        let retry_while = |e: &Exchange| e.exception().map_or(false, |err| err.to_string() == "transient");
        let retry_while: &dyn Predicate = &retry_while;

        exchange.set_exception(Some(ExchangeError::msg("transient")));
        assert!(!policy.should_exhaust(10_000, &exchange, Some(retry_while)));

        exchange.set_exception(Some(ExchangeError::msg("fatal")));
        assert!(policy.should_exhaust(1, &exchange, Some(retry_while)));
    }

    #[test]
    fn test_from_settings() {
        let settings = RedeliverySettings {
            maximum_redeliveries: 5,
            use_exponential_backoff: true,
            use_collision_avoidance: true,
            delay_pattern: Some("3:500".to_string()),
            retries_exhausted_log_level: "warn".to_string(),
            ..Default::default()
        };
        let policy = RedeliveryPolicy::from_settings(&settings).unwrap();
        assert_eq!(policy.maximum_redeliveries, 5);
        assert_eq!(policy.back_off_multiplier, 2.0);
        assert_eq!(policy.collision_avoidance_percent, Some(15.0));
        assert_eq!(policy.logging.retries_exhausted_level, LoggingLevel::Warn);
        assert_eq!(policy.next_delay(3), ms(500));
    }

    #[test]
    fn test_retry_attempt_log_interval() {
        let logging = RedeliveryLogging {
            retry_attempted_log_interval: 3,
            ..Default::default()
        };
        assert!(!logging.should_log_attempt(1));
        assert!(logging.should_log_attempt(3));
        assert!(logging.should_log_attempt(6));
    }
}
