//! Structured logging bootstrap
//!
//! Every mediation component logs through `tracing` with structured fields
//! (`route_id`, `exchange_id`, `attempt`, `pool`). This module installs the
//! subscriber once per process.
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: `json` for one JSON object per line (log aggregation),
//!   anything else for human-readable text (default)
//! - `RUST_LOG`: level filter, e.g. `RUST_LOG=fc_mediation=debug` (default: info)
//!
//! Redelivery and pool worker logs run inside spans carrying the exchange id
//! or the worker's thread name, so the JSON output flattens those fields onto
//! every event.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Default filter when RUST_LOG is unset
pub const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Read `LOG_FORMAT`, falling back to text
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("LOG_FORMAT").unwrap_or_default())
    }

    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the process-wide subscriber for `service_name`.
///
/// Panics if a global subscriber is already installed, like
/// `tracing_subscriber`'s own `init`.
pub fn init_logging(service_name: &str) {
    let format = LogFormat::from_env();
    let registry = tracing_subscriber::registry().with(env_filter(DEFAULT_FILTER));

    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .flatten_event(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_ids(false).with_ansi(true))
            .init(),
    }

    tracing::debug!(service = service_name, ?format, "Logging initialized");
}

/// Subscriber writing through the test harness. Only the first call installs.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(env_filter("debug"))
        .with(fmt::layer().with_test_writer().with_target(true))
        .try_init();
}
