//! Shared types for the FlowCatalyst mediation engine
//!
//! - [`Exchange`]: the unit of work passed through routes
//! - [`logging`]: structured logging bootstrap

pub mod exchange;
pub mod logging;

pub use exchange::{headers, properties, Exchange, ExchangeError, ExchangePattern, Message};
