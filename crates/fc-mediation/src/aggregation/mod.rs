//! Aggregation - correlation state shared by concurrent exchanges
//!
//! One repository interface with two optional capabilities:
//!
//! - [`OptimisticLocking`]: compare-and-swap writes that fail with
//!   [`MediationError::OptimisticLocking`](crate::MediationError::OptimisticLocking)
//!   when another writer got there first. Callers re-read, re-merge and retry.
//! - [`Recoverable`]: a durable copy of every group, so groups that were
//!   added but never confirmed can be found again after a crash.
//!
//! Capabilities are reached through accessors rather than sub-traits, so a
//! composing repository can forward whatever its inner repository offers.

mod aggregator;
mod memory;
mod recoverable;
mod retry;
mod store;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use fc_common::Exchange;

use crate::Result;

pub use aggregator::{
    correlate_by_body_field, correlate_by_header, AggregationStrategy, Aggregator, AggregatorBuilder,
    CorrelationExpression,
};
pub use memory::MemoryAggregationRepository;
pub use recoverable::RecoverableAggregationRepository;
pub use retry::OptimisticLockRetryPolicy;
pub use store::{DurableStore, FileDurableStore, InMemoryDurableStore, StoredExchange};

/// Correlation key to aggregated exchange storage. Safe for concurrent use.
#[async_trait]
pub trait AggregationRepository: Send + Sync {
    /// Store `exchange` under `key`, returning the previous value
    async fn add(&self, key: &str, exchange: Exchange) -> Result<Option<Exchange>>;

    async fn get(&self, key: &str) -> Result<Option<Exchange>>;

    /// Remove the group for `key`, returning it
    async fn remove(&self, key: &str) -> Result<Option<Exchange>>;

    /// Remove the group for `key` because it completed as `completed`.
    /// Recoverable repositories keep `completed` until it is confirmed.
    async fn complete(&self, key: &str, completed: &Exchange) -> Result<()> {
        self.remove(key).await.map(|_| ())
    }

    /// The completed group `exchange_id` was delivered and may be forgotten
    async fn confirm(&self, _exchange_id: &str) -> Result<()> {
        Ok(())
    }

    fn keys(&self) -> Vec<String>;

    fn optimistic_locking(&self) -> Option<&dyn OptimisticLocking> {
        None
    }

    fn recoverable(&self) -> Option<&dyn Recoverable> {
        None
    }

    fn supports_optimistic_locking(&self) -> bool {
        self.optimistic_locking().is_some()
    }

    fn supports_recovery(&self) -> bool {
        self.recoverable().is_some()
    }
}

/// Compare-and-swap access to a repository
#[async_trait]
pub trait OptimisticLocking: Send + Sync {
    /// Store `exchange` under `key` only if the current value is `expected`
    async fn add_expected(&self, key: &str, expected: Option<&Exchange>, exchange: Exchange)
        -> Result<Option<Exchange>>;

    /// Remove the group for `key` only if the current value is `expected`
    async fn remove_expected(&self, key: &str, expected: &Exchange) -> Result<()>;

    /// Compare-and-swap form of [`AggregationRepository::complete`]. With no
    /// `expected` group the key must still be absent.
    async fn complete_expected(&self, key: &str, expected: Option<&Exchange>, _completed: &Exchange) -> Result<()> {
        match expected {
            Some(expected) => self.remove_expected(key, expected).await,
            None => Ok(()),
        }
    }
}

/// Durable recovery of groups that were added but never confirmed
#[async_trait]
pub trait Recoverable: Send + Sync {
    /// Ids of stored exchanges no longer backed by a live group
    async fn scan(&self) -> Result<HashSet<String>>;

    /// Take a stored exchange. A second call for the same id returns `None`.
    async fn recover(&self, exchange_id: &str) -> Result<Option<Exchange>>;

    /// Store `completed` as a finished group of `key`, scannable until it is
    /// confirmed or recovered
    async fn store_completed(&self, key: &str, completed: &Exchange) -> Result<()>;

    fn recovery_interval(&self) -> Duration;

    /// Recovery attempts before a group is moved to [`Self::dead_letter_uri`]
    fn maximum_redeliveries(&self) -> Option<u32> {
        None
    }

    fn dead_letter_uri(&self) -> Option<&str> {
        None
    }
}
