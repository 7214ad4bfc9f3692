//! In-memory aggregation repository

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fc_common::{properties, Exchange};

use super::{AggregationRepository, OptimisticLocking};
use crate::{MediationError, Result};

/// DashMap-backed repository. With optimistic locking enabled every stored
/// exchange carries a version stamp that compare-and-swap writes check.
pub struct MemoryAggregationRepository {
    groups: DashMap<String, Exchange>,
    optimistic_locking: bool,
    version: AtomicU64,
}

impl Default for MemoryAggregationRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAggregationRepository {
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
            optimistic_locking: false,
            version: AtomicU64::new(0),
        }
    }

    pub fn with_optimistic_locking() -> Self {
        Self {
            optimistic_locking: true,
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn stamp(&self, mut exchange: Exchange) -> Exchange {
        if self.optimistic_locking {
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            exchange.set_property(properties::AGGREGATION_VERSION, version);
        }
        exchange
    }
}

fn version_of(exchange: &Exchange) -> Option<u64> {
    exchange
        .property(properties::AGGREGATION_VERSION)
        .and_then(|v| v.as_u64())
}

fn same_version(stored: &Exchange, expected: &Exchange) -> bool {
    match (version_of(stored), version_of(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => stored.id() == expected.id(),
    }
}

#[async_trait]
impl AggregationRepository for MemoryAggregationRepository {
    async fn add(&self, key: &str, exchange: Exchange) -> Result<Option<Exchange>> {
        let exchange = self.stamp(exchange);
        Ok(self.groups.insert(key.to_string(), exchange))
    }

    async fn get(&self, key: &str) -> Result<Option<Exchange>> {
        Ok(self.groups.get(key).map(|e| e.value().clone()))
    }

    async fn remove(&self, key: &str) -> Result<Option<Exchange>> {
        Ok(self.groups.remove(key).map(|(_, e)| e))
    }

    fn keys(&self) -> Vec<String> {
        self.groups.iter().map(|e| e.key().clone()).collect()
    }

    fn optimistic_locking(&self) -> Option<&dyn OptimisticLocking> {
        if self.optimistic_locking {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl OptimisticLocking for MemoryAggregationRepository {
    async fn add_expected(
        &self,
        key: &str,
        expected: Option<&Exchange>,
        exchange: Exchange,
    ) -> Result<Option<Exchange>> {
        let conflict = || MediationError::OptimisticLocking { key: key.to_string() };
        let exchange = self.stamp(exchange);

        match (self.groups.entry(key.to_string()), expected) {
            (Entry::Vacant(slot), None) => {
                slot.insert(exchange);
                Ok(None)
            }
            (Entry::Occupied(mut slot), Some(expected)) if same_version(slot.get(), expected) => {
                Ok(Some(slot.insert(exchange)))
            }
            _ => Err(conflict()),
        }
    }

    async fn remove_expected(&self, key: &str, expected: &Exchange) -> Result<()> {
        match self.groups.entry(key.to_string()) {
            Entry::Occupied(slot) if same_version(slot.get(), expected) => {
                slot.remove();
                Ok(())
            }
            _ => Err(MediationError::OptimisticLocking { key: key.to_string() }),
        }
    }

    async fn complete_expected(&self, key: &str, expected: Option<&Exchange>, _completed: &Exchange) -> Result<()> {
        match expected {
            Some(expected) => self.remove_expected(key, expected).await,
            None if self.groups.contains_key(key) => Err(MediationError::OptimisticLocking { key: key.to_string() }),
            None => Ok(()),
        }
    }
}
