//! Recoverable repository: any inner repository plus a durable copy

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use fc_common::{headers, properties, Exchange};
use tracing::{debug, info};

use super::store::{DurableStore, StoredExchange};
use super::{AggregationRepository, OptimisticLocking, Recoverable};
use crate::{MediationError, Result};

/// Persists every group to a [`DurableStore`]. Completing a group stores the
/// completed exchange in place of the group's copy, confirming it deletes
/// that. Anything in the store without a live group (completed but
/// unconfirmed, or left behind by a crash) is returned by `scan`.
pub struct RecoverableAggregationRepository {
    inner: Arc<dyn AggregationRepository>,
    store: Arc<dyn DurableStore>,
    recovery_interval: Duration,
    maximum_redeliveries: Option<u32>,
    dead_letter_uri: Option<String>,
    /// Correlation key to the id of its stored exchange
    live: DashMap<String, String>,
}

impl RecoverableAggregationRepository {
    pub fn new(inner: Arc<dyn AggregationRepository>, store: Arc<dyn DurableStore>) -> Self {
        Self {
            inner,
            store,
            recovery_interval: Duration::from_secs(5),
            maximum_redeliveries: None,
            dead_letter_uri: None,
            live: DashMap::new(),
        }
    }

    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Give up re-emitting a recovered group after `max` attempts
    pub fn with_maximum_redeliveries(mut self, max: u32) -> Self {
        self.maximum_redeliveries = Some(max);
        self
    }

    /// Where recovered groups go once their attempts are used up
    pub fn with_dead_letter_uri(mut self, uri: &str) -> Self {
        self.dead_letter_uri = Some(uri.to_string());
        self
    }

    pub fn inner(&self) -> &Arc<dyn AggregationRepository> {
        &self.inner
    }

    async fn persist(&self, key: &str, stored: &Exchange) -> Result<()> {
        let entry = StoredExchange {
            correlation_key: key.to_string(),
            completed: false,
            exchange: stored.clone(),
        };
        self.store.put(&entry).await?;
        if let Some(previous) = self.live.insert(key.to_string(), stored.id().to_string()) {
            if previous != stored.id() {
                self.store.delete(&previous).await?;
            }
        }
        Ok(())
    }

    /// Store `completed` for `key`, then drop the copy it supersedes. The
    /// superseded copy stays live until then so `scan` never sees it.
    async fn record_completed(&self, key: &str, completed: &Exchange, superseded: Option<&str>) -> Result<()> {
        let entry = StoredExchange {
            correlation_key: key.to_string(),
            completed: true,
            exchange: completed.clone(),
        };
        self.store.put(&entry).await?;
        if let Some(superseded) = superseded {
            if superseded != completed.id() {
                self.store.delete(superseded).await?;
            }
            self.live.remove_if(key, |_, id| id == superseded);
        }
        Ok(())
    }

    fn cas(&self) -> Result<&dyn OptimisticLocking> {
        self.inner
            .optimistic_locking()
            .ok_or_else(|| MediationError::Config("inner repository does not support optimistic locking".to_string()))
    }
}

#[async_trait]
impl AggregationRepository for RecoverableAggregationRepository {
    async fn add(&self, key: &str, exchange: Exchange) -> Result<Option<Exchange>> {
        let previous = self.inner.add(key, exchange).await?;
        if let Some(stored) = self.inner.get(key).await? {
            self.persist(key, &stored).await?;
        }
        Ok(previous)
    }

    async fn get(&self, key: &str) -> Result<Option<Exchange>> {
        self.inner.get(key).await
    }

    async fn remove(&self, key: &str) -> Result<Option<Exchange>> {
        let removed = self.inner.remove(key).await?;
        if let Some(removed) = &removed {
            self.record_completed(key, removed, Some(removed.id())).await?;
        }
        Ok(removed)
    }

    async fn complete(&self, key: &str, completed: &Exchange) -> Result<()> {
        let removed = self.inner.remove(key).await?;
        self.record_completed(key, completed, removed.as_ref().map(Exchange::id))
            .await
    }

    async fn confirm(&self, exchange_id: &str) -> Result<()> {
        debug!(exchange_id, "Confirming completed aggregation");
        self.store.delete(exchange_id).await
    }

    fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }

    fn optimistic_locking(&self) -> Option<&dyn OptimisticLocking> {
        if self.inner.supports_optimistic_locking() {
            Some(self)
        } else {
            None
        }
    }

    fn recoverable(&self) -> Option<&dyn Recoverable> {
        Some(self)
    }
}

#[async_trait]
impl OptimisticLocking for RecoverableAggregationRepository {
    async fn add_expected(
        &self,
        key: &str,
        expected: Option<&Exchange>,
        exchange: Exchange,
    ) -> Result<Option<Exchange>> {
        let previous = self.cas()?.add_expected(key, expected, exchange).await?;
        if let Some(stored) = self.inner.get(key).await? {
            self.persist(key, &stored).await?;
        }
        Ok(previous)
    }

    async fn remove_expected(&self, key: &str, expected: &Exchange) -> Result<()> {
        self.cas()?.remove_expected(key, expected).await?;
        self.record_completed(key, expected, Some(expected.id())).await
    }

    async fn complete_expected(&self, key: &str, expected: Option<&Exchange>, completed: &Exchange) -> Result<()> {
        self.cas()?.complete_expected(key, expected, completed).await?;
        self.record_completed(key, completed, expected.map(Exchange::id)).await
    }
}

#[async_trait]
impl Recoverable for RecoverableAggregationRepository {
    async fn scan(&self) -> Result<HashSet<String>> {
        let live: HashSet<String> = self.live.iter().map(|e| e.value().clone()).collect();
        let pending: HashSet<String> = self
            .store
            .ids()
            .await?
            .into_iter()
            .filter(|id| !live.contains(id))
            .collect();
        if !pending.is_empty() {
            info!(count = pending.len(), "Scanned aggregation store for exchanges to recover");
        }
        Ok(pending)
    }

    async fn recover(&self, exchange_id: &str) -> Result<Option<Exchange>> {
        let Some(entry) = self.store.take(exchange_id).await? else {
            return Ok(None);
        };
        let mut exchange = entry.exchange;
        exchange.set_property(properties::AGGREGATED_CORRELATION_KEY, entry.correlation_key);
        exchange.in_message_mut().set_header(headers::REDELIVERED, true);
        debug!(exchange_id, completed = entry.completed, "Recovered aggregated exchange");
        Ok(Some(exchange))
    }

    async fn store_completed(&self, key: &str, completed: &Exchange) -> Result<()> {
        self.record_completed(key, completed, None).await
    }

    fn recovery_interval(&self) -> Duration {
        self.recovery_interval
    }

    fn maximum_redeliveries(&self) -> Option<u32> {
        self.maximum_redeliveries
    }

    fn dead_letter_uri(&self) -> Option<&str> {
        self.dead_letter_uri.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{InMemoryDurableStore, MemoryAggregationRepository};
    use serde_json::json;

    fn repository(store: Arc<InMemoryDurableStore>) -> RecoverableAggregationRepository {
        RecoverableAggregationRepository::new(Arc::new(MemoryAggregationRepository::with_optimistic_locking()), store)
    }

    #[tokio::test]
    async fn test_capabilities_forwarded() {
        let repo = repository(Arc::new(InMemoryDurableStore::new()));
        assert!(repo.supports_recovery());
        assert!(repo.supports_optimistic_locking());

        let plain = RecoverableAggregationRepository::new(
            Arc::new(MemoryAggregationRepository::new()),
            Arc::new(InMemoryDurableStore::new()),
        );
        assert!(plain.supports_recovery());
        assert!(!plain.supports_optimistic_locking());
    }

    #[tokio::test]
    async fn test_live_groups_are_not_scanned() {
        let store = Arc::new(InMemoryDurableStore::new());
        let repo = repository(store.clone());

        repo.add("a", Exchange::new(json!(1))).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(repo.scan().await.unwrap().is_empty());

        // Replacing the group with a new exchange drops the old copy
        repo.add("a", Exchange::new(json!(2))).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_completed_until_confirmed() {
        let store = Arc::new(InMemoryDurableStore::new());
        let repo = repository(store.clone());

        repo.add("a", Exchange::new(json!(1))).await.unwrap();
        let removed = repo.remove("a").await.unwrap().unwrap();

        let pending = repo.scan().await.unwrap();
        assert!(pending.contains(removed.id()));

        repo.confirm(removed.id()).await.unwrap();
        assert!(repo.scan().await.unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_completed_exchange_replaces_group_copy() {
        let store = Arc::new(InMemoryDurableStore::new());
        let repo = repository(store.clone());
        let cas = repo.optimistic_locking().unwrap();

        repo.add("a", Exchange::new(json!([1]))).await.unwrap();
        let group = repo.get("a").await.unwrap().unwrap();

        // A merge that returns a fresh exchange completes under a new id
        let completed = Exchange::new(json!([1, 2]));
        cas.complete_expected("a", Some(&group), &completed).await.unwrap();

        let pending = repo.scan().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending.contains(completed.id()));

        repo.confirm(completed.id()).await.unwrap();
        assert!(store.is_empty());
        assert!(repo.recover(completed.id()).await.unwrap().is_none());
        assert!(repo.recover(group.id()).await.unwrap().is_none());
    }
}
