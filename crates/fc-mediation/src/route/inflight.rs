//! Tracks exchanges currently inside a route pipeline

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::engine_metrics;

#[derive(Debug, Clone)]
pub struct InflightExchange {
    pub exchange_id: String,
    pub route_id: String,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl InflightExchange {
    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Default)]
pub struct InflightRepository {
    entries: DashMap<String, InflightExchange>,
}

impl InflightRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an exchange. It stays inflight until the guard is dropped.
    pub fn add(self: &Arc<Self>, route_id: &str, exchange_id: &str) -> InflightGuard {
        self.entries.insert(
            exchange_id.to_string(),
            InflightExchange {
                exchange_id: exchange_id.to_string(),
                route_id: route_id.to_string(),
                started_at: Utc::now(),
                started: Instant::now(),
            },
        );
        engine_metrics::set_inflight_count(self.entries.len());
        InflightGuard {
            repository: self.clone(),
            exchange_id: exchange_id.to_string(),
        }
    }

    fn remove(&self, exchange_id: &str) {
        self.entries.remove(exchange_id);
        engine_metrics::set_inflight_count(self.entries.len());
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn route_count(&self, route_id: &str) -> usize {
        self.entries.iter().filter(|e| e.route_id == route_id).count()
    }

    pub fn exchange_ids_for_route(&self, route_id: &str) -> Vec<String> {
        self.browse_route(route_id)
            .into_iter()
            .map(|e| e.exchange_id)
            .collect()
    }

    /// All inflight exchanges, oldest first
    pub fn browse(&self) -> Vec<InflightExchange> {
        let mut entries: Vec<InflightExchange> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.started);
        entries
    }

    pub fn browse_route(&self, route_id: &str) -> Vec<InflightExchange> {
        let mut entries: Vec<InflightExchange> = self
            .entries
            .iter()
            .filter(|e| e.route_id == route_id)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by_key(|e| e.started);
        entries
    }

    /// Exchanges inflight for longer than `threshold`
    pub fn stalled(&self, threshold: Duration) -> Vec<InflightExchange> {
        self.browse()
            .into_iter()
            .filter(|e| e.duration() > threshold)
            .collect()
    }
}

/// Removes the exchange from the repository on drop
pub struct InflightGuard {
    repository: Arc<InflightRepository>,
    exchange_id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.repository.remove(&self.exchange_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_inflight() {
        let repo = Arc::new(InflightRepository::new());
        let a = repo.add("orders", "ex-1");
        let _b = repo.add("orders", "ex-2");
        let _c = repo.add("billing", "ex-3");

        assert_eq!(repo.size(), 3);
        assert_eq!(repo.route_count("orders"), 2);
        assert_eq!(repo.exchange_ids_for_route("billing"), vec!["ex-3".to_string()]);

        drop(a);
        assert_eq!(repo.route_count("orders"), 1);
        assert_eq!(repo.browse()[0].exchange_id, "ex-2");
    }

    #[test]
    fn test_stalled() {
        let repo = Arc::new(InflightRepository::new());
        let _g = repo.add("orders", "ex-1");
        assert!(repo.stalled(Duration::from_secs(60)).is_empty());
        assert_eq!(repo.stalled(Duration::ZERO).len(), 1);
    }
}
