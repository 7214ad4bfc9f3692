//! String-keyed lookup of shared collaborators

use std::sync::Arc;

use dashmap::DashMap;

use crate::error_handler::ErrorHandlerBuilder;
use crate::executor::{ThreadPool, ThreadPoolProfile};
use crate::processor::{LogProducer, Predicate, Producer};
use crate::{MediationError, Result};

/// Resolves named thread pool profiles, error handlers, predicates and endpoints
#[derive(Default)]
pub struct Registry {
    profiles: DashMap<String, ThreadPoolProfile>,
    error_handlers: DashMap<String, ErrorHandlerBuilder>,
    predicates: DashMap<String, Arc<dyn Predicate>>,
    endpoints: DashMap<String, Arc<dyn Producer>>,
    thread_pools: DashMap<String, Arc<ThreadPool>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_profile(&self, profile: ThreadPoolProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn lookup_profile(&self, id: &str) -> Result<ThreadPoolProfile> {
        self.profiles
            .get(id)
            .map(|p| p.value().clone())
            .ok_or_else(|| MediationError::ProfileNotFound(id.to_string()))
    }

    pub fn bind_error_handler(&self, id: &str, builder: ErrorHandlerBuilder) {
        self.error_handlers.insert(id.to_string(), builder);
    }

    pub fn lookup_error_handler(&self, id: &str) -> Result<ErrorHandlerBuilder> {
        self.error_handlers
            .get(id)
            .map(|b| b.value().clone())
            .ok_or_else(|| MediationError::Config(format!("no error handler registered as '{}'", id)))
    }

    pub fn bind_predicate(&self, id: &str, predicate: Arc<dyn Predicate>) {
        self.predicates.insert(id.to_string(), predicate);
    }

    pub fn lookup_predicate(&self, id: &str) -> Result<Arc<dyn Predicate>> {
        self.predicates
            .get(id)
            .map(|p| p.value().clone())
            .ok_or_else(|| MediationError::Config(format!("no predicate registered as '{}'", id)))
    }

    /// Register a producer under its endpoint uri
    pub fn bind_endpoint(&self, producer: Arc<dyn Producer>) {
        self.endpoints.insert(producer.endpoint_uri().to_string(), producer);
    }

    /// `log:` endpoints are created on first lookup
    pub fn lookup_endpoint(&self, uri: &str) -> Result<Arc<dyn Producer>> {
        if let Some(producer) = self.endpoints.get(uri) {
            return Ok(producer.value().clone());
        }
        match uri.strip_prefix("log:") {
            Some(name) if !name.is_empty() => {
                let producer = self
                    .endpoints
                    .entry(uri.to_string())
                    .or_insert_with(|| Arc::new(LogProducer::new(name)))
                    .value()
                    .clone();
                Ok(producer)
            }
            _ => Err(MediationError::EndpointNotFound(uri.to_string())),
        }
    }

    pub fn bind_thread_pool(&self, id: &str, pool: Arc<ThreadPool>) {
        self.thread_pools.insert(id.to_string(), pool);
    }

    pub fn lookup_thread_pool(&self, id: &str) -> Result<Arc<ThreadPool>> {
        self.thread_pools
            .get(id)
            .map(|p| p.value().clone())
            .ok_or_else(|| MediationError::PoolNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_endpoint_created_on_lookup() {
        let registry = Registry::new();
        let first = registry.lookup_endpoint("log:dead").unwrap();
        let second = registry.lookup_endpoint("log:dead").unwrap();
        assert_eq!(first.endpoint_uri(), "log:dead");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_unknown_endpoint() {
        let registry = Registry::new();
        assert!(matches!(
            registry.lookup_endpoint("queue:missing"),
            Err(MediationError::EndpointNotFound(_))
        ));
        assert!(registry.lookup_endpoint("log:").is_err());
    }
}
