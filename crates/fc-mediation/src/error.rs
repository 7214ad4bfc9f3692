use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediationError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rejected execution: {0}")]
    RejectedExecution(String),

    #[error("Optimistic locking conflict for key: {key}")]
    OptimisticLocking { key: String },

    #[error("Optimistic locking still failing for key {key} after {attempts} attempts")]
    OptimisticLockingExhausted { key: String, attempts: u32 },

    #[error("Pool not found: {0}")]
    PoolNotFound(String),

    #[error("Thread pool profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Route {0} is not accepting exchanges")]
    NotAccepting(String),

    #[error("Delivery of exchange {0} was cancelled before completing")]
    DeliveryCancelled(String),

    #[error("No correlation key for exchange {0}")]
    MissingCorrelationKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<fc_config::ConfigError> for MediationError {
    fn from(err: fc_config::ConfigError) -> Self {
        MediationError::Config(err.to_string())
    }
}
