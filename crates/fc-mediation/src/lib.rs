//! FlowCatalyst Mediation Engine
//!
//! The resilience control plane of the mediation runtime:
//! - ExecutorManager: Thread pool profiles, named pools and their shutdown
//! - RedeliveryPolicy: Delay, backoff and exhaustion rules for failed deliveries
//! - ErrorHandler: Redelivery state machine with optional dead letter channel
//! - Aggregation: Correlated exchange storage, optimistic locking and recovery
//! - ShutdownStrategy: Ordered, timed graceful shutdown of routes
//! - MediationContext: Owns routes and shared services, drives their lifecycle

pub mod aggregation;
pub mod context;
pub mod engine_metrics;
pub mod error;
pub mod error_handler;
pub mod executor;
pub mod lifecycle;
pub mod processor;
pub mod redelivery;
pub mod registry;
pub mod route;
pub mod shutdown;

pub use aggregation::{
    AggregationRepository, AggregationStrategy, Aggregator, AggregatorBuilder, DurableStore, FileDurableStore,
    InMemoryDurableStore, MemoryAggregationRepository, OptimisticLockRetryPolicy, OptimisticLocking, Recoverable,
    RecoverableAggregationRepository,
};
pub use context::{Clock, ContextEvent, ContextStatus, MediationContext, SystemClock};
pub use error::MediationError;
pub use error_handler::{DeliveryHandle, ErrorHandler, ErrorHandlerBuilder, ExceptionPolicy};
pub use executor::{ExecutorManager, PoolStats, RejectedPolicy, ThreadPool, ThreadPoolProfile};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use processor::{FnProcessor, LogProducer, Predicate, Processor, Producer};
pub use redelivery::{DelayPattern, LoggingLevel, RedeliveryPolicy};
pub use registry::Registry;
pub use route::{
    Consumer, InMemoryQueueConsumer, InflightRepository, Pipeline, Route, RouteBuilder, RouteService, RouteStatus,
    ShutdownRoute, ShutdownRunningTask,
};
pub use shutdown::{ShutdownAware, ShutdownOutcome, ShutdownStrategy};

pub type Result<T> = std::result::Result<T, MediationError>;
