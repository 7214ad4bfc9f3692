//! FlowCatalyst Mediator
//!
//! Runs a single order-batching route on the mediation engine. Each line read
//! from stdin becomes an exchange (JSON bodies are used as-is, anything else is
//! wrapped as `{"text": ...}`). Orders are grouped per customer and every
//! completed batch is logged. Failures are retried with the configured
//! redelivery policy and parked on `log:dead-letter`.
//!
//! ## Configuration
//!
//! The first argument names a TOML config file. Otherwise the standard search
//! paths and `FLOWCATALYST_*` environment variables apply (see `fc-config`).
//! With `aggregation.store_dir` set, open batches survive a restart.
//!
//! The process stops gracefully on Ctrl+C, SIGTERM or end of input.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use fc_common::Exchange;
use fc_config::{ConfigLoader, MediationConfig};
use fc_mediation::aggregation::correlate_by_body_field;
use fc_mediation::{
    AggregationRepository, Aggregator, ErrorHandlerBuilder, FileDurableStore, FnProcessor, InMemoryQueueConsumer,
    MediationContext, MemoryAggregationRepository, Processor, RecoverableAggregationRepository, RouteBuilder,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

const ROUTE_ID: &str = "orders";
const DEFAULT_BATCH_SIZE: usize = 3;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    fc_common::logging::init_logging("fc-mediator");

    let loader = match std::env::args().nth(1) {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load()?;

    info!(context = %config.context.name, "Starting FlowCatalyst Mediator");

    if config.metrics.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics.port));
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(%addr, "Prometheus metrics endpoint enabled");
    }

    let context = Arc::new(MediationContext::from_config(&config)?);
    if config.dead_letter.dead_letter_uri.is_none() {
        context.set_default_error_handler(
            ErrorHandlerBuilder::dead_letter_channel("log:dead-letter")
                .redelivery_policy(context.default_redelivery_policy().clone())
                .use_original_message(),
        );
    }

    let consumer = Arc::new(InMemoryQueueConsumer::new(ROUTE_ID, 2).with_capacity(1000));
    let aggregator = build_aggregator(&config).await?;
    let route = RouteBuilder::new(ROUTE_ID)
        .from(consumer.clone())
        .process(enrich())
        .aggregate(aggregator.clone());
    context.add_route(route).await?;
    context.start().await?;

    log_startup_summary(&config, &aggregator);

    let input_closed = tokio::select! {
        _ = read_input(consumer.clone()) => true,
        _ = shutdown_signal() => false,
    };
    if input_closed {
        info!(queued = consumer.queue_size(), "Input closed, draining buffered orders");
        while consumer.queue_size() > 0 || context.inflight_repository().size() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    } else {
        info!("Shutdown signal received");
    }

    let outcome = context.stop().await?;
    if outcome.timed_out {
        warn!(
            aborted = outcome.aborted_exchange_ids.len(),
            "Shutdown timed out, some exchanges were aborted"
        );
    }
    info!(
        processed = consumer.processed_count(),
        failed = consumer.failed_count(),
        batches = aggregator.completed_count(),
        "FlowCatalyst Mediator stopped"
    );
    Ok(())
}

async fn build_aggregator(config: &MediationConfig) -> Result<Arc<Aggregator>> {
    let settings = &config.aggregation;
    let memory: Arc<dyn AggregationRepository> = if settings.optimistic_locking {
        Arc::new(MemoryAggregationRepository::with_optimistic_locking())
    } else {
        Arc::new(MemoryAggregationRepository::new())
    };

    let repository: Arc<dyn AggregationRepository> = match &settings.store_dir {
        Some(dir) => {
            let store = Arc::new(FileDurableStore::open(dir).await?);
            info!(dir = %dir, "Open batches are persisted");
            let mut recoverable = RecoverableAggregationRepository::new(memory, store)
                .with_recovery_interval(Duration::from_millis(settings.recovery_interval_ms.max(1)));
            if let Some(max) = settings.recovery_maximum_redeliveries {
                recoverable = recoverable.with_maximum_redeliveries(max);
            }
            if let Some(uri) = &settings.recovery_dead_letter_uri {
                recoverable = recoverable.with_dead_letter_uri(uri);
            }
            Arc::new(recoverable)
        }
        None => memory,
    };

    let mut builder = Aggregator::builder(
        "customer-batches",
        correlate_by_body_field("customer"),
        Arc::new(batch_orders),
        Arc::new(BatchLogger),
    )
    .repository(repository)
    .settings(settings);
    if settings.completion_size.is_none() {
        builder = builder.completion_size(DEFAULT_BATCH_SIZE).force_completion_on_stop(true);
    }
    Ok(builder.build()?)
}

/// Folds each order into a `{customer, orders}` batch
fn batch_orders(old: Option<Exchange>, new: Exchange) -> Exchange {
    let order = new.in_message().body.clone();
    match old {
        None => {
            let mut batch = new;
            batch.in_message_mut().body = json!({
                "customer": order.get("customer").cloned().unwrap_or(Value::Null),
                "orders": [order],
            });
            batch
        }
        Some(mut batch) => {
            if let Some(orders) = batch
                .in_message_mut()
                .body
                .get_mut("orders")
                .and_then(Value::as_array_mut)
            {
                orders.push(order);
            }
            batch
        }
    }
}

fn enrich() -> Arc<dyn Processor> {
    Arc::new(FnProcessor::new(|exchange: &mut Exchange| {
        if exchange.in_message().body.get("customer").is_none() {
            anyhow::bail!("order without customer");
        }
        exchange.in_message_mut().set_header("received_at", chrono::Utc::now().to_rfc3339());
        Ok(())
    }))
}

struct BatchLogger;

#[async_trait]
impl Processor for BatchLogger {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let body = &exchange.in_message().body;
        let size = body.get("orders").and_then(Value::as_array).map_or(0, Vec::len);
        let customer = body.get("customer").cloned().unwrap_or(Value::Null);
        info!(
            customer = %customer,
            orders = size,
            exchange_id = %exchange.id(),
            "Completed batch"
        );
        Ok(())
    }
}

async fn read_input(consumer: Arc<InMemoryQueueConsumer>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "Failed to read input");
                return;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let body = serde_json::from_str::<Value>(line).unwrap_or_else(|_| json!({ "text": line }));
        if let Err(e) = consumer.offer(Exchange::new(body)) {
            warn!(error = %e, "Input line was not accepted");
        }
    }
}

fn log_startup_summary(config: &MediationConfig, aggregator: &Aggregator) {
    info!("=== FlowCatalyst Mediator Startup Summary ===");
    info!("  Route: {} ({})", ROUTE_ID, aggregator.id());
    info!(
        "  Redelivery: {} attempts, {}ms delay",
        config.redelivery.maximum_redeliveries, config.redelivery.redelivery_delay_ms
    );
    match &config.aggregation.store_dir {
        Some(dir) => info!("  Aggregation store: {}", dir),
        None => info!("  Aggregation store: memory only"),
    }
    info!("  Shutdown timeout: {}ms", config.shutdown.timeout_ms);
    info!("=============================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
