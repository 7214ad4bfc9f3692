//! Processing seams: processors, producers and predicates

use async_trait::async_trait;
use fc_common::{Exchange, ExchangePattern};
use tracing::{info, warn};

/// A unit of work applied to an exchange
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()>;
}

/// Processor backed by a synchronous closure
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync,
{
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        (self.f)(exchange)
    }
}

/// Sends exchanges to a destination
#[async_trait]
pub trait Producer: Send + Sync {
    fn endpoint_uri(&self) -> &str;

    async fn send(&self, exchange: &mut Exchange, pattern: ExchangePattern) -> anyhow::Result<()>;
}

/// Producer for `log:<name>` endpoints, writes each exchange to the log
pub struct LogProducer {
    uri: String,
}

impl LogProducer {
    pub fn new(name: &str) -> Self {
        Self {
            uri: format!("log:{}", name),
        }
    }
}

#[async_trait]
impl Producer for LogProducer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, exchange: &mut Exchange, pattern: ExchangePattern) -> anyhow::Result<()> {
        match exchange.exception_caught() {
            Some(caught) => warn!(
                endpoint = %self.uri,
                exchange_id = %exchange.id(),
                ?pattern,
                body = %exchange.message().body,
                error = %caught,
                "Exchange"
            ),
            None => info!(
                endpoint = %self.uri,
                exchange_id = %exchange.id(),
                ?pattern,
                body = %exchange.message().body,
                "Exchange"
            ),
        }
        Ok(())
    }
}

/// A boolean test over an exchange
pub trait Predicate: Send + Sync {
    fn matches(&self, exchange: &Exchange) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Exchange) -> bool + Send + Sync,
{
    fn matches(&self, exchange: &Exchange) -> bool {
        self(exchange)
    }
}
