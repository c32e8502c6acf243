//! Bootstrap for the `ledger-engine` binary: wires the Postgres store and
//! queue to a pool of processors. Lives in the library so integration tests
//! can reach the configuration and logging helpers.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::{
    mutator::BalanceMutator,
    processor::{ProcessorStats, RetryPolicy, TransactionProcessor},
    queue::{QueueChannel, postgres::PgQueue},
    store::postgres::PgStore,
};

pub mod config;
pub mod logging;

pub use config::{EngineConfig, LogFormat};
pub use logging::init_logging;

pub struct Service {
    pub config: EngineConfig,
}

impl Service {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Runs the consumers until Ctrl-C, then closes the queue and waits for
    /// in-flight deliveries to resolve.
    pub async fn run(self) -> Result<ProcessorStats> {
        let config = self.config;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .context("Failed to connect to the database")?;

        let store = Arc::new(PgStore::new(pool.clone(), config.lock_timeout));
        store
            .migrate()
            .await
            .context("Failed to migrate account tables")?;
        let queue = Arc::new(PgQueue::new(pool, config.poll_interval, config.lease));
        queue
            .migrate()
            .await
            .context("Failed to migrate queue table")?;

        let policy = RetryPolicy {
            max_attempts: config.max_attempts,
        };
        let consumers: Vec<_> = (0..config.consumers)
            .map(|consumer| {
                let processor =
                    TransactionProcessor::new(queue.clone(), BalanceMutator::new(store.clone()))
                        .with_policy(policy)
                        .with_backoff(config.poll_interval);
                tokio::spawn(async move {
                    let stats = processor.run().await;
                    info!(consumer, ?stats, "consumer finished");
                    stats
                })
            })
            .collect();
        info!(consumers = config.consumers, "ledger engine started");

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("shutdown requested");
        queue.close().await;

        let mut total = ProcessorStats::default();
        for joined in join_all(consumers).await {
            total += joined.context("Processor task panicked")?;
        }
        info!(?total, "ledger engine stopped");
        Ok(total)
    }
}
