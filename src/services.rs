//! Service composition root.
//!
//! Everything stateful is constructed once here and handed down by `Arc`; no
//! module reaches for a global. Tests build the same graph against mock
//! upstreams and an in-memory store.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::balance::{KeyPool, PoolStats};
use crate::cache::{ShardPool, ShardStats, TieredCache};
use crate::config::Config;
use crate::enrich::{AiClient, Enricher};
use crate::fetch::{Fetcher, HeadlinesApi, TopStoriesApi};
use crate::model::Section;
use crate::queue::{EnrichmentQueue, QueueStats};
use crate::readpath::ReadPath;
use crate::sched::{RotationStatus, Scheduler};
use crate::store::Store;
use crate::threshold::{ThresholdGate, ThresholdStatus};

/// Daily request budgets for the publisher credentials (free tiers).
const TOP_STORIES_DAILY_LIMIT: u64 = 500;
const HEADLINES_DAILY_LIMIT: u64 = 100;

/// Read-only snapshot of every component's state, for the HTTP adapter's
/// status endpoints.
#[derive(Debug, Serialize)]
pub struct Observability {
    pub queue: QueueStats,
    pub ai_credentials: PoolStats,
    pub publisher_credentials: Vec<PoolStats>,
    pub shards: Vec<ShardStats>,
    pub threshold: ThresholdStatus,
    pub rotation: RotationStatus,
}

pub struct Services {
    pub config: Config,
    pub store: Arc<Store>,
    pub shard_pool: Arc<ShardPool>,
    pub cache: Arc<TieredCache>,
    pub enricher: Arc<Enricher>,
    pub queue: Arc<EnrichmentQueue>,
    pub gate: Arc<ThresholdGate>,
    pub fetcher: Arc<Fetcher>,
    pub scheduler: Arc<Scheduler>,
    pub read_path: Arc<ReadPath>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Services {
    /// Build the full service graph from configuration. The store degrades
    /// to its read stub rather than failing the boot; everything else either
    /// constructs cleanly or is a bug.
    pub async fn build(config: Config) -> Result<Self> {
        let store = Arc::new(Store::open_or_stub(&config.store_uri).await);
        if store.is_stub() {
            tracing::error!("Running with in-memory store stub: reads degrade, writes will fail");
        }

        let shard_pool = Arc::new(ShardPool::new(
            config.cache_shards.clone(),
            config.cache_disabled,
        ));
        shard_pool.init().await;
        let cache = Arc::new(TieredCache::new(shard_pool.clone()));

        let ai_pool = Arc::new(KeyPool::new(config.ai_pool_config(), config.ai_keys.clone()));
        if config.ai_keys.is_empty() {
            tracing::warn!("No AI credentials configured; enrichment will use fallback commentary");
        }
        let enricher = Arc::new(Enricher::new(
            cache.clone(),
            store.clone(),
            AiClient::new(&config, ai_pool),
        ));

        let queue = Arc::new(EnrichmentQueue::new(
            cache.clone(),
            store.clone(),
            enricher.clone(),
            config.drain_delay,
        ));
        queue.restore().await;

        let sections = Section::ALL.to_vec();
        let gate = Arc::new(ThresholdGate::new(
            store.clone(),
            config.section_threshold,
            sections.clone(),
        ));

        let top_stories_pool = Arc::new(KeyPool::new(
            config.publisher_pool_config("topstories", TOP_STORIES_DAILY_LIMIT),
            config.publisher_a_key.clone().into_iter().collect(),
        ));
        let headlines_pool = Arc::new(KeyPool::new(
            config.publisher_pool_config("headlines", HEADLINES_DAILY_LIMIT),
            config.publisher_b_keys.clone(),
        ));
        let fetcher = Arc::new(Fetcher::new(
            store.clone(),
            cache.clone(),
            enricher.clone(),
            gate.clone(),
            TopStoriesApi::new(&config.publisher_a_base_url, top_stories_pool),
            HeadlinesApi::new(&config.publisher_b_base_url, headlines_pool),
            config.max_section_cache,
            config.item_pacing,
        ));

        let scheduler = Arc::new(Scheduler::new(
            fetcher.clone(),
            gate.clone(),
            sections,
            config.rotation_period,
        ));
        let read_path = Arc::new(ReadPath::new(cache.clone(), store.clone(), queue.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config,
            store,
            shard_pool,
            cache,
            enricher,
            queue,
            gate,
            fetcher,
            scheduler,
            read_path,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Start the long-lived tasks: queue dispatcher, rotation scheduler, and
    /// the shard health loop. Returned handles complete after
    /// [`Self::shutdown`] in that same order.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let queue_handle = tokio::spawn(self.queue.clone().run(self.shutdown_rx.clone()));
        let scheduler_handle = tokio::spawn(self.scheduler.clone().run(self.shutdown_rx.clone()));

        let pool = self.shard_pool.clone();
        let period = self.config.health_check_period;
        let mut shutdown = self.shutdown_rx.clone();
        let health_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => pool.health_check_once().await,
                    _ = shutdown.changed() => return,
                }
            }
        });

        vec![queue_handle, scheduler_handle, health_handle]
    }

    /// Signal every task to stop. Callers then await the handles from
    /// [`Self::start`] — queue first (it drains its workers), then the
    /// scheduler, then the health loop; adapters close when the last `Arc`
    /// drops.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn observability(&self) -> Result<Observability> {
        Ok(Observability {
            queue: self.queue.stats().await,
            ai_credentials: self.enricher.ai().pool().stats().await,
            publisher_credentials: vec![
                self.fetcher.top_stories().pool().stats().await,
                self.fetcher.headlines().pool().stats().await,
            ],
            shards: self.shard_pool.stats().await,
            threshold: self
                .gate
                .status()
                .await
                .context("threshold status unavailable")?,
            rotation: self.scheduler.status().await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.store_uri = "sqlite::memory:".to_string();
        config.cache_disabled = true;
        config
    }

    #[tokio::test]
    async fn test_build_constructs_full_graph() {
        let services = Services::build(test_config()).await.unwrap();
        assert!(!services.store.is_stub());

        let obs = services.observability().await.unwrap();
        assert_eq!(obs.queue.waiting, 0);
        assert_eq!(obs.rotation.index, 0);
        assert_eq!(obs.rotation.total, Section::ALL.len());
        assert!(!obs.threshold.met);
        assert_eq!(obs.publisher_credentials.len(), 2);
    }

    #[tokio::test]
    async fn test_start_and_shutdown_complete() {
        let services = Services::build(test_config()).await.unwrap();
        let handles = services.start();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        services.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
