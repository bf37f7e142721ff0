//! Top-level facade wiring the document store and every background
//! component together into one per-process handle over the pipeline's
//! four concurrent loops (poller, clustering, summarizer, monitor) plus
//! the feed-management operations the CLI calls directly.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::clustering::ClusteringEngine;
use crate::config::Config;
use crate::monitor::Monitor;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::poller::Poller;
use crate::store::{Container, DocumentStore, DocumentStoreExt, PgStore};
use crate::summarizer::{HttpSummaryProvider, MockSummaryProvider, SummaryProvider, Summarizer};
use crate::types::{FeedConfig, FeedPollState, Result, SourceTier};

pub struct Newsreel {
    pub config: Arc<Config>,
    pub store: Arc<dyn DocumentStore>,
    pg: Arc<PgStore>,
    poller: Arc<Poller>,
    clustering: Arc<ClusteringEngine>,
    summarizer: Arc<Summarizer>,
    monitor: Arc<Monitor>,
}

impl Newsreel {
    pub async fn connect(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let pg = Arc::new(PgStore::connect(&config.database_url).await?);
        let store: Arc<dyn DocumentStore> = pg.clone();

        let notifier: Arc<dyn Notifier> = match &config.llm_api_key {
            Some(_) => Arc::new(LogNotifier),
            None => Arc::new(LogNotifier),
        };
        let provider: Arc<dyn SummaryProvider> = match &config.llm_api_key {
            Some(key) => Arc::new(HttpSummaryProvider::new(config.llm_base_url.clone(), key.clone())),
            None => Arc::new(MockSummaryProvider::new()),
        };

        let poller = Arc::new(Poller::new(store.clone(), config.clone()));
        let summarizer = Arc::new(Summarizer::new(store.clone(), provider, config.clone(), format!("worker-{}", Uuid::new_v4())));
        let clustering = Arc::new(
            ClusteringEngine::new(store.clone(), config.clone()).with_realtime_summarizer(summarizer.clone()),
        );
        let monitor = Arc::new(Monitor::new(store.clone(), notifier, config.clone()));

        Ok(Self { config, store, pg, poller, clustering, summarizer, monitor })
    }

    /// Wires a webhook notifier in place of the default log notifier.
    /// Called by `serve` when `NOTIFY_WEBHOOK_URL` is set.
    pub fn with_webhook_notifier(mut self, webhook_url: String) -> Self {
        self.monitor = Arc::new(Monitor::new(self.store.clone(), Arc::new(WebhookNotifier::new(webhook_url)), self.config.clone()));
        self
    }

    pub async fn add_feed(&self, url: String, tier: SourceTier, category_hint: Option<String>, language: Option<String>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let feed_config = FeedConfig { id, url: url.clone(), tier, category_hint, language };
        self.pg.insert_feed_config(&feed_config).await?;
        let state = FeedPollState::new(&feed_config);
        self.store.upsert(Container::FeedPollState, &id.to_string(), &id.to_string(), &state).await?;
        info!(feed_id = %id, url, "feed registered");
        Ok(id)
    }

    pub async fn stats(&self) -> Result<Stats> {
        let feeds = self.store.list_all_feed_configs().await?;
        let breaking = self.store.query_breaking_clusters().await?;
        Ok(Stats { feed_count: feeds.len(), breaking_cluster_count: breaking.len() })
    }

    /// Spawns the poller, clustering subscriber, summarizer, and monitor as
    /// independent supervised tasks and blocks until one of them exits
    /// (which only happens on an unrecoverable error, since each loop is
    /// itself infinite).
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let poller = self.poller.clone();
        let clustering = self.clustering.clone();
        let pg = self.pg.clone();
        let summarizer = self.summarizer.clone();
        let monitor = self.monitor.clone();

        let poller_handle = tokio::spawn(async move { poller.run_forever().await });
        let clustering_handle = tokio::spawn(async move { clustering.run_forever(pg, "clustering-main".to_string()).await });
        let summarizer_handle = tokio::spawn(async move { summarizer.run_forever().await });
        let monitor_handle = tokio::spawn(async move { monitor.run_forever().await });

        info!("newsreel pipeline started: poller, clustering, summarizer, monitor");

        tokio::select! {
            r = poller_handle => info!(?r, "poller task exited"),
            r = clustering_handle => info!(?r, "clustering task exited"),
            r = summarizer_handle => info!(?r, "summarizer task exited"),
            r = monitor_handle => info!(?r, "monitor task exited"),
        }
        Ok(())
    }
}

pub struct Stats {
    pub feed_count: usize,
    pub breaking_cluster_count: usize,
}
