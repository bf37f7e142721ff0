mod memory;
mod postgres_store;

pub use memory::InMemoryStore;
pub use postgres_store::PgStore;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::types::{FeedPollState, Result, StoryCluster};

/// Which logical collection a document lives in. Mirrors the four
/// partitioned collections of the persisted state layout: raw articles
/// (partition: published date), clusters (partition: category), feed state
/// (partition: feed id), leases (partition: lease key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    RawArticles,
    StoryClusters,
    FeedPollState,
    Leases,
}

impl Container {
    pub fn as_str(&self) -> &'static str {
        match self {
            Container::RawArticles => "raw_articles",
            Container::StoryClusters => "story_clusters",
            Container::FeedPollState => "feed_poll_state",
            Container::Leases => "leases",
        }
    }
}

/// One mutation delivered to a change-stream subscriber.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub container: Container,
    pub partition: String,
    pub id: String,
    /// Monotonic within a partition; also the resumable checkpoint value.
    pub seq: i64,
    pub op: ChangeOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
}

/// A versioned document as stored: the raw JSON payload plus the optimistic
/// concurrency token the caller must present on `compare_and_swap`.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub version: i64,
}

/// Abstract document store contract: upsert, point read, secondary-attribute
/// query, change subscription, TTL, optimistic concurrency. Components
/// depend only on this trait object, never on
/// `sqlx` directly, so the backing store (Postgres here; Cosmos DB in
/// production) is swappable and unit tests can run against
/// `InMemoryStore`. Payloads cross the trait boundary as `serde_json::Value`
/// (rather than a generic parameter) so the trait stays object-safe and
/// components can share one `Arc<dyn DocumentStore>`; `DocumentStoreExt`
/// below gives back the typed convenience the generic form would have had.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Unconditional upsert by `(container, partition_key, id)`. Returns the
    /// new version token.
    async fn upsert_json(
        &self,
        container: Container,
        partition_key: &str,
        id: &str,
        value: serde_json::Value,
    ) -> Result<i64>;

    /// Point read by `(container, partition_key, id)`.
    async fn get_json(
        &self,
        container: Container,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<Versioned<serde_json::Value>>>;

    /// Writes `value` only if the stored version still equals `expected_version`.
    /// Returns `Err(Conflict)` on a lost race; callers re-read and retry.
    async fn compare_and_swap_json(
        &self,
        container: Container,
        partition_key: &str,
        id: &str,
        expected_version: i64,
        value: serde_json::Value,
    ) -> Result<i64>;

    /// Advances (or creates) a named consumer lease to `checkpoint`.
    async fn commit_checkpoint(&self, lease_key: &str, checkpoint: i64) -> Result<()>;

    /// Reads a consumer's last committed checkpoint, 0 if never committed.
    async fn read_checkpoint(&self, lease_key: &str) -> Result<i64>;

    /// Acquires a short-TTL advisory lease, used by the summarizer to ensure
    /// at-most-one in-flight job per cluster. Returns false if already held.
    async fn try_acquire_lease(&self, key: &str, holder: &str, ttl: std::time::Duration) -> Result<bool>;

    async fn release_lease(&self, key: &str, holder: &str) -> Result<()>;

    /// Clustering candidate retrieval: clusters in `category` with
    /// `last_updated` within the last 7 days and `published_at` within the
    /// configured window of `published_at`, newest-updated first, capped
    /// at `limit`.
    async fn query_cluster_candidates(
        &self,
        category: &str,
        updated_after: chrono::DateTime<chrono::Utc>,
        published_after: chrono::DateTime<chrono::Utc>,
        published_before: chrono::DateTime<chrono::Utc>,
        limit: usize,
    ) -> Result<Vec<Versioned<StoryCluster>>>;

    /// Poller scheduling: feeds ordered oldest-`last_poll_at`-first.
    async fn query_feeds_due(&self, limit: usize) -> Result<Vec<FeedPollState>>;

    async fn list_all_feed_configs(&self) -> Result<Vec<crate::types::FeedConfig>>;

    /// Clusters eligible for batch summarization: older than a short
    /// horizon, summary missing or stale.
    async fn query_batch_summary_candidates(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
        min_source_delta: usize,
        limit: usize,
    ) -> Result<Vec<Versioned<StoryCluster>>>;

    /// Clusters currently BREAKING, for the periodic monitor (C6).
    async fn query_breaking_clusters(&self) -> Result<Vec<Versioned<StoryCluster>>>;

    async fn has_notification(&self, story_id: &str) -> Result<bool>;

    async fn record_notification(&self, story_id: &str) -> Result<()>;
}

/// Typed convenience on top of the object-safe `DocumentStore` trait.
#[async_trait]
pub trait DocumentStoreExt: DocumentStore {
    async fn upsert<T: Serialize + Sync>(
        &self,
        container: Container,
        partition_key: &str,
        id: &str,
        value: &T,
    ) -> Result<i64> {
        self.upsert_json(container, partition_key, id, serde_json::to_value(value)?).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        container: Container,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<Versioned<T>>> {
        match self.get_json(container, partition_key, id).await? {
            None => Ok(None),
            Some(v) => Ok(Some(Versioned { value: serde_json::from_value(v.value)?, version: v.version })),
        }
    }

    async fn compare_and_swap<T: Serialize + Sync>(
        &self,
        container: Container,
        partition_key: &str,
        id: &str,
        expected_version: i64,
        value: &T,
    ) -> Result<i64> {
        self.compare_and_swap_json(container, partition_key, id, expected_version, serde_json::to_value(value)?)
            .await
    }
}

impl<T: DocumentStore + ?Sized> DocumentStoreExt for T {}
