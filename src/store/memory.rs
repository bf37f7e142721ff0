use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Container, DocumentStore, Versioned};
use crate::types::{FeedConfig, FeedPollState, NewsreelError, Result, StoryCluster};

struct Entry {
    body: serde_json::Value,
    version: i64,
}

struct LeaseEntry {
    holder: String,
    expires_at: Instant,
}

/// In-memory stand-in for `PgStore`, used by unit and component tests that
/// should not require a live Postgres instance.
#[derive(Default)]
pub struct InMemoryStore {
    documents: Mutex<HashMap<(String, String, String), Entry>>,
    checkpoints: Mutex<HashMap<String, i64>>,
    leases: Mutex<HashMap<String, LeaseEntry>>,
    notifications: Mutex<std::collections::HashSet<String>>,
    feed_configs: Mutex<Vec<FeedConfig>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_feed_config(&self, config: FeedConfig) {
        self.feed_configs.lock().unwrap().push(config);
    }

    fn key(container: Container, partition_key: &str, id: &str) -> (String, String, String) {
        (container.as_str().to_string(), partition_key.to_string(), id.to_string())
    }

    fn all_in_container<T: serde::de::DeserializeOwned>(&self, container: Container) -> Vec<Versioned<T>> {
        let docs = self.documents.lock().unwrap();
        docs.iter()
            .filter(|((c, _, _), _)| c == container.as_str())
            .filter_map(|(_, e)| serde_json::from_value(e.body.clone()).ok().map(|value| Versioned { value, version: e.version }))
            .collect()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn upsert_json(
        &self,
        container: Container,
        partition_key: &str,
        id: &str,
        value: serde_json::Value,
    ) -> Result<i64> {
        let mut docs = self.documents.lock().unwrap();
        let key = Self::key(container, partition_key, id);
        let version = match docs.get(&key) {
            Some(existing) => existing.version + 1,
            None => 1,
        };
        docs.insert(key, Entry { body: value, version });
        Ok(version)
    }

    async fn get_json(
        &self,
        container: Container,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<Versioned<serde_json::Value>>> {
        let docs = self.documents.lock().unwrap();
        Ok(docs
            .get(&Self::key(container, partition_key, id))
            .map(|e| Versioned { value: e.body.clone(), version: e.version }))
    }

    async fn compare_and_swap_json(
        &self,
        container: Container,
        partition_key: &str,
        id: &str,
        expected_version: i64,
        value: serde_json::Value,
    ) -> Result<i64> {
        let mut docs = self.documents.lock().unwrap();
        let key = Self::key(container, partition_key, id);
        match docs.get(&key) {
            Some(existing) if existing.version == expected_version => {
                let version = existing.version + 1;
                docs.insert(key, Entry { body: value, version });
                Ok(version)
            }
            _ => Err(NewsreelError::Conflict { entity: format!("{}/{}/{}", container.as_str(), partition_key, id) }),
        }
    }

    async fn commit_checkpoint(&self, lease_key: &str, checkpoint: i64) -> Result<()> {
        self.checkpoints.lock().unwrap().insert(lease_key.to_string(), checkpoint);
        Ok(())
    }

    async fn read_checkpoint(&self, lease_key: &str) -> Result<i64> {
        Ok(*self.checkpoints.lock().unwrap().get(lease_key).unwrap_or(&0))
    }

    async fn try_acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap();
        let now = Instant::now();
        if let Some(existing) = leases.get(key) {
            if existing.expires_at > now && existing.holder != holder {
                return Ok(false);
            }
        }
        leases.insert(key.to_string(), LeaseEntry { holder: holder.to_string(), expires_at: now + ttl });
        Ok(true)
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().unwrap();
        if leases.get(key).map(|e| e.holder == holder).unwrap_or(false) {
            leases.remove(key);
        }
        Ok(())
    }

    async fn query_cluster_candidates(
        &self,
        category: &str,
        updated_after: DateTime<Utc>,
        published_after: DateTime<Utc>,
        published_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Versioned<StoryCluster>>> {
        let mut matches: Vec<Versioned<StoryCluster>> = self
            .all_in_container::<StoryCluster>(Container::StoryClusters)
            .into_iter()
            .filter(|v| {
                v.value.category == category
                    && v.value.last_updated >= updated_after
                    && v.value.first_seen >= published_after
                    && v.value.first_seen <= published_before
            })
            .collect();
        matches.sort_by(|a, b| b.value.last_updated.cmp(&a.value.last_updated));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn query_feeds_due(&self, limit: usize) -> Result<Vec<FeedPollState>> {
        let mut states: Vec<FeedPollState> = self
            .all_in_container::<FeedPollState>(Container::FeedPollState)
            .into_iter()
            .map(|v| v.value)
            .collect();
        states.sort_by(|a, b| a.last_poll_at.cmp(&b.last_poll_at));
        states.truncate(limit);
        Ok(states)
    }

    async fn list_all_feed_configs(&self) -> Result<Vec<FeedConfig>> {
        Ok(self.feed_configs.lock().unwrap().clone())
    }

    async fn query_batch_summary_candidates(
        &self,
        older_than: DateTime<Utc>,
        min_source_delta: usize,
        limit: usize,
    ) -> Result<Vec<Versioned<StoryCluster>>> {
        let mut matches: Vec<Versioned<StoryCluster>> = self
            .all_in_container::<StoryCluster>(Container::StoryClusters)
            .into_iter()
            .filter(|v| {
                v.value.first_seen <= older_than
                    && match &v.value.summary {
                        None => true,
                        Some(s) => v.value.source_articles.len() >= s.source_count_at_generation + min_source_delta,
                    }
            })
            .collect();
        matches.truncate(limit);
        Ok(matches)
    }

    async fn query_breaking_clusters(&self) -> Result<Vec<Versioned<StoryCluster>>> {
        Ok(self
            .all_in_container::<StoryCluster>(Container::StoryClusters)
            .into_iter()
            .filter(|v| v.value.status == crate::types::ClusterStatus::Breaking)
            .collect())
    }

    async fn has_notification(&self, story_id: &str) -> Result<bool> {
        Ok(self.notifications.lock().unwrap().contains(story_id))
    }

    async fn record_notification(&self, story_id: &str) -> Result<()> {
        self.notifications.lock().unwrap().insert(story_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocumentStoreExt;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = InMemoryStore::new();
        let version = store.upsert(Container::RawArticles, "2026-07-30", "a1", &serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(version, 1);
        let got: Versioned<serde_json::Value> = store.get(Container::RawArticles, "2026-07-30", "a1").await.unwrap().unwrap();
        assert_eq!(got.version, 1);
        assert_eq!(got.value["x"], 1);
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_version() {
        let store = InMemoryStore::new();
        store.upsert(Container::StoryClusters, "world", "c1", &serde_json::json!({"v": 1})).await.unwrap();
        let result = store.compare_and_swap(Container::StoryClusters, "world", "c1", 99, &serde_json::json!({"v": 2})).await;
        assert!(matches!(result, Err(NewsreelError::Conflict { .. })));
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let store = InMemoryStore::new();
        assert!(store.try_acquire_lease("cluster:c1", "worker-a", Duration::from_secs(30)).await.unwrap());
        assert!(!store.try_acquire_lease("cluster:c1", "worker-b", Duration::from_secs(30)).await.unwrap());
        store.release_lease("cluster:c1", "worker-a").await.unwrap();
        assert!(store.try_acquire_lease("cluster:c1", "worker-b", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn notification_record_is_idempotent() {
        let store = InMemoryStore::new();
        assert!(!store.has_notification("c1").await.unwrap());
        store.record_notification("c1").await.unwrap();
        store.record_notification("c1").await.unwrap();
        assert!(store.has_notification("c1").await.unwrap());
    }
}
