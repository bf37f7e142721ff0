use std::sync::Arc;

use chrono::Utc;
use newsreel::clustering::ClusteringEngine;
use newsreel::config::Config;
use newsreel::monitor::Monitor;
use newsreel::notify::LogNotifier;
use newsreel::store::{Container, DocumentStore, DocumentStoreExt, InMemoryStore};
use newsreel::summarizer::{MockSummaryProvider, Summarizer};
use newsreel::types::{ClusterStatus, Entity, EntityType, FeedConfig, RawArticle, SourceTier, StoryCluster};
use uuid::Uuid;

fn test_config() -> Arc<Config> {
    std::env::set_var("DATABASE_URL", "postgres://test/test");
    Arc::new(Config::from_env().unwrap())
}

fn article(title: &str, source_domain: &str, published_at: chrono::DateTime<Utc>) -> RawArticle {
    let entities = vec![
        Entity { text: "Hokkaido".to_string(), entity_type: EntityType::Loc, salience: 1.5 },
        Entity { text: "Japan".to_string(), entity_type: EntityType::Loc, salience: 1.2 },
    ];
    RawArticle {
        id: Uuid::new_v4().to_string(),
        source_id: Uuid::new_v4(),
        source_domain: source_domain.to_string(),
        source_tier: SourceTier::Tier1,
        url: format!("https://{}/story", source_domain),
        title: title.to_string(),
        description: Some("A magnitude 7.2 earthquake struck Hokkaido, Japan early this morning.".to_string()),
        content: None,
        author: None,
        published_at,
        fetched_at: published_at,
        published_date: published_at.format("%Y-%m-%d").to_string(),
        language: Some("en".to_string()),
        category: "world".to_string(),
        tags: vec![],
        entities,
        story_fingerprint: newsreel::normalize::story_fingerprint(title, Some("A magnitude 7.2 earthquake struck Hokkaido, Japan early this morning."), &[]),
        exact_hash: newsreel::normalize::exact_hash(title, source_domain),
        simhash: newsreel::normalize::simhash(title, Some("A magnitude 7.2 earthquake struck Hokkaido, Japan early this morning.")),
        processed: false,
        version: 0,
    }
}

/// Three independent sources report the same earthquake within minutes.
/// The first article creates a MONITORING cluster; the second promotes it
/// to DEVELOPING; the third (within the breaking window) promotes it to
/// BREAKING, and a batch summarization pass then produces a summary
/// without disturbing the cluster's `last_updated`.
#[tokio::test]
async fn three_corroborating_sources_escalate_to_breaking_then_summarize() {
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new());
    let config = test_config();
    let engine = ClusteringEngine::new(store.clone(), config.clone());

    let t0 = Utc::now();
    let a1 = article("Magnitude 7.2 earthquake strikes Hokkaido Japan", "reuters.com", t0);
    let outcome1 = engine.process_article(&a1).await.unwrap();
    assert!(outcome1.created);
    assert_eq!(outcome1.new_status, ClusterStatus::Monitoring);

    let a2 = article("Magnitude 7.2 earthquake strikes Hokkaido Japan coast", "apnews.com", t0 + chrono::Duration::minutes(2));
    let outcome2 = engine.process_article(&a2).await.unwrap();
    assert!(!outcome2.created);
    assert_eq!(outcome2.cluster_id, outcome1.cluster_id);
    assert_eq!(outcome2.new_status, ClusterStatus::Developing);

    let a3 = article("Magnitude 7.2 earthquake strikes Hokkaido Japan region", "bbc.com", t0 + chrono::Duration::minutes(4));
    let outcome3 = engine.process_article(&a3).await.unwrap();
    assert_eq!(outcome3.cluster_id, outcome1.cluster_id);
    assert_eq!(outcome3.new_status, ClusterStatus::Breaking);

    let versioned: newsreel::store::Versioned<StoryCluster> =
        store.get(Container::StoryClusters, "world", &outcome1.cluster_id).await.unwrap().unwrap();
    assert_eq!(versioned.value.source_articles.len(), 3);
    assert_eq!(versioned.value.article_snapshots.len(), 3);

    // Batch candidate selection only picks up clusters older than
    // `batch_backfill_hours` (default 48h), so push this one's `first_seen`
    // back rather than waiting out the real clock.
    let mut backdated = versioned.value.clone();
    backdated.first_seen = Utc::now() - chrono::Duration::hours(config.batch_backfill_hours + 1);
    let last_updated_before_summary = backdated.last_updated;
    store
        .compare_and_swap(Container::StoryClusters, "world", &outcome1.cluster_id, versioned.version, &backdated)
        .await
        .unwrap();

    let provider = Arc::new(MockSummaryProvider::new());
    let summarizer = Summarizer::new(store.clone(), provider, config.clone(), "test-worker".to_string());
    let summarized = summarizer.run_batch_once().await.unwrap();
    assert_eq!(summarized, 1);

    let after: newsreel::store::Versioned<StoryCluster> =
        store.get(Container::StoryClusters, "world", &outcome1.cluster_id).await.unwrap().unwrap();
    assert!(after.value.summary.is_some());
    assert_eq!(after.value.last_updated, last_updated_before_summary);
}

/// A topic-conflicting headline (medical vs. crime) must not merge into an
/// existing cluster even though the titles otherwise overlap well above the
/// fuzzy-title threshold (five of six tokens in common) — the only thing
/// standing between a match and a new cluster here is the topic-conflict
/// veto.
#[tokio::test]
async fn topic_conflicting_headline_does_not_merge() {
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new());
    let config = test_config();
    let engine = ClusteringEngine::new(store.clone(), config.clone());

    let t0 = Utc::now();
    let a1 = article("Sydney hospital reports major outbreak overnight", "abc.net.au", t0);
    let outcome1 = engine.process_article(&a1).await.unwrap();

    let a2 = article("Sydney hospital reports major shooting overnight", "smh.com.au", t0 + chrono::Duration::minutes(1));
    let outcome2 = engine.process_article(&a2).await.unwrap();

    assert!(outcome2.created);
    assert_ne!(outcome1.cluster_id, outcome2.cluster_id);
}

/// A BREAKING cluster with no further updates idles out to VERIFIED once
/// the monitor sweeps past the idle timeout.
#[tokio::test]
async fn monitor_idles_out_stale_breaking_cluster() {
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new());
    let config = test_config();

    let t0 = Utc::now() - chrono::Duration::minutes(200);
    let mut cluster = StoryCluster::new("c1".to_string(), "world".to_string(), &article("Old breaking story", "reuters.com", t0), t0);
    cluster.status = ClusterStatus::Breaking;
    cluster.verification_level = 3;
    cluster.last_updated = Utc::now() - chrono::Duration::minutes(100);
    cluster.breaking_detected_at = Some(t0);
    store.upsert(Container::StoryClusters, "world", "c1", &cluster).await.unwrap();

    let notifier = Arc::new(LogNotifier);
    let monitor = Monitor::new(store.clone(), notifier, config);
    let transitioned = monitor.run_once().await.unwrap();
    assert_eq!(transitioned, 1);

    let after: newsreel::store::Versioned<StoryCluster> = store.get(Container::StoryClusters, "world", "c1").await.unwrap().unwrap();
    assert_eq!(after.value.status, ClusterStatus::Verified);
    assert!(after.value.last_updated > cluster.last_updated);
}

#[tokio::test]
async fn feed_config_round_trips_through_store() {
    let store = InMemoryStore::new();
    let feed = FeedConfig {
        id: Uuid::new_v4(),
        url: "https://example.com/feed.xml".to_string(),
        tier: SourceTier::Tier1,
        category_hint: Some("world".to_string()),
        language: Some("en".to_string()),
    };
    store.seed_feed_config(feed.clone());
    let loaded = store.list_all_feed_configs().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].url, feed.url);
}
