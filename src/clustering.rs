//! Clustering Engine (C3): assigns each newly inserted Raw Article to an
//! existing Story Cluster or creates a new one. The matching cascade and
//! topic-conflict predicate are pure functions over primitive inputs
//! (titles, entity sets) so they are unit-testable without a store; the
//! engine itself is a thin orchestration layer around them plus the
//! document store, following the phased-pipeline decomposition the
//! reference material's `story_weaver.rs` uses (materialize/grow as
//! distinct, independently testable steps).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::status::{self, StatusInputs};
use crate::store::{Container, DocumentStore, DocumentStoreExt};
use crate::summarizer::Summarizer;
use crate::types::{ClusterStatus, NewsreelError, RawArticle, Result, StoryCluster};

/// Tokenizes and lowercases a title into a set (stopwords included —
/// Jaccard is computed over raw tokens, not keyword-filtered tokens, since
/// the fuzzy-match threshold was tuned against that).
fn tokenize(title: &str) -> HashSet<String> {
    title
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Jaccard similarity of two titles' token sets.
pub fn jaccard_tokens(a: &str, b: &str) -> f64 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Fixed topic-group table used by the conflict veto below. Coarse,
/// keyword driven; intentionally conservative (few keywords per group)
/// since a false conflict just forces a second-choice candidate or new
/// cluster, while a false non-conflict can merge unrelated stories.
pub(crate) const TOPIC_GROUPS: &[(&str, &[&str])] = &[
    ("crime_violence", &["shot", "shooting", "stabbed", "stabbing", "murder", "killed", "attack", "assault", "arrested", "robbery"]),
    ("medical_health", &["hiv", "cancer", "outbreak", "vaccine", "hospital", "disease", "virus", "health", "medical", "diagnosis"]),
    ("politics", &["election", "president", "senate", "congress", "parliament", "minister", "vote", "policy", "government"]),
    ("sports", &["match", "championship", "tournament", "league", "coach", "goal", "final", "playoffs", "olympics"]),
    ("business", &["earnings", "merger", "acquisition", "stock", "ipo", "bankruptcy", "ceo", "layoffs", "revenue"]),
    ("weather", &["storm", "hurricane", "flood", "earthquake", "wildfire", "tsunami", "tornado", "heatwave", "blizzard"]),
    ("entertainment", &["movie", "album", "concert", "celebrity", "premiere", "festival", "actor", "actress"]),
    ("tech", &["software", "chip", "startup", "app", "ai", "artificial", "algorithm", "breach", "hack"]),
    ("world", &["war", "conflict", "treaty", "summit", "border", "sanctions", "diplomat", "ceasefire"]),
];

fn topic_groups_for(title: &str) -> HashSet<&'static str> {
    let lower = title.to_lowercase();
    TOPIC_GROUPS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(group, _)| *group)
        .collect()
}

/// Two titles conflict iff each maps to at least one topic group and the
/// group-sets are disjoint. Titles mapping to no group never conflict —
/// the predicate can only veto, never force, a match.
pub fn topic_conflict(title_a: &str, title_b: &str) -> bool {
    let ga = topic_groups_for(title_a);
    let gb = topic_groups_for(title_b);
    if ga.is_empty() || gb.is_empty() {
        return false;
    }
    ga.is_disjoint(&gb)
}

fn entity_overlap_count(a: &RawArticle, cluster: &StoryCluster) -> usize {
    a.entities.iter().filter(|e| cluster.entity_histogram.contains_key(&e.text)).count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    Fingerprint,
    FuzzyTitle,
    EntityAndWeakTitle,
}

/// Matching cascade: fingerprint, then fuzzy title, then entity overlap
/// plus a weak title score — first match wins. Pure function over an
/// article and an already-fetched candidate slice; callers retrieve
/// candidates separately so this stays testable without I/O.
pub fn find_match<'a>(article: &RawArticle, candidates: &'a [StoryCluster], cfg: &Config) -> Option<(&'a StoryCluster, MatchReason)> {
    for cluster in candidates {
        if cluster.source_articles.is_empty() {
            continue;
        }
        if article_fingerprint_matches(article, cluster) {
            return Some((cluster, MatchReason::Fingerprint));
        }
    }

    for cluster in candidates {
        let s = jaccard_tokens(&article.title, &cluster.title);
        if s >= cfg.cluster_sim_threshold && !topic_conflict(&article.title, &cluster.title) {
            return Some((cluster, MatchReason::FuzzyTitle));
        }
    }

    for cluster in candidates {
        let s = jaccard_tokens(&article.title, &cluster.title);
        let overlap = entity_overlap_count(article, cluster);
        if overlap >= cfg.cluster_entity_min && s >= 0.40 && !topic_conflict(&article.title, &cluster.title) {
            return Some((cluster, MatchReason::EntityAndWeakTitle));
        }
    }

    None
}

/// The founding article's fingerprint is stashed in `centroid_keywords` as
/// a reserved `fp:`-prefixed entry (clusters have no dedicated fingerprint
/// field), so exact-fingerprint matches are a plain set lookup.
fn article_fingerprint_matches(article: &RawArticle, cluster: &StoryCluster) -> bool {
    cluster.centroid_keywords.contains(&format!("fp:{}", article.story_fingerprint))
}

/// Outcome of `apply_to_existing`: either the write went through, or the
/// candidate was a dead end (same-source collision lost to an
/// already-linked, newer article) and the caller should try the next
/// candidate or fall back to a new cluster.
enum ApplyOutcome {
    Applied(ClusteringOutcome),
    Blocked,
}

pub struct ClusteringOutcome {
    pub cluster_id: String,
    pub created: bool,
    pub status_changed: bool,
    pub new_status: ClusterStatus,
}

pub struct ClusteringEngine {
    store: Arc<dyn DocumentStore>,
    config: Arc<Config>,
    /// Real-time summarization dispatch (§4.5 trigger 1). `None` runs the
    /// engine summary-blind, relying entirely on the summarizer's own batch
    /// sweep — useful for tests that don't wire a provider.
    summarizer: Option<Arc<Summarizer>>,
}

impl ClusteringEngine {
    pub fn new(store: Arc<dyn DocumentStore>, config: Arc<Config>) -> Self {
        Self { store, config, summarizer: None }
    }

    pub fn with_realtime_summarizer(mut self, summarizer: Arc<Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// A newly-linked article is eligible to trigger real-time
    /// summarization only if it carries body text to summarize from (§4.5:
    /// "summarization is skipped if no source has body text to work
    /// from"). Fire-and-forget: a slow or failing provider must never block
    /// the clustering write path.
    fn maybe_dispatch_realtime_summary(&self, cluster_id: String, category: String, article: &RawArticle) {
        let has_body = article.content.as_deref().is_some_and(|c| !c.trim().is_empty())
            || article.description.as_deref().is_some_and(|d| !d.trim().is_empty());
        if !has_body {
            return;
        }
        let Some(summarizer) = self.summarizer.clone() else { return };
        tokio::spawn(async move {
            if let Err(e) = summarizer.try_realtime_summarize(&category, &cluster_id).await {
                warn!(cluster_id, error = %e, "real-time summarization dispatch failed");
            }
        });
    }

    /// Candidate retrieval: same category, `last_updated` within 7 days,
    /// `published_at` within the configured window, capped.
    async fn candidates_for(&self, article: &RawArticle, now: DateTime<Utc>) -> Result<Vec<StoryCluster>> {
        let updated_after = now - Duration::days(7);
        let window = Duration::hours(self.config.cluster_window_hours);
        let versioned = self
            .store
            .query_cluster_candidates(
                &article.category,
                updated_after,
                article.published_at - window,
                article.published_at + window,
                self.config.cluster_candidate_cap,
            )
            .await?;
        Ok(versioned.into_iter().map(|v| v.value).collect())
    }

    /// Processes one newly-inserted article end to end: candidate
    /// retrieval, cascade match, duplicate-source handling, and a
    /// conflict-retried write. Returns the resulting cluster id.
    ///
    /// A matched cluster can turn out to be a dead end (the incoming
    /// article loses a same-source collision to an already-linked, newer
    /// article): rather than dropping the article, the matched cluster is
    /// excluded and the cascade re-runs over the remaining candidates, per
    /// §4.3's "otherwise it is linked to a different cluster ... or starts
    /// a new cluster."
    pub async fn process_article(&self, article: &RawArticle) -> Result<ClusteringOutcome> {
        let now = Utc::now();
        let candidates = self.candidates_for(article, now).await?;
        let mut excluded: HashSet<String> = HashSet::new();

        loop {
            let remaining: Vec<StoryCluster> = candidates.iter().filter(|c| !excluded.contains(&c.id)).cloned().collect();
            match find_match(article, &remaining, &self.config) {
                Some((matched, reason)) => {
                    let matched_id = matched.id.clone();
                    debug!(cluster_id = %matched_id, ?reason, article_id = %article.id, "matched existing cluster");
                    match self.apply_to_existing(matched_id.clone(), article, now).await? {
                        ApplyOutcome::Applied(outcome) => return Ok(outcome),
                        ApplyOutcome::Blocked => {
                            debug!(cluster_id = %matched_id, article_id = %article.id, "match blocked by duplicate-source collision, trying next candidate");
                            excluded.insert(matched_id);
                            continue;
                        }
                    }
                }
                None => return self.create_new_cluster(article, now).await,
            }
        }
    }

    async fn create_new_cluster(&self, article: &RawArticle, now: DateTime<Utc>) -> Result<ClusteringOutcome> {
        let id = Uuid::new_v4().to_string();
        let mut cluster = StoryCluster::new(id.clone(), article.category.clone(), article, now);
        cluster.centroid_keywords.insert(format!("fp:{}", article.story_fingerprint));
        self.store.upsert(Container::StoryClusters, &cluster.category, &cluster.id, &cluster).await?;
        info!(cluster_id = %id, article_id = %article.id, "created new cluster");
        self.maybe_dispatch_realtime_summary(id.clone(), cluster.category.clone(), article);
        Ok(ClusteringOutcome { cluster_id: id, created: true, status_changed: false, new_status: ClusterStatus::Monitoring })
    }

    async fn apply_to_existing(&self, cluster_id: String, article: &RawArticle, now: DateTime<Utc>) -> Result<ApplyOutcome> {
        const MAX_RETRIES: u32 = 5;
        let mut attempt = 0;
        loop {
            let versioned = self
                .store
                .get::<StoryCluster>(Container::StoryClusters, &article.category, &cluster_id)
                .await?
                .ok_or_else(|| NewsreelError::General(format!("cluster {} disappeared", cluster_id)))?;
            let mut cluster = versioned.value;

            // idempotency: the same article id delivered twice by the change
            // stream is a no-op (P8).
            if cluster.source_articles.iter().any(|id| id == &article.id) {
                return Ok(ApplyOutcome::Applied(ClusteringOutcome {
                    cluster_id: cluster.id.clone(),
                    created: false,
                    status_changed: false,
                    new_status: cluster.status,
                }));
            }

            let prev_status = cluster.status;

            // duplicate-source prevention: at most one article per source_id
            // in `source_articles`. If this source already has an article
            // linked, the newer one (by published_at) replaces the older —
            // verification_level is untouched either way since the set of
            // unique source_ids doesn't change.
            let dup_idx = cluster.article_snapshots.iter().position(|s| s.source_id == article.source_id);
            let is_gaining_sources = dup_idx.is_none();

            if let Some(idx) = dup_idx {
                let existing = &cluster.article_snapshots[idx];
                if article.published_at < existing.published_at {
                    // incoming article is older than the one already linked for
                    // this source; it loses this cluster outright — the caller
                    // tries a second-choice candidate or starts a new cluster.
                    return Ok(ApplyOutcome::Blocked);
                }
                let old_id = existing.id.clone();
                cluster.source_articles.retain(|id| id != &old_id);
            }

            cluster.source_articles.push(article.id.clone());
            if let Some(idx) = dup_idx {
                cluster.article_snapshots.remove(idx);
            }
            cluster.article_snapshots.push(crate::types::ArticleSnapshot {
                id: article.id.clone(),
                source_id: article.source_id,
                title: article.title.clone(),
                url: article.url.clone(),
                source_domain: article.source_domain.clone(),
                published_at: article.published_at,
            });
            for e in &article.entities {
                *cluster.entity_histogram.entry(e.text.clone()).or_insert(0) += 1;
            }
            cluster.verification_level = cluster
                .article_snapshots
                .iter()
                .map(|s| s.source_id)
                .collect::<HashSet<_>>()
                .len()
                .max(1);
            if article.title.len() > cluster.title.len() && entity_overlap_count(article, &cluster) >= 3 {
                cluster.title = article.title.clone();
            }
            cluster.update_count += 1;
            cluster.last_updated = now;

            let delta_first = now.signed_duration_since(cluster.first_seen);
            let delta_upd = Duration::zero();
            let new_status = status::next_status(
                &StatusInputs {
                    prev_status,
                    verification_level: cluster.verification_level,
                    delta_first,
                    delta_upd,
                    is_gaining_sources,
                },
                &self.config,
            );
            let status_changed = new_status != prev_status;
            cluster.status = new_status;

            if status_changed && new_status == ClusterStatus::Breaking {
                cluster.breaking_detected_at = Some(now);
                if !cluster.push_notification_sent {
                    cluster.push_notification_sent = true;
                    cluster.push_notification_sent_at = Some(now);
                }
            }

            cluster.confidence_score = status::confidence_score(cluster.verification_level, cluster.update_count);
            cluster.importance_score = status::importance_score(cluster.verification_level, cluster.status, cluster.entity_histogram.len());

            match self.store.compare_and_swap(Container::StoryClusters, &cluster.category, &cluster.id, versioned.version, &cluster).await {
                Ok(_) => {
                    if status_changed {
                        info!(cluster_id = %cluster.id, status = cluster.status.as_str(), "status transition");
                    }
                    self.maybe_dispatch_realtime_summary(cluster.id.clone(), cluster.category.clone(), article);
                    return Ok(ApplyOutcome::Applied(ClusteringOutcome { cluster_id: cluster.id, created: false, status_changed, new_status }));
                }
                Err(NewsreelError::Conflict { .. }) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        return Err(NewsreelError::Conflict { entity: cluster_id });
                    }
                    warn!(cluster_id = %cluster_id, attempt, "optimistic concurrency retry");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drains the raw-article change stream from its persisted checkpoint,
    /// processing each article exactly once per delivery and advancing the
    /// checkpoint only after the cluster write succeeds.
    pub async fn run_once(&self, pg: &crate::store::PgStore, lease_key: &str, batch_size: i64) -> Result<usize> {
        let checkpoint = self.store.read_checkpoint(lease_key).await?;
        let events = pg.poll_changes_all_partitions(Container::RawArticles, checkpoint, batch_size).await?;
        let mut processed = 0;
        for event in &events {
            let article: Option<crate::store::Versioned<RawArticle>> =
                self.store.get(Container::RawArticles, &event.partition, &event.id).await?;
            if let Some(article) = article {
                if article.value.processed {
                    continue;
                }
                match self.process_article(&article.value).await {
                    Ok(_) => {
                        let mut updated = article.value;
                        updated.processed = true;
                        let _ = self
                            .store
                            .compare_and_swap(Container::RawArticles, &updated.published_date.clone(), &updated.id.clone(), article.version, &updated)
                            .await;
                        processed += 1;
                    }
                    Err(e) if !e.is_retryable() => {
                        warn!(article_id = %event.id, error = %e, "quarantining article during clustering");
                    }
                    Err(e) => return Err(e),
                }
            }
            self.store.commit_checkpoint(lease_key, event.seq).await?;
        }
        Ok(processed)
    }

    pub async fn run_forever(&self, pg: Arc<crate::store::PgStore>, lease_key: String) {
        loop {
            match self.run_once(&pg, &lease_key, 100).await {
                Ok(n) if n > 0 => debug!(processed = n, "clustering batch done"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "clustering batch failed"),
            }
            tokio::time::sleep(StdDuration::from_secs(2)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Entity, EntityType, SourceTier};
    use chrono::Utc;

    fn article(title: &str) -> RawArticle {
        RawArticle {
            id: format!("id-{}", title),
            source_id: Uuid::new_v4(),
            source_domain: "example.com".to_string(),
            source_tier: SourceTier::Tier2,
            url: "https://example.com/a".to_string(),
            title: title.to_string(),
            description: None,
            content: None,
            author: None,
            published_at: Utc::now(),
            fetched_at: Utc::now(),
            published_date: "2026-07-30".to_string(),
            language: Some("en".to_string()),
            category: "world".to_string(),
            tags: vec![],
            entities: vec![],
            story_fingerprint: "deadbeef".to_string(),
            exact_hash: "x".to_string(),
            simhash: 0,
            processed: false,
            version: 0,
        }
    }

    fn cluster_with_title(title: &str) -> StoryCluster {
        let now = Utc::now();
        let mut c = StoryCluster::new("c1".to_string(), "world".to_string(), &article(title), now);
        c.title = title.to_string();
        c
    }

    #[test]
    fn jaccard_identical_titles_is_one() {
        assert_eq!(jaccard_tokens("quake hits japan", "quake hits japan"), 1.0);
    }

    #[test]
    fn jaccard_disjoint_titles_is_zero() {
        assert_eq!(jaccard_tokens("quake hits japan", "bakery wins award"), 0.0);
    }

    #[test]
    fn topic_conflict_blocks_crime_vs_medical() {
        assert!(topic_conflict(
            "Sydney dentist denies HIV exposure claims",
            "Teenager stabbed on Sydney train"
        ));
    }

    #[test]
    fn topic_conflict_allows_same_group() {
        assert!(!topic_conflict(
            "Magnitude 7.2 earthquake off Hokkaido",
            "7.2 quake strikes northern Japan"
        ));
    }

    #[test]
    fn topic_conflict_is_false_when_titles_map_to_no_group() {
        assert!(!topic_conflict("Local bakery wins ribbon", "Quiet afternoon downtown"));
    }

    #[test]
    fn fuzzy_match_accepts_above_threshold_without_conflict() {
        let cfg_db = std::env::set_var("DATABASE_URL", "postgres://test/test");
        let _ = cfg_db;
        let cfg = Config::from_env().unwrap();
        let a = article("7.2 quake strikes northern Japan");
        let candidates = vec![cluster_with_title("Magnitude 7.2 earthquake off Hokkaido")];
        let result = find_match(&a, &candidates, &cfg);
        assert!(matches!(result, Some((_, MatchReason::FuzzyTitle))));
    }

    #[test]
    fn scenario_s5_topic_conflict_rejection_yields_no_match() {
        std::env::set_var("DATABASE_URL", "postgres://test/test");
        let cfg = Config::from_env().unwrap();
        // Shares five of six tokens with the candidate (comfortably above the
        // fuzzy-title threshold) so the only thing standing between a match
        // and no match is the topic-conflict veto (outbreak vs. shooting).
        let a = article("Sydney hospital reports major shooting overnight");
        let candidates = vec![cluster_with_title("Sydney hospital reports major outbreak overnight")];
        assert!(jaccard_tokens(&a.title, &candidates[0].title) >= cfg.cluster_sim_threshold);
        assert!(find_match(&a, &candidates, &cfg).is_none());
    }

    #[test]
    fn entity_path_requires_both_overlap_and_weak_title_score() {
        std::env::set_var("DATABASE_URL", "postgres://test/test");
        let cfg = Config::from_env().unwrap();
        let mut a = article("Officials respond after incident");
        a.entities = vec![
            Entity { text: "Tokyo".to_string(), entity_type: EntityType::Loc, salience: 1.0 },
            Entity { text: "Reuters".to_string(), entity_type: EntityType::Org, salience: 1.0 },
            Entity { text: "Japan".to_string(), entity_type: EntityType::Loc, salience: 1.0 },
        ];
        let mut cluster = cluster_with_title("Officials in Tokyo respond quickly");
        cluster.entity_histogram.insert("Tokyo".to_string(), 1);
        cluster.entity_histogram.insert("Reuters".to_string(), 1);
        cluster.entity_histogram.insert("Japan".to_string(), 1);
        let candidates = vec![cluster];
        let result = find_match(&a, &candidates, &cfg);
        assert!(result.is_some());
    }
}
