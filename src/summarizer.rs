//! Batch Summarizer (C5): generates or refreshes a Story Cluster's summary
//! from its accumulated source articles. Provider-agnostic via the
//! `SummaryProvider` trait, with a deterministic extractive fallback when
//! the model refuses or errors, and an advisory lease so at most one
//! worker summarizes a given cluster at a time.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::store::{Container, DocumentStore, DocumentStoreExt};
use crate::types::{NewsreelError, Result, StoryCluster, Summary};

#[derive(Debug, Clone)]
pub struct SummaryDraft {
    pub text: String,
    pub model_id: String,
    pub cost_usd: f64,
    pub cached_tokens: u32,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A model provider for cluster summarization. `summarize` is the unit of
/// work; `summarize_batch` gets a default sequential implementation so a
/// provider only has to implement the single-item case, the same shape as
/// the reference registry's single adapter trait.
#[async_trait]
pub trait SummaryProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn summarize(&self, cluster: &StoryCluster) -> Result<SummaryDraft>;

    async fn summarize_batch(&self, clusters: &[StoryCluster]) -> Vec<Result<SummaryDraft>> {
        let mut out = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            out.push(self.summarize(cluster).await);
        }
        out
    }
}

/// Deterministic extractive summary used both as a standalone provider for
/// tests/offline runs and as the fallback when a hosted model refuses or
/// errors. Picks the earliest and most recent snapshot titles so the
/// summary reflects both how the story broke and where it stands now.
pub fn extractive_fallback(cluster: &StoryCluster) -> String {
    if cluster.article_snapshots.is_empty() {
        return format!("{} (developing story, sources pending).", cluster.title);
    }
    let mut sorted = cluster.article_snapshots.clone();
    sorted.sort_by_key(|s| s.published_at);
    let first = &sorted[0];
    let latest = sorted.last().unwrap();
    let domains: Vec<&str> = {
        let mut d: Vec<&str> = sorted.iter().map(|s| s.source_domain.as_str()).collect();
        d.sort_unstable();
        d.dedup();
        d
    };
    if first.id == latest.id {
        format!("{} Reported by {}.", cluster.title, domains.join(", "))
    } else {
        format!(
            "{} First reported by {}, most recently corroborated by {}. Covered by {} source{}.",
            cluster.title,
            first.source_domain,
            latest.source_domain,
            domains.len(),
            if domains.len() == 1 { "" } else { "s" }
        )
    }
}

pub struct MockSummaryProvider {
    pub refuse_containing: Option<String>,
}

impl MockSummaryProvider {
    pub fn new() -> Self {
        Self { refuse_containing: None }
    }
}

impl Default for MockSummaryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SummaryProvider for MockSummaryProvider {
    fn provider_name(&self) -> &str {
        "mock"
    }

    async fn summarize(&self, cluster: &StoryCluster) -> Result<SummaryDraft> {
        if let Some(needle) = &self.refuse_containing {
            if cluster.title.to_lowercase().contains(&needle.to_lowercase()) {
                return Err(NewsreelError::ModelRefusal);
            }
        }
        Ok(SummaryDraft {
            text: extractive_fallback(cluster),
            model_id: "mock-extractive".to_string(),
            cost_usd: 0.0,
            cached_tokens: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
        })
    }
}

/// Calls an OpenAI-compatible chat completion endpoint. Detects a model
/// refusal by checking the response text against a small set of stock
/// refusal phrases rather than trusting a structured field, since not
/// every provider surfaces refusals distinctly.
pub struct HttpSummaryProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model_id: String,
}

/// Curated, explicit ground-truth list (the requirements call out that the
/// historical version of this list "grew ad-hoc"). Covers both first-person
/// refusals and the hedging phrasings models use when sources don't give
/// them enough to synthesize from.
const REFUSAL_MARKERS: &[&str] = &[
    "i cannot",
    "i can't",
    "i'm unable to",
    "i am unable to",
    "as an ai language model",
    "cannot create",
    "insufficient information",
    "based on the provided information",
];

impl HttpSummaryProvider {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self { client: reqwest::Client::new(), base_url, api_key, model_id: "claude-3-5-sonnet".to_string() }
    }

    fn build_prompt(cluster: &StoryCluster) -> String {
        let mut prompt = format!("Summarize this developing news story in 2-3 sentences: \"{}\".\n\nSources:\n", cluster.title);
        for snap in &cluster.article_snapshots {
            prompt.push_str(&format!("- {} ({})\n", snap.title, snap.source_domain));
        }
        prompt
    }
}

#[async_trait]
impl SummaryProvider for HttpSummaryProvider {
    fn provider_name(&self) -> &str {
        "http"
    }

    async fn summarize(&self, cluster: &StoryCluster) -> Result<SummaryDraft> {
        let prompt = Self::build_prompt(cluster);
        let body = serde_json::json!({
            "model": self.model_id,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": 300,
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NewsreelError::General(format!("summary provider returned HTTP {}", response.status())));
        }

        let payload: serde_json::Value = response.json().await?;
        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| NewsreelError::General("summary provider response missing content".to_string()))?
            .to_string();

        if REFUSAL_MARKERS.iter().any(|m| text.to_lowercase().contains(m)) {
            return Err(NewsreelError::ModelRefusal);
        }

        let prompt_tokens = payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = payload["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;
        let cached_tokens = payload["usage"]["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32;
        let cost_usd = estimate_cost_usd(prompt_tokens, completion_tokens, cached_tokens);

        Ok(SummaryDraft { text, model_id: self.model_id.clone(), cost_usd, cached_tokens, prompt_tokens, completion_tokens })
    }
}

/// Rough per-token pricing, cached input discounted to a tenth of fresh
/// input. Deliberately approximate — cost tracking here is for the
/// dashboard, not billing reconciliation.
fn estimate_cost_usd(prompt_tokens: u32, completion_tokens: u32, cached_tokens: u32) -> f64 {
    const INPUT_PER_MILLION: f64 = 3.0;
    const OUTPUT_PER_MILLION: f64 = 15.0;
    let fresh_input = prompt_tokens.saturating_sub(cached_tokens) as f64;
    let cached_input = cached_tokens as f64;
    (fresh_input * INPUT_PER_MILLION + cached_input * (INPUT_PER_MILLION / 10.0)) / 1_000_000.0
        + (completion_tokens as f64 * OUTPUT_PER_MILLION) / 1_000_000.0
}

/// Shared cost-control gate for both trigger paths (§4.5): skip
/// regeneration unless verification_level has grown by at least
/// `summary_min_source_delta` since the last summary, or the regen
/// horizon has elapsed.
fn should_regenerate(cluster: &StoryCluster, cfg: &Config) -> bool {
    let Some(summary) = &cluster.summary else { return true };
    let source_delta = cluster.verification_level.saturating_sub(summary.source_count_at_generation);
    if source_delta >= cfg.summary_min_source_delta {
        return true;
    }
    let elapsed = Utc::now().signed_duration_since(summary.generated_at);
    elapsed >= chrono::Duration::from_std(cfg.summary_regen_horizon).unwrap_or_default()
}

/// Orchestrates the batch summarization sweep: candidate selection, lease
/// acquisition, provider call with fallback, and the write-back that must
/// not disturb `last_updated` (summarization is metadata, not a new source
/// arriving — conflating the two would falsely re-trigger BREAKING).
pub struct Summarizer {
    store: Arc<dyn DocumentStore>,
    provider: Arc<dyn SummaryProvider>,
    config: Arc<Config>,
    worker_id: String,
}

impl Summarizer {
    pub fn new(store: Arc<dyn DocumentStore>, provider: Arc<dyn SummaryProvider>, config: Arc<Config>, worker_id: String) -> Self {
        Self { store, provider, config, worker_id }
    }

    pub async fn run_batch_once(&self) -> Result<usize> {
        let now = Utc::now();
        let older_than = now - chrono::Duration::hours(self.config.batch_backfill_hours);
        let candidates = self
            .store
            .query_batch_summary_candidates(older_than, self.config.summary_min_source_delta, self.config.batch_max_size)
            .await?;

        let mut summarized = 0;
        for versioned in candidates {
            let cluster = versioned.value;
            if !should_regenerate(&cluster, &self.config) {
                continue;
            }
            let lease_key = format!("summary:{}", cluster.id);
            if !self.store.try_acquire_lease(&lease_key, &self.worker_id, StdDuration::from_secs(120)).await? {
                debug!(cluster_id = %cluster.id, "summary lease already held, skipping");
                continue;
            }

            let result = self.summarize_one(cluster).await;
            let _ = self.store.release_lease(&lease_key, &self.worker_id).await;

            match result {
                Ok(()) => summarized += 1,
                Err(e) => warn!(error = %e, "cluster summarization failed"),
            }
        }
        Ok(summarized)
    }

    /// Real-time path (§4.5 trigger 1): dispatched right after clustering
    /// links a source article carrying body text, instead of waiting for
    /// the next batch sweep. Callers are expected to fire-and-forget this
    /// (e.g. `tokio::spawn`); a lease miss or a provider error here is not
    /// fatal — the cluster simply falls back to the batch path next cycle,
    /// per the backpressure policy in §5.
    pub async fn try_realtime_summarize(&self, category: &str, cluster_id: &str) -> Result<()> {
        let lease_key = format!("summary:{}", cluster_id);
        if !self.store.try_acquire_lease(&lease_key, &self.worker_id, StdDuration::from_secs(120)).await? {
            return Ok(());
        }
        let outcome = async {
            let versioned = self.store.get::<StoryCluster>(Container::StoryClusters, category, cluster_id).await?;
            let Some(versioned) = versioned else { return Ok(()) };
            let cluster = versioned.value;
            if !should_regenerate(&cluster, &self.config) {
                return Ok(());
            }
            self.summarize_one(cluster).await
        }
        .await;
        let _ = self.store.release_lease(&lease_key, &self.worker_id).await;
        outcome
    }

    async fn summarize_one(&self, cluster: StoryCluster) -> Result<()> {
        let draft = match self.provider.summarize(&cluster).await {
            Ok(draft) => draft,
            Err(NewsreelError::ModelRefusal) => {
                warn!(cluster_id = %cluster.id, "model refused summary, using extractive fallback");
                SummaryDraft {
                    text: extractive_fallback(&cluster),
                    model_id: "fallback".to_string(),
                    cost_usd: 0.0,
                    cached_tokens: 0,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                }
            }
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(cluster_id = %cluster.id, error = %e, "summary provider error, using extractive fallback");
                SummaryDraft {
                    text: extractive_fallback(&cluster),
                    model_id: "fallback".to_string(),
                    cost_usd: 0.0,
                    cached_tokens: 0,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                }
            }
        };

        self.write_summary(cluster, draft).await
    }

    async fn write_summary(&self, mut cluster: StoryCluster, draft: SummaryDraft) -> Result<()> {
        const MAX_RETRIES: u32 = 5;
        let mut attempt = 0;
        loop {
            let versioned = self
                .store
                .get::<StoryCluster>(Container::StoryClusters, &cluster.category, &cluster.id)
                .await?
                .ok_or_else(|| NewsreelError::General(format!("cluster {} disappeared before summary write", cluster.id)))?;
            cluster = versioned.value;

            let summary = Summary {
                text: draft.text.clone(),
                version: cluster.version_history.len() as u32 + 1,
                generated_at: Utc::now(),
                source_count_at_generation: cluster.source_articles.len(),
                cost_usd: draft.cost_usd,
                model_id: draft.model_id.clone(),
                cached_tokens: draft.cached_tokens,
                prompt_tokens: draft.prompt_tokens,
                completion_tokens: draft.completion_tokens,
            };

            if let Some(previous) = cluster.summary.take() {
                cluster.version_history.push(previous);
            }
            cluster.summary = Some(summary);
            // last_updated intentionally untouched: a summary write is not a
            // new source arriving and must not re-trigger the status machine.

            match self.store.compare_and_swap(Container::StoryClusters, &cluster.category, &cluster.id, versioned.version, &cluster).await {
                Ok(_) => {
                    info!(cluster_id = %cluster.id, model = %draft.model_id, cost_usd = draft.cost_usd, "summary written");
                    return Ok(());
                }
                Err(NewsreelError::Conflict { .. }) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        return Err(NewsreelError::Conflict { entity: cluster.id });
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn run_forever(&self) {
        loop {
            match self.run_batch_once().await {
                Ok(n) if n > 0 => info!(summarized = n, "summarization batch complete"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "summarization batch failed"),
            }
            tokio::time::sleep(self.config.summary_batch_cadence).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawArticle;
    use uuid::Uuid;

    fn sample_article(title: &str) -> RawArticle {
        RawArticle {
            id: Uuid::new_v4().to_string(),
            source_id: Uuid::new_v4(),
            source_domain: "example.com".to_string(),
            source_tier: crate::types::SourceTier::Tier1,
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
            story_fingerprint: "fp".to_string(),
            exact_hash: "hash".to_string(),
            simhash: 0,
            processed: false,
            version: 0,
        }
    }

    fn sample_cluster() -> StoryCluster {
        StoryCluster::new("c1".to_string(), "world".to_string(), &sample_article("Quake hits region"), Utc::now())
    }

    #[tokio::test]
    async fn mock_provider_produces_extractive_text() {
        let provider = MockSummaryProvider::new();
        let cluster = sample_cluster();
        let draft = provider.summarize(&cluster).await.unwrap();
        assert!(draft.text.contains("Quake hits region"));
    }

    #[tokio::test]
    async fn mock_provider_refuses_when_configured() {
        let provider = MockSummaryProvider { refuse_containing: Some("quake".to_string()) };
        let cluster = sample_cluster();
        let result = provider.summarize(&cluster).await;
        assert!(matches!(result, Err(NewsreelError::ModelRefusal)));
    }

    #[test]
    fn extractive_fallback_mentions_multiple_domains() {
        let mut cluster = sample_cluster();
        cluster.article_snapshots.push(crate::types::ArticleSnapshot {
            id: "a2".to_string(),
            source_id: uuid::Uuid::new_v4(),
            title: "Second report".to_string(),
            url: "https://bbc.com/b".to_string(),
            source_domain: "bbc.com".to_string(),
            published_at: Utc::now() + chrono::Duration::minutes(5),
        });
        let text = extractive_fallback(&cluster);
        assert!(text.contains("example.com"));
        assert!(text.contains("bbc.com"));
    }

    #[test]
    fn cost_estimate_discounts_cached_tokens() {
        let full_price = estimate_cost_usd(1000, 100, 0);
        let with_cache = estimate_cost_usd(1000, 100, 1000);
        assert!(with_cache < full_price);
    }
}
