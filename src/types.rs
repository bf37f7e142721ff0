use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tier drives polling cooldown and poller priority (`FEED_COOLDOWN_TIER1` vs `FEED_COOLDOWN`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceTier {
    Tier1,
    Tier2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub id: Uuid,
    pub url: String,
    pub tier: SourceTier,
    pub category_hint: Option<String>,
    pub language: Option<String>,
}

/// Per-feed cursor. Mutated only by the poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPollState {
    pub feed_id: Uuid,
    pub url: String,
    pub tier: SourceTier,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub http_etag: Option<String>,
    pub http_last_modified: Option<String>,
    pub consecutive_failures: u32,
    pub articles_last_cycle: u32,
}

impl FeedPollState {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            feed_id: config.id,
            url: config.url.clone(),
            tier: config.tier,
            last_poll_at: None,
            last_success_at: None,
            http_etag: None,
            http_last_modified: None,
            consecutive_failures: 0,
            articles_last_cycle: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Person,
    Org,
    Loc,
    Event,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub text: String,
    pub entity_type: EntityType,
    pub salience: f64,
}

/// An ingested RSS entry after normalization. Immutable after creation except
/// `processed` (set true once clustering has seen it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawArticle {
    pub id: String,
    pub source_id: Uuid,
    pub source_domain: String,
    pub source_tier: SourceTier,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub published_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub published_date: String,
    pub language: Option<String>,
    pub category: String,
    pub tags: Vec<String>,
    pub entities: Vec<Entity>,
    pub story_fingerprint: String,
    pub exact_hash: String,
    pub simhash: u64,
    pub processed: bool,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatus {
    Monitoring,
    Developing,
    Breaking,
    Verified,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Monitoring => "MONITORING",
            ClusterStatus::Developing => "DEVELOPING",
            ClusterStatus::Breaking => "BREAKING",
            ClusterStatus::Verified => "VERIFIED",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Location {
    pub country: Option<String>,
    pub region: Option<String>,
    pub coordinates: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    pub source_count_at_generation: usize,
    pub cost_usd: f64,
    pub model_id: String,
    pub cached_tokens: u32,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Lightweight denormalized reference to a source article, carried on the
/// cluster itself so the summarizer (C5) can build a prompt without a
/// scatter-gather read across every `RawArticles` partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleSnapshot {
    pub id: String,
    pub source_id: Uuid,
    pub title: String,
    pub url: String,
    pub source_domain: String,
    pub published_at: DateTime<Utc>,
}

/// One news event; the aggregate record C3-C6 mutate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryCluster {
    pub id: String,
    pub category: String,
    pub title: String,
    pub status: ClusterStatus,
    pub verification_level: usize,
    pub source_articles: Vec<String>,
    pub article_snapshots: Vec<ArticleSnapshot>,
    pub entity_histogram: std::collections::HashMap<String, u32>,
    pub centroid_keywords: std::collections::HashSet<String>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub update_count: u32,
    pub breaking_detected_at: Option<DateTime<Utc>>,
    pub push_notification_sent: bool,
    pub push_notification_sent_at: Option<DateTime<Utc>>,
    pub summary: Option<Summary>,
    pub version_history: Vec<Summary>,
    pub importance_score: f64,
    pub confidence_score: f64,
    pub location: Option<Location>,
    pub version: i64,
}

impl StoryCluster {
    pub fn new(id: String, category: String, article: &RawArticle, now: DateTime<Utc>) -> Self {
        let mut entity_histogram = std::collections::HashMap::new();
        for e in &article.entities {
            *entity_histogram.entry(e.text.clone()).or_insert(0) += 1;
        }
        Self {
            id,
            category,
            title: article.title.clone(),
            status: ClusterStatus::Monitoring,
            verification_level: 1,
            source_articles: vec![article.id.clone()],
            article_snapshots: vec![ArticleSnapshot {
                id: article.id.clone(),
                source_id: article.source_id,
                title: article.title.clone(),
                url: article.url.clone(),
                source_domain: article.source_domain.clone(),
                published_at: article.published_at,
            }],
            entity_histogram,
            centroid_keywords: std::collections::HashSet::new(),
            first_seen: now,
            last_updated: now,
            update_count: 0,
            breaking_detected_at: None,
            push_notification_sent: false,
            push_notification_sent_at: None,
            summary: None,
            version_history: Vec::new(),
            importance_score: 0.0,
            confidence_score: 0.0,
            location: None,
            version: 0,
        }
    }
}

/// Opaque per-consumer checkpoint so change-stream subscribers resume exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    pub checkpoint: i64,
    pub holder: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Existence of a row for `story_id` guarantees no re-broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub story_id: String,
    pub broadcast_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum NewsreelError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feed parse error: {0}")]
    Parse(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("feed not found: {id}")]
    FeedNotFound { id: Uuid },

    #[error("rate limited for {seconds} seconds")]
    RateLimited { seconds: u64 },

    #[error("robots.txt disallows access to {url}")]
    RobotsDisallowed { url: String },

    #[error("feed size exceeds limit: {size_mb}MB")]
    FeedTooLarge { size_mb: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("optimistic concurrency conflict on {entity}")]
    Conflict { entity: String },

    #[error("quarantined: {reason}")]
    Quarantined { reason: String },

    #[error("model refused to summarize")]
    ModelRefusal,

    #[error("lease already held: {key}")]
    LeaseHeld { key: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    General(String),
}

impl NewsreelError {
    /// Classifies a failure per the error taxonomy: transient/conflict are worth
    /// retrying, validation/policy/refusal are handled locally, config is fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NewsreelError::Http(_)
                | NewsreelError::Database(_)
                | NewsreelError::Io(_)
                | NewsreelError::Conflict { .. }
                | NewsreelError::RateLimited { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, NewsreelError::Config { .. })
    }
}

pub type Result<T> = std::result::Result<T, NewsreelError>;
