//! Notification delivery: a small trait so the monitor (C6) doesn't care
//! whether a BREAKING alert goes to stdout, a webhook, or a push service.
//! Idempotency (send-at-most-once) is the caller's responsibility via
//! `DocumentStore::record_notification`; a `Notifier` only needs to attempt
//! one delivery and report success or failure.

use async_trait::async_trait;
use tracing::info;

use crate::types::{NewsreelError, Result, StoryCluster};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_breaking(&self, cluster: &StoryCluster) -> Result<()>;
}

/// Logs the alert at `info` level. The default notifier for local runs and
/// tests; a production deployment wires in `WebhookNotifier` instead.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_breaking(&self, cluster: &StoryCluster) -> Result<()> {
        info!(
            cluster_id = %cluster.id,
            title = %cluster.title,
            sources = cluster.source_articles.len(),
            "BREAKING"
        );
        Ok(())
    }
}

/// Posts a JSON payload to a configured webhook URL (Slack-compatible
/// `{"text": ...}` shape).
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self { client: reqwest::Client::new(), webhook_url }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_breaking(&self, cluster: &StoryCluster) -> Result<()> {
        let text = format!(
            "\u{1F6A8} BREAKING: {} ({} sources)",
            cluster.title,
            cluster.source_articles.len()
        );
        let response = self.client.post(&self.webhook_url).json(&serde_json::json!({ "text": text })).send().await?;
        if !response.status().is_success() {
            return Err(NewsreelError::General(format!("webhook responded with HTTP {}", response.status())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawArticle;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_cluster() -> StoryCluster {
        let article = RawArticle {
            id: Uuid::new_v4().to_string(),
            source_id: Uuid::new_v4(),
            source_domain: "example.com".to_string(),
            source_tier: crate::types::SourceTier::Tier1,
            url: "https://example.com/a".to_string(),
            title: "Test story".to_string(),
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
        };
        StoryCluster::new("c1".to_string(), "world".to_string(), &article, Utc::now())
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        let notifier = LogNotifier;
        assert!(notifier.notify_breaking(&sample_cluster()).await.is_ok());
    }
}
