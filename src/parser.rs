//! Feed parsing (C1/C2): turns raw RSS/Atom bytes into `RawArticle`s.
//! Per-payload GUID/URL dedup lives here (an entry repeated within the same
//! feed fetch); cross-feed/cross-cycle dedup is `dedup.rs`'s job.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use feed_rs::parser;
use tracing::{debug, info};
use uuid::Uuid;

use crate::normalize;
use crate::types::{FeedConfig, NewsreelError, RawArticle, Result};

pub struct ParsedEntry {
    pub guid: Option<String>,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

pub struct FeedParser {
    seen_guids: HashSet<String>,
    seen_urls: HashSet<String>,
}

impl Default for FeedParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedParser {
    pub fn new() -> Self {
        Self { seen_guids: HashSet::new(), seen_urls: HashSet::new() }
    }

    pub fn parse_feed(&mut self, content: &str) -> Result<Vec<ParsedEntry>> {
        debug!(bytes = content.len(), "parsing feed content");
        let feed = parser::parse(content.as_bytes()).map_err(|e| NewsreelError::Parse(e.to_string()))?;

        let mut entries = Vec::new();
        for entry in feed.entries {
            if let Some(parsed) = self.parse_entry(entry) {
                entries.push(parsed);
            }
        }
        info!(count = entries.len(), "parsed feed entries");
        Ok(entries)
    }

    fn parse_entry(&mut self, entry: feed_rs::model::Entry) -> Option<ParsedEntry> {
        let title = entry.title.map(|t| t.content).unwrap_or_else(|| "Untitled".to_string());
        let url = entry.links.first()?.href.clone();

        let guid = if !entry.id.is_empty() { Some(entry.id.clone()) } else { None };

        if let Some(ref guid) = guid {
            if self.seen_guids.contains(guid) {
                debug!(guid, "skipping duplicate entry within payload");
                return None;
            }
            self.seen_guids.insert(guid.clone());
        }
        if self.seen_urls.contains(&url) {
            debug!(url, "skipping duplicate entry within payload");
            return None;
        }
        self.seen_urls.insert(url.clone());

        let description = entry.summary.map(|s| s.content);
        let content = entry.content.and_then(|c| c.body).or_else(|| description.clone());
        let author = entry.authors.first().map(|a| a.name.clone());

        // Some feeds omit `published` and only set `updated`; fall back rather
        // than dropping the entry, since a missing timestamp would otherwise
        // sort it to the front of every age-ordered query.
        let published_at = entry.published.map(|dt| dt.with_timezone(&Utc)).or_else(|| entry.updated.map(|dt| dt.with_timezone(&Utc)));
        let updated_at = entry.updated.map(|dt| dt.with_timezone(&Utc));

        let tags = entry.categories.into_iter().map(|c| c.term).collect();

        Some(ParsedEntry { guid, url, title, description, content, author, published_at, updated_at, tags })
    }

    pub fn clear_payload_cache(&mut self) {
        self.seen_guids.clear();
        self.seen_urls.clear();
    }
}

pub fn is_valid_feed_content(content: &str) -> bool {
    let lower = content.to_lowercase();
    let has_indicators = lower.contains("<rss")
        || lower.contains("<feed")
        || lower.contains("xmlns=\"http://www.w3.org/2005/atom\"")
        || lower.contains("xmlns:atom")
        || lower.contains("<channel");
    let has_xml_declaration = content.trim_start().starts_with("<?xml");
    has_indicators && (has_xml_declaration || lower.contains("<"))
}

/// Builds the normalized `RawArticle` for one parsed entry: HTML stripped
/// from description/content, entities/fingerprint/hash/simhash computed via
/// `normalize`. `published_date` is the UTC calendar date of `published_at`,
/// used as the document store's `RawArticles` partition key.
pub fn build_raw_article(entry: &ParsedEntry, feed: &FeedConfig, fetched_at: DateTime<Utc>) -> Result<RawArticle> {
    let description = entry.description.as_deref().map(crate::utils::text::strip_html);
    let content = entry.content.as_deref().map(crate::utils::text::strip_html);
    let published_at = entry.published_at.unwrap_or(fetched_at);

    let entities = normalize::extract_entities(&entry.title, description.as_deref().unwrap_or(""));
    let story_fingerprint = normalize::story_fingerprint(&entry.title, description.as_deref(), &entities);
    let source_domain = crate::utils::url::extract_domain(&entry.url).unwrap_or_default();
    let exact_hash = normalize::exact_hash(&entry.title, &source_domain);
    let simhash = normalize::simhash(&entry.title, description.as_deref());

    Ok(RawArticle {
        id: normalize::article_id(feed.id, &entry.url),
        source_id: feed.id,
        source_domain,
        source_tier: feed.tier,
        url: entry.url.clone(),
        title: entry.title.clone(),
        description,
        content,
        author: entry.author.clone(),
        published_at,
        fetched_at,
        published_date: published_at.format("%Y-%m-%d").to_string(),
        language: feed.language.clone(),
        category: normalize::categorize(&entry.url, &entry.title, description.as_deref(), feed.category_hint.as_deref()),
        tags: entry.tags.clone(),
        entities,
        story_fingerprint,
        exact_hash,
        simhash,
        processed: false,
        version: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example Feed</title>
    <item>
      <title>Quake hits northern Japan</title>
      <link>https://example.com/a</link>
      <guid>guid-1</guid>
      <description>A 7.2 magnitude quake struck Hokkaido.</description>
      <pubDate>Thu, 30 Jul 2026 08:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Quake hits northern Japan</title>
      <link>https://example.com/a</link>
      <guid>guid-1</guid>
      <description>Duplicate delivery of the same item.</description>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn duplicate_guid_within_payload_is_dropped() {
        let mut parser = FeedParser::new();
        let entries = parser.parse_feed(SAMPLE_RSS).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn valid_feed_content_detects_rss() {
        assert!(is_valid_feed_content(SAMPLE_RSS));
        assert!(!is_valid_feed_content("<html><body>not a feed</body></html>"));
    }

    #[test]
    fn build_raw_article_populates_normalized_fields() {
        let mut parser = FeedParser::new();
        let entries = parser.parse_feed(SAMPLE_RSS).unwrap();
        let feed = FeedConfig {
            id: Uuid::new_v4(),
            url: "https://example.com/feed.xml".to_string(),
            tier: crate::types::SourceTier::Tier1,
            category_hint: Some("world".to_string()),
            language: Some("en".to_string()),
        };
        let article = build_raw_article(&entries[0], &feed, Utc::now()).unwrap();
        assert_eq!(article.category, "world");
        assert!(!article.story_fingerprint.is_empty());
        assert!(!article.exact_hash.is_empty());
    }
}
