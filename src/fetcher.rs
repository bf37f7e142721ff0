//! HTTP fetching (C1): conditional GET, retry with exponential backoff,
//! per-host rate limiting, a robots.txt allow/deny cache, and a feed-size
//! cap. Pure I/O — scheduling and circuit-breaker state live in the
//! poller, not here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::types::{NewsreelError, Result};

/// Outcome of one poll attempt. `Unmodified` and `Quarantined` are
/// distinguished from `Fetched` so the poller can update `FeedPollState`
/// without re-parsing or re-penalizing a healthy 304.
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched { body: String, etag: Option<String>, last_modified: Option<String> },
    Unmodified,
    Quarantined { reason: String },
}

pub struct Fetcher {
    client: Client,
    max_retries: u32,
    max_feed_size_mb: usize,
    respect_robots_txt: bool,
    robots_cache: Arc<RwLock<HashMap<String, bool>>>,
    rate_limiter: Arc<RwLock<HashMap<String, Instant>>>,
    min_host_interval: Duration,
}

impl Fetcher {
    pub fn new(cfg: &Config) -> Self {
        let client = Client::builder()
            .user_agent("newsreel/1.0 (+https://newsreel.example/bot)")
            .timeout(Duration::from_secs(20))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            max_retries: 3,
            max_feed_size_mb: 20,
            respect_robots_txt: true,
            robots_cache: Arc::new(RwLock::new(HashMap::new())),
            rate_limiter: Arc::new(RwLock::new(HashMap::new())),
            min_host_interval: cfg.feed_cooldown_tier1.min(Duration::from_secs(1)),
        }
    }

    pub async fn fetch_feed(&self, feed_id: Uuid, url: &str, etag: Option<&str>, last_modified: Option<&str>) -> Result<FetchOutcome> {
        if self.respect_robots_txt {
            if let Err(e) = self.check_robots_txt(url).await {
                warn!(%feed_id, url, error = %e, "robots.txt disallows feed");
                return Ok(FetchOutcome::Quarantined { reason: e.to_string() });
            }
        }

        self.apply_rate_limit(url).await?;

        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_secs(2),
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(64),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(120)),
            ..Default::default()
        };

        let mut last_error: Option<NewsreelError> = None;

        for attempt in 0..=self.max_retries {
            match self.fetch_with_conditional_headers(url, etag, last_modified).await {
                Ok(response) => {
                    let status = response.status();

                    if status == reqwest::StatusCode::NOT_MODIFIED {
                        debug!(url, "not modified");
                        return Ok(FetchOutcome::Unmodified);
                    }

                    if !status.is_success() {
                        last_error = Some(NewsreelError::General(format!(
                            "HTTP {}: {}",
                            status,
                            status.canonical_reason().unwrap_or("unknown")
                        )));
                        if attempt < self.max_retries {
                            if let Some(delay) = backoff.next_backoff() {
                                warn!(url, attempt, ?delay, "retrying after non-success status");
                                tokio::time::sleep(delay).await;
                                continue;
                            }
                        }
                        break;
                    }

                    if let Some(content_length) = response.content_length() {
                        let size_mb = (content_length as usize) / (1024 * 1024);
                        if size_mb > self.max_feed_size_mb {
                            return Err(NewsreelError::FeedTooLarge { size_mb });
                        }
                    }

                    let new_etag = response.headers().get("etag").and_then(|v| v.to_str().ok()).map(str::to_string);
                    let new_last_modified = response.headers().get("last-modified").and_then(|v| v.to_str().ok()).map(str::to_string);

                    match response.text().await {
                        Ok(body) => {
                            return Ok(FetchOutcome::Fetched { body, etag: new_etag, last_modified: new_last_modified });
                        }
                        Err(e) => last_error = Some(NewsreelError::Http(e)),
                    }
                }
                Err(e) => {
                    let retry = e.is_retryable();
                    last_error = Some(e);
                    if retry && attempt < self.max_retries {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!(url, attempt, ?delay, "retrying after transport error");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| NewsreelError::General("fetch failed with no recorded error".to_string())))
    }

    async fn fetch_with_conditional_headers(&self, url: &str, etag: Option<&str>, last_modified: Option<&str>) -> Result<Response> {
        let mut request = self.client.get(url);
        if let Some(etag) = etag {
            request = request.header("If-None-Match", etag);
        }
        if let Some(last_modified) = last_modified {
            request = request.header("If-Modified-Since", last_modified);
        }
        Ok(request.send().await?)
    }

    async fn check_robots_txt(&self, url: &str) -> Result<()> {
        let parsed = Url::parse(url)?;
        let base = format!("{}://{}", parsed.scheme(), parsed.host_str().unwrap_or(""));

        {
            let cache = self.robots_cache.read().await;
            if let Some(&allowed) = cache.get(&base) {
                return if allowed { Ok(()) } else { Err(NewsreelError::RobotsDisallowed { url: url.to_string() }) };
            }
        }

        let allowed = match self.client.get(format!("{}/robots.txt", base)).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body = resp.text().await.unwrap_or_default();
                !disallows_path(&body, parsed.path())
            }
            _ => true,
        };

        self.robots_cache.write().await.insert(base, allowed);
        if allowed {
            Ok(())
        } else {
            Err(NewsreelError::RobotsDisallowed { url: url.to_string() })
        }
    }

    async fn apply_rate_limit(&self, url: &str) -> Result<()> {
        let parsed = Url::parse(url)?;
        let host = parsed.host_str().unwrap_or("").to_string();
        let now = Instant::now();

        let mut limiter = self.rate_limiter.write().await;
        if let Some(&last) = limiter.get(&host) {
            let elapsed = now.duration_since(last);
            if elapsed < self.min_host_interval {
                tokio::time::sleep(self.min_host_interval - elapsed).await;
            }
        }
        limiter.insert(host, Instant::now());
        Ok(())
    }
}

/// Minimal robots.txt evaluation: a blanket `User-agent: *` block with
/// `Disallow: <prefix>` rules. No crawl-delay, no wildcard/`$` matching —
/// sufficient to keep polling off paths an operator has explicitly fenced.
fn disallows_path(robots_txt: &str, path: &str) -> bool {
    let mut in_wildcard_block = false;
    for line in robots_txt.lines() {
        let line = line.trim();
        if let Some(rest) = line.to_lowercase().strip_prefix("user-agent:") {
            in_wildcard_block = rest.trim() == "*";
            continue;
        }
        if !in_wildcard_block {
            continue;
        }
        if let Some(rest) = line.to_lowercase().strip_prefix("disallow:") {
            let prefix = rest.trim();
            if !prefix.is_empty() && path.starts_with(prefix) {
                return true;
            }
        }
    }
    false
}

pub fn fetch_time() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robots_disallow_blocks_matching_prefix() {
        let txt = "User-agent: *\nDisallow: /private\n";
        assert!(disallows_path(txt, "/private/feed.xml"));
        assert!(!disallows_path(txt, "/public/feed.xml"));
    }

    #[test]
    fn robots_disallow_only_applies_within_wildcard_block() {
        let txt = "User-agent: GoogleBot\nDisallow: /private\n\nUser-agent: *\nDisallow: /blocked\n";
        assert!(!disallows_path(txt, "/private"));
        assert!(disallows_path(txt, "/blocked/x"));
    }
}
