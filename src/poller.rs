//! Poller (C1): the scheduling tick that decides which feeds to poll this
//! cycle, fans them out across a bounded worker pool, and folds each
//! fetch's outcome back into `FeedPollState` plus newly inserted
//! `RawArticle`s. Orchestration only — HTTP lives in `fetcher`, XML parsing
//! in `parser`, hash/entity computation in `normalize`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::dedup::{DedupVerdict, DedupWindow};
use crate::fetcher::{FetchOutcome, Fetcher};
use crate::parser::{self, FeedParser};
use crate::store::{Container, DocumentStore, DocumentStoreExt};
use crate::types::{FeedConfig, FeedPollState, Result};

/// How long a feed is skipped after `n` consecutive failures, capped. Below
/// `threshold` (default 5, §4.1) a feed just waits out its normal cooldown;
/// only once it crosses the threshold does the exponential multiplier
/// kick in, doubling per failure past that point. Doubling mirrors the
/// fetcher's own retry backoff one layer up, at the scheduling granularity
/// instead of the request granularity. A small random jitter is added so a
/// batch of feeds that failed together (e.g. after a shared upstream blip)
/// don't all retry on the same tick.
fn backoff_for(consecutive_failures: u32, base: std::time::Duration, cap: std::time::Duration, threshold: u32) -> std::time::Duration {
    if consecutive_failures < threshold {
        return std::time::Duration::ZERO;
    }
    let shift = (consecutive_failures - threshold).min(10);
    let doubled = base.checked_mul(1 << shift).unwrap_or(cap);
    let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64).max(1).min(5_000));
    (doubled + std::time::Duration::from_millis(jitter_ms)).min(cap)
}

fn is_due(state: &FeedPollState, cfg: &Config, now: chrono::DateTime<Utc>) -> bool {
    let Some(last_poll) = state.last_poll_at else { return true };
    let cooldown = if matches!(state.tier, crate::types::SourceTier::Tier1) { cfg.feed_cooldown_tier1 } else { cfg.feed_cooldown };
    let backoff = backoff_for(state.consecutive_failures, cooldown, cfg.feed_backoff_cap, cfg.feed_failure_threshold);
    let wait = cooldown.max(backoff);
    now.signed_duration_since(last_poll) >= chrono::Duration::from_std(wait).unwrap_or_default()
}

pub struct PollSummary {
    pub feeds_attempted: usize,
    pub feeds_succeeded: usize,
    pub articles_ingested: usize,
    pub articles_rejected_duplicate: usize,
}

pub struct Poller {
    store: Arc<dyn DocumentStore>,
    fetcher: Arc<Fetcher>,
    config: Arc<Config>,
    dedup: Arc<DedupWindow>,
}

impl Poller {
    pub fn new(store: Arc<dyn DocumentStore>, config: Arc<Config>) -> Self {
        let fetcher = Arc::new(Fetcher::new(&config));
        let dedup = Arc::new(DedupWindow::new(config.dedup_window_days, config.simhash_distance_threshold));
        Self { store, fetcher, config, dedup }
    }

    /// One scheduling tick: fetch the `feeds_per_tick` feeds with the
    /// oldest `last_poll_at`, skip the ones still inside their backoff
    /// window, and fan the rest out across a bounded worker pool.
    pub async fn run_tick(&self) -> Result<PollSummary> {
        let due = self.store.query_feeds_due(self.config.feeds_per_tick * 4).await?;
        let now = Utc::now();
        let eligible: Vec<FeedPollState> = due.into_iter().filter(|s| is_due(s, &self.config, now)).take(self.config.feeds_per_tick).collect();

        if eligible.is_empty() {
            return Ok(PollSummary { feeds_attempted: 0, feeds_succeeded: 0, articles_ingested: 0, articles_rejected_duplicate: 0 });
        }

        let configs: HashMap<Uuid, FeedConfig> =
            self.store.list_all_feed_configs().await?.into_iter().map(|c| (c.id, c)).collect();

        let semaphore = Arc::new(Semaphore::new(self.config.worker_pool_size));
        let mut handles = Vec::with_capacity(eligible.len());

        for state in eligible {
            let Some(feed_config) = configs.get(&state.feed_id).cloned() else {
                warn!(feed_id = %state.feed_id, "feed poll state has no matching config, skipping");
                continue;
            };
            let semaphore = semaphore.clone();
            let store = self.store.clone();
            let fetcher = self.fetcher.clone();
            let config = self.config.clone();
            let dedup = self.dedup.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                poll_one_feed(store.as_ref(), fetcher.as_ref(), &config, dedup.as_ref(), state, feed_config).await
            }));
        }

        let mut summary = PollSummary { feeds_attempted: handles.len(), feeds_succeeded: 0, articles_ingested: 0, articles_rejected_duplicate: 0 };
        for result in join_all(handles).await {
            match result {
                Ok(Ok(outcome)) => {
                    summary.feeds_succeeded += 1;
                    summary.articles_ingested += outcome.ingested;
                    summary.articles_rejected_duplicate += outcome.rejected_duplicate;
                }
                Ok(Err(e)) => warn!(error = %e, "feed poll task failed"),
                Err(e) => warn!(error = %e, "feed poll task panicked"),
            }
        }
        Ok(summary)
    }

    pub async fn run_forever(&self) {
        let mut ticks = IntervalStream::new(tokio::time::interval(self.config.feed_tick_period));
        while ticks.next().await.is_some() {
            match self.run_tick().await {
                Ok(summary) if summary.feeds_attempted > 0 => {
                    info!(
                        attempted = summary.feeds_attempted,
                        succeeded = summary.feeds_succeeded,
                        ingested = summary.articles_ingested,
                        rejected = summary.articles_rejected_duplicate,
                        "poll tick complete"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "poll tick failed"),
            }
        }
    }
}

struct FeedOutcome {
    ingested: usize,
    rejected_duplicate: usize,
}

async fn poll_one_feed(
    store: &dyn DocumentStore,
    fetcher: &Fetcher,
    cfg: &Config,
    dedup: &DedupWindow,
    mut state: FeedPollState,
    feed_config: FeedConfig,
) -> Result<FeedOutcome> {
    let now = Utc::now();
    state.last_poll_at = Some(now);

    let outcome = fetcher
        .fetch_feed(state.feed_id, &feed_config.url, state.http_etag.as_deref(), state.http_last_modified.as_deref())
        .await;

    let result = match outcome {
        Ok(FetchOutcome::Unmodified) => {
            state.last_success_at = Some(now);
            state.consecutive_failures = 0;
            state.articles_last_cycle = 0;
            FeedOutcome { ingested: 0, rejected_duplicate: 0 }
        }
        Ok(FetchOutcome::Quarantined { reason }) => {
            warn!(feed_id = %state.feed_id, reason, "feed quarantined this cycle");
            state.consecutive_failures += 1;
            FeedOutcome { ingested: 0, rejected_duplicate: 0 }
        }
        Ok(FetchOutcome::Fetched { body, etag, last_modified }) => {
            state.last_success_at = Some(now);
            state.consecutive_failures = 0;
            state.http_etag = etag;
            state.http_last_modified = last_modified;

            if !parser::is_valid_feed_content(&body) {
                warn!(feed_id = %state.feed_id, "fetched content failed feed validation");
                FeedOutcome { ingested: 0, rejected_duplicate: 0 }
            } else {
                ingest_entries(store, cfg, dedup, &body, &feed_config, now).await?
            }
        }
        Err(e) => {
            debug!(feed_id = %state.feed_id, error = %e, "fetch failed");
            state.consecutive_failures += 1;
            FeedOutcome { ingested: 0, rejected_duplicate: 0 }
        }
    };

    state.articles_last_cycle = result.ingested as u32;
    store.upsert(Container::FeedPollState, &state.feed_id.to_string(), &state.feed_id.to_string(), &state).await?;
    Ok(result)
}

async fn ingest_entries(
    store: &dyn DocumentStore,
    cfg: &Config,
    dedup: &DedupWindow,
    body: &str,
    feed_config: &FeedConfig,
    fetched_at: chrono::DateTime<Utc>,
) -> Result<FeedOutcome> {
    let mut parser = FeedParser::new();
    let entries = parser.parse_feed(body)?;

    let age_horizon = chrono::Duration::from_std(cfg.entry_age_horizon).unwrap_or_default();
    let mut ingested = 0;
    let mut rejected_duplicate = 0;

    for entry in &entries {
        let article = parser::build_raw_article(entry, feed_config, fetched_at)?;

        if fetched_at.signed_duration_since(article.published_at) > age_horizon {
            debug!(url = %article.url, "rejecting entry older than the age horizon");
            continue;
        }

        match dedup.check(&article.exact_hash, article.simhash, fetched_at) {
            DedupVerdict::ExactDuplicate | DedupVerdict::SyndicationDuplicate => {
                rejected_duplicate += 1;
                continue;
            }
            DedupVerdict::Unique => {}
        }

        store.upsert(Container::RawArticles, &article.published_date, &article.id, &article).await?;
        dedup.record(article.exact_hash.clone(), article.simhash, fetched_at);
        ingested += 1;
    }

    Ok(FeedOutcome { ingested, rejected_duplicate })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn state_with(last_poll_at: Option<chrono::DateTime<Utc>>, failures: u32) -> FeedPollState {
        FeedPollState {
            feed_id: Uuid::new_v4(),
            url: "https://example.com/feed.xml".to_string(),
            tier: crate::types::SourceTier::Tier2,
            last_poll_at,
            last_success_at: None,
            http_etag: None,
            http_last_modified: None,
            consecutive_failures: failures,
            articles_last_cycle: 0,
        }
    }

    fn cfg() -> Config {
        std::env::set_var("DATABASE_URL", "postgres://test/test");
        Config::from_env().unwrap()
    }

    #[test]
    fn never_polled_feed_is_always_due() {
        assert!(is_due(&state_with(None, 0), &cfg(), Utc::now()));
    }

    #[test]
    fn healthy_feed_waits_out_its_cooldown() {
        let state = state_with(Some(Utc::now()), 0);
        assert!(!is_due(&state, &cfg(), Utc::now()));
    }

    #[test]
    fn failing_feed_backs_off_longer_than_a_healthy_one() {
        let now = Utc::now();
        // 6 consecutive failures: one past the default threshold of 5, so the
        // exponential multiplier has kicked in once.
        let state = state_with(Some(now - chrono::Duration::seconds(200)), 6);
        let cfg = cfg();
        assert!(!is_due(&state, &cfg, now));
    }

    #[test]
    fn feed_below_failure_threshold_just_waits_out_cooldown() {
        let now = Utc::now();
        let state = state_with(Some(now - chrono::Duration::seconds(200)), 3);
        let cfg = cfg();
        assert!(is_due(&state, &cfg, now));
    }

    #[test]
    fn backoff_is_capped() {
        let capped = backoff_for(20, StdDuration::from_secs(60), StdDuration::from_secs(3600), 5);
        assert_eq!(capped, StdDuration::from_secs(3600));
    }
}
