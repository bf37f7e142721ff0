use std::env;
use std::time::Duration;

use crate::types::{NewsreelError, Result};

/// Process-wide configuration, frozen after startup. The only global mutable
/// state besides the HTTP pool and the LLM client (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub llm_api_key: Option<String>,
    pub llm_base_url: String,

    pub feed_tick_period: Duration,
    pub feeds_per_tick: usize,
    pub feed_cooldown: Duration,
    pub feed_cooldown_tier1: Duration,
    pub feed_failure_threshold: u32,
    pub feed_backoff_cap: Duration,
    pub worker_pool_size: usize,

    pub cluster_sim_threshold: f64,
    pub cluster_entity_min: usize,
    pub cluster_window_hours: i64,
    pub cluster_candidate_cap: usize,

    pub breaking_window: Duration,
    pub breaking_re_promote_window: Duration,
    pub breaking_idle_timeout: Duration,
    pub monitor_period: Duration,
    pub notification_freshness_horizon: Duration,

    pub summary_min_source_delta: usize,
    pub summary_regen_horizon: Duration,
    pub summary_batch_cadence: Duration,
    pub batch_max_size: usize,
    pub batch_backfill_hours: i64,

    pub entry_age_horizon: Duration,
    pub dedup_window_days: i64,
    pub simhash_distance_threshold: u32,
    pub article_ttl_days: i64,
    pub cluster_ttl_days: i64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").map_err(|_| NewsreelError::Config {
            message: "DATABASE_URL is required".to_string(),
        })?;

        Ok(Self {
            database_url,
            llm_api_key: env::var("LLM_API_KEY").ok(),
            llm_base_url: env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),

            feed_tick_period: Duration::from_secs(env_or("FEED_TICK_PERIOD", 10)),
            feeds_per_tick: env_or("FEEDS_PER_TICK", 10),
            feed_cooldown: Duration::from_secs(env_or("FEED_COOLDOWN", 180)),
            feed_cooldown_tier1: Duration::from_secs(env_or("FEED_COOLDOWN_TIER1", 60)),
            feed_failure_threshold: env_or("FEED_FAILURE_THRESHOLD", 5),
            feed_backoff_cap: Duration::from_secs(env_or("FEED_BACKOFF_CAP_SECONDS", 3600)),
            worker_pool_size: env_or("WORKER_POOL_SIZE", 25),

            cluster_sim_threshold: env_or("CLUSTER_SIM_THRESHOLD", 0.50),
            cluster_entity_min: env_or("CLUSTER_ENTITY_MIN", 3),
            cluster_window_hours: env_or("CLUSTER_WINDOW_HOURS", 6),
            cluster_candidate_cap: env_or("CLUSTER_CANDIDATE_CAP", 150),

            breaking_window: Duration::from_secs(env_or::<u64>("BREAKING_WINDOW_MINUTES", 30) * 60),
            breaking_re_promote_window: Duration::from_secs(
                env_or::<u64>("BREAKING_RE_PROMOTE_WINDOW_MINUTES", 15) * 60,
            ),
            breaking_idle_timeout: Duration::from_secs(
                env_or::<u64>("BREAKING_IDLE_TIMEOUT_MINUTES", 90) * 60,
            ),
            monitor_period: Duration::from_secs(env_or::<u64>("MONITOR_PERIOD_MINUTES", 5) * 60),
            notification_freshness_horizon: Duration::from_secs(
                env_or::<u64>("NOTIFICATION_FRESHNESS_HORIZON_MINUTES", 60) * 60,
            ),

            summary_min_source_delta: env_or("SUMMARY_MIN_SOURCE_DELTA", 2),
            summary_regen_horizon: Duration::from_secs(
                env_or::<u64>("SUMMARY_REGEN_HORIZON_HOURS", 12) * 3600,
            ),
            summary_batch_cadence: Duration::from_secs(
                env_or::<u64>("SUMMARY_BATCH_CADENCE_MINUTES", 30) * 60,
            ),
            batch_max_size: env_or("BATCH_MAX_SIZE", 500),
            batch_backfill_hours: env_or("BATCH_BACKFILL_HOURS", 48),

            entry_age_horizon: Duration::from_secs(env_or::<u64>("ENTRY_AGE_HORIZON_DAYS", 7) * 86400),
            dedup_window_days: env_or("DEDUP_WINDOW_DAYS", 7),
            simhash_distance_threshold: env_or("SIMHASH_DISTANCE_THRESHOLD", 3),
            article_ttl_days: env_or("ARTICLE_TTL_DAYS", 30),
            cluster_ttl_days: env_or("CLUSTER_TTL_DAYS", 90),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table_when_unset() {
        env::set_var("DATABASE_URL", "postgres://test/test");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.feeds_per_tick, 10);
        assert_eq!(cfg.feed_cooldown.as_secs(), 180);
        assert_eq!(cfg.feed_cooldown_tier1.as_secs(), 60);
        assert_eq!(cfg.cluster_sim_threshold, 0.50);
        assert_eq!(cfg.cluster_entity_min, 3);
        assert_eq!(cfg.breaking_idle_timeout.as_secs(), 90 * 60);
        assert_eq!(cfg.batch_max_size, 500);
    }

    #[test]
    fn missing_database_url_is_fatal() {
        env::remove_var("DATABASE_URL");
        let err = Config::from_env().unwrap_err();
        assert!(err.is_fatal());
    }
}
