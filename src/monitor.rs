//! Periodic Monitor (C6): the half-of-the-status-machine that isn't driven
//! by an incoming article — idling BREAKING clusters out to VERIFIED after
//! quiet, and triggering notification delivery for clusters that just
//! crossed into BREAKING. Runs on a timer (`monitor_period`, default 5
//! minutes) rather than per-event, since both checks are wall-clock gated.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::notify::Notifier;
use crate::status::{self, StatusInputs};
use crate::store::{Container, DocumentStore, DocumentStoreExt};
use crate::types::{ClusterStatus, NewsreelError, Result, StoryCluster};

pub struct Monitor {
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
    config: Arc<Config>,
}

impl Monitor {
    pub fn new(store: Arc<dyn DocumentStore>, notifier: Arc<dyn Notifier>, config: Arc<Config>) -> Self {
        Self { store, notifier, config }
    }

    pub async fn run_once(&self) -> Result<usize> {
        let breaking = self.store.query_breaking_clusters().await?;
        let now = Utc::now();
        let mut transitioned = 0;

        for versioned in breaking {
            let cluster = versioned.value;
            if self.maybe_idle_out(cluster.clone(), versioned.version, now).await? {
                transitioned += 1;
            }
            self.maybe_notify(&cluster, now).await?;
        }
        Ok(transitioned)
    }

    /// Re-derives the status for a BREAKING cluster using only the
    /// wall-clock delta since `last_updated` (no new article arrived, so
    /// `is_gaining_sources` is false) and writes it back if it idled out.
    async fn maybe_idle_out(&self, cluster: StoryCluster, version: i64, now: chrono::DateTime<Utc>) -> Result<bool> {
        let delta_upd = now.signed_duration_since(cluster.last_updated);
        let delta_first = now.signed_duration_since(cluster.first_seen);
        let new_status = status::next_status(
            &StatusInputs {
                prev_status: cluster.status,
                verification_level: cluster.verification_level,
                delta_first,
                delta_upd,
                is_gaining_sources: false,
            },
            &self.config,
        );

        if new_status == cluster.status {
            return Ok(false);
        }

        let mut updated = cluster.clone();
        updated.status = new_status;
        updated.last_updated = now;
        updated.confidence_score = status::confidence_score(updated.verification_level, updated.update_count);
        updated.importance_score = status::importance_score(updated.verification_level, updated.status, updated.entity_histogram.len());

        match self.store.compare_and_swap(Container::StoryClusters, &updated.category, &updated.id, version, &updated).await {
            Ok(_) => {
                info!(cluster_id = %updated.id, from = cluster.status.as_str(), to = new_status.as_str(), "monitor idle transition");
                Ok(true)
            }
            Err(NewsreelError::Conflict { .. }) => {
                debug!(cluster_id = %updated.id, "skipping idle transition, cluster changed concurrently");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Sends the breaking-news push exactly once per cluster, gated on
    /// `Δ_first` (now - `first_seen`) against the freshness horizon per
    /// §4.6 — an old story resurrected from a backlog should not page
    /// anyone even if it is presently BREAKING.
    async fn maybe_notify(&self, cluster: &StoryCluster, now: chrono::DateTime<Utc>) -> Result<()> {
        if cluster.status != ClusterStatus::Breaking {
            return Ok(());
        }
        if self.store.has_notification(&cluster.id).await? {
            return Ok(());
        }
        let delta_first = now.signed_duration_since(cluster.first_seen);
        if delta_first > chrono::Duration::from_std(self.config.notification_freshness_horizon).unwrap_or_default() {
            debug!(cluster_id = %cluster.id, "breaking cluster outside notification freshness horizon, skipping");
            return Ok(());
        }

        match self.notifier.notify_breaking(cluster).await {
            Ok(()) => self.store.record_notification(&cluster.id).await,
            Err(e) => {
                warn!(cluster_id = %cluster.id, error = %e, "notification delivery failed");
                Err(e)
            }
        }
    }

    pub async fn run_forever(&self) {
        loop {
            match self.run_once().await {
                Ok(n) if n > 0 => debug!(transitioned = n, "monitor sweep complete"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "monitor sweep failed"),
            }
            tokio::time::sleep(self.config.monitor_period.max(StdDuration::from_secs(1))).await;
        }
    }
}
