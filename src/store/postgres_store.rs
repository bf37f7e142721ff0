use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::debug;

use super::{ChangeEvent, ChangeOp, Container, DocumentStore, Versioned};
use crate::types::{FeedConfig, FeedPollState, NewsreelError, Result, StoryCluster};

/// Postgres-backed implementation of the document store contract. Every
/// container is stored in one generic `documents` table keyed by
/// `(container, partition_key, id)` with a JSONB body and an integer
/// version column for optimistic concurrency; a companion `change_log`
/// table gives per-partition ordered, resumable change delivery since
/// Postgres has no native Cosmos-style change feed. Domain-specific reads
/// (feeds due to poll, clustering candidates, ...) query the same JSONB
/// body with `->>`/cast expressions rather than a second normalized
/// schema, the same "one generic table, index what you query" move the
/// teacher's `FeedManager` makes with dedicated typed columns — the
/// tradeoff here is JSONB flexibility over compile-time-checked `query!`.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(20).connect(database_url).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                container TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                id TEXT NOT NULL,
                version BIGINT NOT NULL,
                body JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (container, partition_key, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_container_partition ON documents (container, partition_key)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_updated_at ON documents (container, updated_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS change_log (
                seq BIGSERIAL PRIMARY KEY,
                container TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                id TEXT NOT NULL,
                op TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_change_log_container_partition_seq ON change_log (container, partition_key, seq)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS checkpoints (lease_key TEXT PRIMARY KEY, checkpoint BIGINT NOT NULL)"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS leases (lease_key TEXT PRIMARY KEY, holder TEXT NOT NULL, expires_at TIMESTAMPTZ NOT NULL)"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS notifications (story_id TEXT PRIMARY KEY, broadcast_at TIMESTAMPTZ NOT NULL)"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS feed_configs (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                tier TEXT NOT NULL,
                category_hint TEXT,
                language TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        debug!("document store schema ready");
        Ok(())
    }

    pub async fn insert_feed_config(&self, feed: &FeedConfig) -> Result<()> {
        let tier_str = match feed.tier {
            crate::types::SourceTier::Tier1 => "tier1",
            crate::types::SourceTier::Tier2 => "tier2",
        };
        sqlx::query(
            "INSERT INTO feed_configs (id, url, tier, category_hint, language) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(feed.id.to_string())
        .bind(&feed.url)
        .bind(tier_str)
        .bind(&feed.category_hint)
        .bind(&feed.language)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_change(&self, container: Container, partition_key: &str, id: &str, op: ChangeOp) -> Result<i64> {
        let op_str = match op {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
        };
        let row = sqlx::query(
            "INSERT INTO change_log (container, partition_key, id, op) VALUES ($1, $2, $3, $4) RETURNING seq",
        )
        .bind(container.as_str())
        .bind(partition_key)
        .bind(id)
        .bind(op_str)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("seq")?)
    }

    /// Pull events for one partition past `after_seq`, oldest first. A
    /// polling-based stand-in for a native change feed; subscribers call
    /// this on an interval and advance their checkpoint after processing.
    pub async fn poll_changes(
        &self,
        container: Container,
        partition_key: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<ChangeEvent>> {
        let rows = sqlx::query(
            "SELECT seq, id, op FROM change_log WHERE container = $1 AND partition_key = $2 AND seq > $3 ORDER BY seq ASC LIMIT $4",
        )
        .bind(container.as_str())
        .bind(partition_key)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows_to_events(container, partition_key, rows)
    }

    /// Same as `poll_changes` but across every partition of a container, for
    /// subscribers (clustering, summarization) that do not shard by category.
    pub async fn poll_changes_all_partitions(
        &self,
        container: Container,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<ChangeEvent>> {
        let rows = sqlx::query(
            "SELECT seq, partition_key, id, op FROM change_log WHERE container = $1 AND seq > $2 ORDER BY seq ASC LIMIT $3",
        )
        .bind(container.as_str())
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let op_str: String = row.try_get("op")?;
            events.push(ChangeEvent {
                container,
                partition: row.try_get("partition_key")?,
                id: row.try_get("id")?,
                seq: row.try_get("seq")?,
                op: parse_op(&op_str),
            });
        }
        Ok(events)
    }
}

fn parse_op(s: &str) -> ChangeOp {
    if s == "insert" {
        ChangeOp::Insert
    } else {
        ChangeOp::Update
    }
}

fn rows_to_events(container: Container, partition_key: &str, rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<ChangeEvent>> {
    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let op_str: String = row.try_get("op")?;
        events.push(ChangeEvent {
            container,
            partition: partition_key.to_string(),
            id: row.try_get("id")?,
            seq: row.try_get("seq")?,
            op: parse_op(&op_str),
        });
    }
    Ok(events)
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn upsert_json(
        &self,
        container: Container,
        partition_key: &str,
        id: &str,
        value: serde_json::Value,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO documents (container, partition_key, id, version, body)
            VALUES ($1, $2, $3, 1, $4)
            ON CONFLICT (container, partition_key, id)
            DO UPDATE SET body = EXCLUDED.body, version = documents.version + 1, updated_at = now()
            RETURNING version
            "#,
        )
        .bind(container.as_str())
        .bind(partition_key)
        .bind(id)
        .bind(&value)
        .fetch_one(&self.pool)
        .await?;
        let version: i64 = row.try_get("version")?;
        self.append_change(container, partition_key, id, if version == 1 { ChangeOp::Insert } else { ChangeOp::Update })
            .await?;
        Ok(version)
    }

    async fn get_json(
        &self,
        container: Container,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<Versioned<serde_json::Value>>> {
        let row = sqlx::query("SELECT body, version FROM documents WHERE container = $1 AND partition_key = $2 AND id = $3")
            .bind(container.as_str())
            .bind(partition_key)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let body: serde_json::Value = row.try_get("body")?;
                let version: i64 = row.try_get("version")?;
                Ok(Some(Versioned { value: body, version }))
            }
        }
    }

    async fn compare_and_swap_json(
        &self,
        container: Container,
        partition_key: &str,
        id: &str,
        expected_version: i64,
        value: serde_json::Value,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE documents SET body = $4, version = version + 1, updated_at = now()
            WHERE container = $1 AND partition_key = $2 AND id = $3 AND version = $5
            RETURNING version
            "#,
        )
        .bind(container.as_str())
        .bind(partition_key)
        .bind(id)
        .bind(&value)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let version = row.try_get("version")?;
                self.append_change(container, partition_key, id, ChangeOp::Update).await?;
                Ok(version)
            }
            None => Err(NewsreelError::Conflict { entity: format!("{}/{}/{}", container.as_str(), partition_key, id) }),
        }
    }

    async fn commit_checkpoint(&self, lease_key: &str, checkpoint: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkpoints (lease_key, checkpoint) VALUES ($1, $2) ON CONFLICT (lease_key) DO UPDATE SET checkpoint = EXCLUDED.checkpoint",
        )
        .bind(lease_key)
        .bind(checkpoint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_checkpoint(&self, lease_key: &str) -> Result<i64> {
        let row = sqlx::query("SELECT checkpoint FROM checkpoints WHERE lease_key = $1")
            .bind(lease_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<i64, _>("checkpoint")).transpose()?.unwrap_or(0))
    }

    async fn try_acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let result = sqlx::query(
            r#"
            INSERT INTO leases (lease_key, holder, expires_at) VALUES ($1, $2, $3)
            ON CONFLICT (lease_key) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE leases.expires_at < now()
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let row = sqlx::query("SELECT holder FROM leases WHERE lease_key = $1").bind(key).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| r.try_get::<String, _>("holder").ok() == Some(holder.to_string())).unwrap_or(false))
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM leases WHERE lease_key = $1 AND holder = $2")
            .bind(key)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query_cluster_candidates(
        &self,
        category: &str,
        updated_after: DateTime<Utc>,
        published_after: DateTime<Utc>,
        published_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Versioned<StoryCluster>>> {
        let rows = sqlx::query(
            r#"
            SELECT body, version FROM documents
            WHERE container = $1 AND partition_key = $2
              AND (body->>'last_updated')::timestamptz >= $3
              AND (body->>'first_seen')::timestamptz BETWEEN $4 AND $5
            ORDER BY (body->>'last_updated')::timestamptz DESC
            LIMIT $6
            "#,
        )
        .bind(Container::StoryClusters.as_str())
        .bind(category)
        .bind(updated_after)
        .bind(published_after)
        .bind(published_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        deserialize_versioned_rows(rows)
    }

    async fn query_feeds_due(&self, limit: usize) -> Result<Vec<FeedPollState>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM documents
            WHERE container = $1
            ORDER BY (body->>'last_poll_at') ASC NULLS FIRST
            LIMIT $2
            "#,
        )
        .bind(Container::FeedPollState.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let body: serde_json::Value = row.try_get("body")?;
            out.push(serde_json::from_value(body)?);
        }
        Ok(out)
    }

    async fn list_all_feed_configs(&self) -> Result<Vec<FeedConfig>> {
        let rows = sqlx::query("SELECT id, url, tier, category_hint, language FROM feed_configs")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let tier_str: String = row.try_get("tier")?;
            out.push(FeedConfig {
                id: row.try_get::<String, _>("id")?.parse().map_err(|_| NewsreelError::General("bad feed id".into()))?,
                url: row.try_get("url")?,
                tier: if tier_str == "tier1" { crate::types::SourceTier::Tier1 } else { crate::types::SourceTier::Tier2 },
                category_hint: row.try_get("category_hint")?,
                language: row.try_get("language")?,
            });
        }
        Ok(out)
    }

    async fn query_batch_summary_candidates(
        &self,
        older_than: DateTime<Utc>,
        min_source_delta: usize,
        limit: usize,
    ) -> Result<Vec<Versioned<StoryCluster>>> {
        let rows = sqlx::query(
            r#"
            SELECT body, version FROM documents
            WHERE container = $1
              AND (body->>'first_seen')::timestamptz <= $2
              AND (
                  body->'summary' IS NULL
                  OR (body->'summary'->>'source_count_at_generation')::int + $3 <= (
                      SELECT jsonb_array_length(body->'source_articles')
                  )
              )
            LIMIT $4
            "#,
        )
        .bind(Container::StoryClusters.as_str())
        .bind(older_than)
        .bind(min_source_delta as i32)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        deserialize_versioned_rows(rows)
    }

    async fn query_breaking_clusters(&self) -> Result<Vec<Versioned<StoryCluster>>> {
        let rows = sqlx::query(
            "SELECT body, version FROM documents WHERE container = $1 AND body->>'status' = 'BREAKING'",
        )
        .bind(Container::StoryClusters.as_str())
        .fetch_all(&self.pool)
        .await?;
        deserialize_versioned_rows(rows)
    }

    async fn has_notification(&self, story_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM notifications WHERE story_id = $1").bind(story_id).fetch_optional(&self.pool).await?;
        Ok(row.is_some())
    }

    async fn record_notification(&self, story_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO notifications (story_id, broadcast_at) VALUES ($1, now()) ON CONFLICT DO NOTHING")
            .bind(story_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn deserialize_versioned_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Versioned<StoryCluster>>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let body: serde_json::Value = row.try_get("body")?;
        let version: i64 = row.try_get("version")?;
        out.push(Versioned { value: serde_json::from_value(body)?, version });
    }
    Ok(out)
}
