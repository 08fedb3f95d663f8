//! Durable rate-limit storage contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// A persisted counter row. Invariant: `0 <= count`; `reset_at > now()`
/// while the entry is live (enforced by the sweep, not by this type).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub count: u64,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.reset_at <= now
    }
}

/// Durable rate-limit store: a narrow async trait any backend can
/// implement, with errors kept local to this module rather than bleeding
/// `sqlx::Error` into callers.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Upsert the counter for `principal_key`. Implementations should be
    /// safe to call from both fire-and-forget (HTTP-style) and awaited
    /// (duplex-stream) call sites.
    async fn upsert(&self, principal_key: &str, entry: RateLimitEntry) -> anyhow::Result<()>;

    /// Load the persisted row for `principal_key`, if any.
    async fn get(&self, principal_key: &str) -> anyhow::Result<Option<RateLimitEntry>>;

    /// Delete all rows whose `reset_at <= now`. Returns the number removed.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;
}

/// SQLite-backed implementation: connect, then run idempotent migrations
/// before the pool is handed to callers.
pub struct SqliteRateLimitStore {
    pool: SqlitePool,
}

impl SqliteRateLimitStore {
    pub async fn new(pool: SqlitePool) -> anyhow::Result<Self> {
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rate_limits (
                principal_key TEXT PRIMARY KEY NOT NULL,
                count INTEGER NOT NULL,
                reset_at TEXT NOT NULL
            );",
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for SqliteRateLimitStore {
    async fn upsert(&self, principal_key: &str, entry: RateLimitEntry) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO rate_limits (principal_key, count, reset_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(principal_key) DO UPDATE SET count = ?2, reset_at = ?3",
        )
        .bind(principal_key)
        .bind(entry.count as i64)
        .bind(entry.reset_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, principal_key: &str) -> anyhow::Result<Option<RateLimitEntry>> {
        let row = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
            "SELECT count, reset_at FROM rate_limits WHERE principal_key = ?1",
        )
        .bind(principal_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(count, reset_at)| RateLimitEntry {
            count: count as u64,
            reset_at,
        }))
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE reset_at <= ?1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
