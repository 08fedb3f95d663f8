use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use moka::future::Cache;

use super::store::{RateLimitEntry, RateLimitStore};
use super::{Role, Tier, daily_limit};
use crate::error::GatewayError;

/// Cache cap.
pub const CACHE_CAPACITY: u64 = 10_000;
/// Sweep interval.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Enforces a per-principal daily ceiling with a process-local cache
/// write-through to a durable store.
///
/// The cache is `moka::future::Cache`. `max_capacity` gives us the
/// "drop oldest when over 10,000 entries" behavior as an eviction policy
/// rather than code we'd have to hand-roll and get wrong.
pub struct RateLimiter {
    cache: Cache<String, RateLimitEntry>,
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            cache: Cache::builder().max_capacity(CACHE_CAPACITY).build(),
            store,
        }
    }

    /// Spawn the periodic cache + durable-store sweep. Returns a handle the caller can abort on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                this.sweep_once().await;
            }
        })
    }

    async fn sweep_once(&self) {
        let now = Utc::now();
        self.cache.run_pending_tasks().await;
        // moka's invalidate_entries_if removes cache rows whose reset_at has
        // passed; the durable sweep does the same for persisted rows.
        self.cache
            .invalidate_entries_if(move |_, entry| entry.is_expired(now))
            .ok();
        if let Err(err) = self.store.sweep_expired(now).await {
            tracing::warn!(error = %err, "rate-limit durable sweep failed, cache-only mode continues");
        }
    }

    /// Increment the counter for `principal_key` and report whether this
    /// request exceeds the daily ceiling for `role`/`tier`. Unbounded principals (admin/enterprise) bypass the counter
    /// entirely — they are never read from or written to the cache/store.
    pub async fn check(
        &self,
        principal_key: &str,
        role: Role,
        tier: Tier,
    ) -> Result<(), GatewayError> {
        let Some(limit) = daily_limit(role, tier) else {
            return Ok(());
        };

        let now = Utc::now();
        let mut entry = self.load_or_init(principal_key, now).await;

        if entry.is_expired(now) {
            entry = RateLimitEntry {
                count: 0,
                reset_at: next_utc_midnight(now),
            };
        }

        entry.count += 1;
        self.cache.insert(principal_key.to_string(), entry).await;

        // Persist. The durable write can be fire-and-forget for
        // non-blocking (HTTP-style) callers, or awaited here for the
        // duplex-stream path — this method always awaits, which is correct
        // for the chat pipeline's blocking call site; HTTP-style callers
        // that want fire-and-forget should spawn this call instead of
        // awaiting it.
        if let Err(err) = self.store.upsert(principal_key, entry).await {
            tracing::warn!(error = %err, principal_key, "rate-limit durable write failed, continuing cache-only");
        }

        if entry.count > limit {
            let retry_after_seconds = (entry.reset_at - now).num_seconds().max(0) as u64;
            return Err(GatewayError::RateLimited {
                limit,
                retry_after_seconds,
            });
        }

        Ok(())
    }

    async fn load_or_init(&self, principal_key: &str, now: DateTime<Utc>) -> RateLimitEntry {
        if let Some(cached) = self.cache.get(principal_key).await {
            return cached;
        }

        match self.store.get(principal_key).await {
            Ok(Some(entry)) if !entry.is_expired(now) => {
                self.cache.insert(principal_key.to_string(), entry).await;
                entry
            }
            Ok(_) => RateLimitEntry {
                count: 0,
                reset_at: next_utc_midnight(now),
            },
            Err(err) => {
                tracing::warn!(error = %err, principal_key, "rate-limit durable read failed, starting cache-only entry");
                RateLimitEntry {
                    count: 0,
                    reset_at: next_utc_midnight(now),
                }
            }
        }
    }
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
    Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).unwrap())
}
