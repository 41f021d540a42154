//! Two-tier response cache.
//!
//! Maps a normalized query fingerprint to a previously synthesized answer
//! with a time-to-live. Reads check a fast in-process LRU tier first, then
//! a shared durable tier behind the [`CacheTier`] trait (a network
//! key-value store in production; [`SqliteCacheTier`] and
//! [`MemoryCacheTier`] here). Writes go to both tiers.
//!
//! TTL is enforced by the durable tier's expiry; the local tier tracks its
//! own expiry timestamp, set from the durable entry's remaining lifetime on
//! fill, so it never outlives the durable entry. Expired entries are
//! treated as misses at read time and evicted on contact — never served.
//!
//! Fingerprints are derived from (scope, normalized query text, retrieval
//! parameters), never from caller identity: the scope determines the answer
//! for shared content, so equal questions from different users share an
//! entry. Invalidation is exact per document via a tag reverse index
//! (`doc:<id>`), with a whole-scope flush (`scope:<tag>`) as the
//! conservative fallback.
//!
//! A durable-tier outage degrades to a forced miss and is logged; local
//! failures cannot occur beyond eviction. Racing fills for one fingerprint
//! resolve last-write-wins rather than serializing callers.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::error::CacheUnavailableError;

/// Retrieval parameters folded into the fingerprint. Changing any of them
/// (or the embedding model) must never serve an answer computed under the
/// old parameters.
#[derive(Debug, Clone)]
pub struct FingerprintParams {
    pub top_k: usize,
    pub min_score: f32,
    pub model_version: String,
}

/// Derive the cache key for (scope, query, parameters).
///
/// The query text is normalized (trimmed, lowercased, whitespace collapsed)
/// so trivially different spellings of the same question share an entry.
pub fn fingerprint(scope: &str, query: &str, params: &FingerprintParams) -> String {
    let normalized = query
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update([0]);
    hasher.update(normalized.as_bytes());
    hasher.update([0]);
    hasher.update(params.top_k.to_le_bytes());
    hasher.update(params.min_score.to_le_bytes());
    hasher.update(params.model_version.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A synthesized answer held by the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnswer {
    pub answer: String,
    pub scope: String,
    pub source_chunk_ids: Vec<String>,
    pub source_document_ids: Vec<String>,
    pub created_at: i64,
}

/// Tag recorded against every entry for per-document invalidation.
pub fn document_tag(document_id: &str) -> String {
    format!("doc:{}", document_id)
}

/// Tag recorded against every entry for whole-scope invalidation.
pub fn scope_tag(scope: &str) -> String {
    format!("scope:{}", scope)
}

/// Shared durable cache tier: key-value with TTL and delete-by-tag.
///
/// `get` returns the value together with its remaining lifetime so the
/// local tier can expire no later than the durable entry.
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get(&self, key: &str)
        -> Result<Option<(CachedAnswer, Duration)>, CacheUnavailableError>;

    async fn set(
        &self,
        key: &str,
        value: &CachedAnswer,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), CacheUnavailableError>;

    async fn delete(&self, key: &str) -> Result<(), CacheUnavailableError>;

    /// Delete every entry recorded under `tag`. Returns how many went.
    async fn delete_by_tag(&self, tag: &str) -> Result<u64, CacheUnavailableError>;
}

// ============ SQLite durable tier ============

/// Durable tier backed by the shared SQLite database, with lazy expiry
/// enforced in SQL.
pub struct SqliteCacheTier {
    pool: SqlitePool,
}

impl SqliteCacheTier {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Drop expired rows; safe to run periodically.
    pub async fn purge_expired(&self) -> Result<u64, CacheUnavailableError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "DELETE FROM cache_tags WHERE key IN \
             (SELECT key FROM cache_entries WHERE expires_at <= ?)",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected())
    }
}

fn unavailable(e: sqlx::Error) -> CacheUnavailableError {
    CacheUnavailableError(e.to_string())
}

#[async_trait]
impl CacheTier for SqliteCacheTier {
    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<(CachedAnswer, Duration)>, CacheUnavailableError> {
        let now = Utc::now().timestamp();
        let row = sqlx::query(
            "SELECT value, expires_at FROM cache_entries WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        match row {
            None => Ok(None),
            Some(row) => {
                let value: String = row.get("value");
                let expires_at: i64 = row.get("expires_at");
                let answer: CachedAnswer = serde_json::from_str(&value)
                    .map_err(|e| CacheUnavailableError(format!("corrupt cache entry: {}", e)))?;
                let remaining = Duration::from_secs((expires_at - now).max(0) as u64);
                Ok(Some((answer, remaining)))
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &CachedAnswer,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), CacheUnavailableError> {
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        let json = serde_json::to_string(value)
            .map_err(|e| CacheUnavailableError(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        sqlx::query(
            "INSERT INTO cache_entries (key, value, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(&json)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        sqlx::query("DELETE FROM cache_tags WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

        for tag in tags {
            sqlx::query("INSERT OR IGNORE INTO cache_tags (tag, key) VALUES (?, ?)")
                .bind(tag)
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
        }

        tx.commit().await.map_err(unavailable)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheUnavailableError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        sqlx::query("DELETE FROM cache_tags WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<u64, CacheUnavailableError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let keys: Vec<String> = sqlx::query_scalar("SELECT key FROM cache_tags WHERE tag = ?")
            .bind(tag)
            .fetch_all(&mut *tx)
            .await
            .map_err(unavailable)?;

        for key in &keys {
            sqlx::query("DELETE FROM cache_entries WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
            sqlx::query("DELETE FROM cache_tags WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
        }

        tx.commit().await.map_err(unavailable)?;
        Ok(keys.len() as u64)
    }
}

// ============ In-memory durable tier ============

struct MemoryEntry {
    answer: CachedAnswer,
    expires_at: Instant,
    tags: Vec<String>,
}

/// In-memory [`CacheTier`] for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryCacheTier {
    entries: Mutex<std::collections::HashMap<String, MemoryEntry>>,
}

impl MemoryCacheTier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheTier for MemoryCacheTier {
    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<(CachedAnswer, Duration)>, CacheUnavailableError> {
        let mut entries = self.entries.lock().expect("cache tier lock poisoned");
        match entries.get(key) {
            None => Ok(None),
            Some(entry) => {
                let now = Instant::now();
                if entry.expires_at <= now {
                    entries.remove(key);
                    return Ok(None);
                }
                Ok(Some((entry.answer.clone(), entry.expires_at - now)))
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &CachedAnswer,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), CacheUnavailableError> {
        let mut entries = self.entries.lock().expect("cache tier lock poisoned");
        entries.insert(
            key.to_string(),
            MemoryEntry {
                answer: value.clone(),
                expires_at: Instant::now() + ttl,
                tags: tags.to_vec(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheUnavailableError> {
        self.entries
            .lock()
            .expect("cache tier lock poisoned")
            .remove(key);
        Ok(())
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<u64, CacheUnavailableError> {
        let mut entries = self.entries.lock().expect("cache tier lock poisoned");
        let before = entries.len();
        entries.retain(|_, e| !e.tags.iter().any(|t| t == tag));
        Ok((before - entries.len()) as u64)
    }
}

// ============ Response cache (both tiers) ============

struct LocalEntry {
    answer: CachedAnswer,
    expires_at: Instant,
}

/// The two-tier response cache handed to the pipeline.
pub struct ResponseCache {
    local: Mutex<LruCache<String, LocalEntry>>,
    durable: std::sync::Arc<dyn CacheTier>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(
        local_capacity: NonZeroUsize,
        ttl: Duration,
        durable: std::sync::Arc<dyn CacheTier>,
    ) -> Self {
        Self {
            local: Mutex::new(LruCache::new(local_capacity)),
            durable,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a fingerprint: local tier first, then durable. A durable
    /// hit refills the local tier with the entry's remaining lifetime.
    pub async fn get(&self, key: &str) -> Option<CachedAnswer> {
        {
            let mut local = self.local.lock().expect("local cache lock poisoned");
            if let Some(entry) = local.get(key) {
                if entry.expires_at > Instant::now() {
                    return Some(entry.answer.clone());
                }
                local.pop(key);
            }
        }

        match self.durable.get(key).await {
            Ok(Some((answer, remaining))) => {
                let mut local = self.local.lock().expect("local cache lock poisoned");
                local.put(
                    key.to_string(),
                    LocalEntry {
                        answer: answer.clone(),
                        expires_at: Instant::now() + remaining,
                    },
                );
                Some(answer)
            }
            Ok(None) => None,
            Err(e) => {
                // Degraded, not failed: treat the outage as a miss.
                debug!("durable cache tier read failed, treating as miss: {}", e);
                None
            }
        }
    }

    /// Write an answer through both tiers. Durable-tier failures are logged
    /// and swallowed; a cache write must never fail the query it serves.
    pub async fn put(&self, key: &str, answer: CachedAnswer) {
        let mut tags: Vec<String> = answer
            .source_document_ids
            .iter()
            .map(|id| document_tag(id))
            .collect();
        tags.push(scope_tag(&answer.scope));

        {
            let mut local = self.local.lock().expect("local cache lock poisoned");
            local.put(
                key.to_string(),
                LocalEntry {
                    answer: answer.clone(),
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }

        if let Err(e) = self.durable.set(key, &answer, self.ttl, &tags).await {
            warn!("durable cache tier write failed: {}", e);
        }
    }

    /// Drop every entry whose recorded sources include `document_id`.
    pub async fn invalidate_document(&self, document_id: &str) {
        {
            let mut local = self.local.lock().expect("local cache lock poisoned");
            let stale: Vec<String> = local
                .iter()
                .filter(|(_, e)| {
                    e.answer
                        .source_document_ids
                        .iter()
                        .any(|id| id == document_id)
                })
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                local.pop(&key);
            }
        }

        if let Err(e) = self.durable.delete_by_tag(&document_tag(document_id)).await {
            warn!(
                "durable cache invalidation failed for document {}: {}",
                document_id, e
            );
        }
    }

    /// Conservative fallback: drop every entry recorded under a scope.
    pub async fn invalidate_scope(&self, scope: &str) {
        {
            let mut local = self.local.lock().expect("local cache lock poisoned");
            let stale: Vec<String> = local
                .iter()
                .filter(|(_, e)| e.answer.scope == scope)
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                local.pop(&key);
            }
        }

        if let Err(e) = self.durable.delete_by_tag(&scope_tag(scope)).await {
            warn!("durable cache scope flush failed for {}: {}", scope, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn params() -> FingerprintParams {
        FingerprintParams {
            top_k: 5,
            min_score: 0.25,
            model_version: "m1".to_string(),
        }
    }

    fn answer(scope: &str, docs: &[&str]) -> CachedAnswer {
        CachedAnswer {
            answer: "because photosynthesis".to_string(),
            scope: scope.to_string(),
            source_chunk_ids: vec!["c1".to_string()],
            source_document_ids: docs.iter().map(|d| d.to_string()).collect(),
            created_at: 0,
        }
    }

    fn cache_with(tier: Arc<dyn CacheTier>, ttl: Duration) -> ResponseCache {
        ResponseCache::new(NonZeroUsize::new(4).unwrap(), ttl, tier)
    }

    #[test]
    fn test_fingerprint_normalizes_whitespace_and_case() {
        let p = params();
        let a = fingerprint("class-1", "What is  Photosynthesis? ", &p);
        let b = fingerprint("class-1", "what is photosynthesis?", &p);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_varies_by_scope_and_params() {
        let p = params();
        let base = fingerprint("class-1", "what is photosynthesis", &p);
        assert_ne!(base, fingerprint("class-2", "what is photosynthesis", &p));

        let mut other = params();
        other.top_k = 7;
        assert_ne!(base, fingerprint("class-1", "what is photosynthesis", &other));

        let mut other = params();
        other.model_version = "m2".to_string();
        assert_ne!(base, fingerprint("class-1", "what is photosynthesis", &other));
    }

    #[tokio::test]
    async fn test_put_then_get_roundtrip() {
        let cache = cache_with(Arc::new(MemoryCacheTier::new()), Duration::from_secs(60));
        cache.put("k1", answer("s", &["d1"])).await;
        let got = cache.get("k1").await.unwrap();
        assert_eq!(got.answer, "because photosynthesis");
        assert!(cache.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_local_eviction_falls_back_to_durable() {
        let cache = cache_with(Arc::new(MemoryCacheTier::new()), Duration::from_secs(60));
        // Capacity is 4; the fifth put evicts the least-recently-used key.
        for i in 0..5 {
            cache.put(&format!("k{}", i), answer("s", &["d1"])).await;
        }
        assert!(cache.get("k0").await.is_some());
    }

    #[tokio::test]
    async fn test_expired_entries_are_misses() {
        let cache = cache_with(Arc::new(MemoryCacheTier::new()), Duration::from_millis(30));
        cache.put("k1", answer("s", &["d1"])).await;
        assert!(cache.get("k1").await.is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get("k1").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_document_hits_both_tiers() {
        let cache = cache_with(Arc::new(MemoryCacheTier::new()), Duration::from_secs(60));
        cache.put("k1", answer("s", &["d1", "d2"])).await;
        cache.put("k2", answer("s", &["d3"])).await;

        cache.invalidate_document("d2").await;
        assert!(cache.get("k1").await.is_none());
        assert!(cache.get("k2").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_scope_flushes() {
        let cache = cache_with(Arc::new(MemoryCacheTier::new()), Duration::from_secs(60));
        cache.put("k1", answer("algebra", &["d1"])).await;
        cache.put("k2", answer("biology", &["d2"])).await;

        cache.invalidate_scope("algebra").await;
        assert!(cache.get("k1").await.is_none());
        assert!(cache.get("k2").await.is_some());
    }

    struct FailingTier;

    #[async_trait]
    impl CacheTier for FailingTier {
        async fn get(
            &self,
            _key: &str,
        ) -> Result<Option<(CachedAnswer, Duration)>, CacheUnavailableError> {
            Err(CacheUnavailableError("connection refused".to_string()))
        }
        async fn set(
            &self,
            _key: &str,
            _value: &CachedAnswer,
            _ttl: Duration,
            _tags: &[String],
        ) -> Result<(), CacheUnavailableError> {
            Err(CacheUnavailableError("connection refused".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheUnavailableError> {
            Err(CacheUnavailableError("connection refused".to_string()))
        }
        async fn delete_by_tag(&self, _tag: &str) -> Result<u64, CacheUnavailableError> {
            Err(CacheUnavailableError("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_durable_outage_degrades_to_local() {
        let cache = cache_with(Arc::new(FailingTier), Duration::from_secs(60));
        // Write-through fails silently; the local tier still serves.
        cache.put("k1", answer("s", &["d1"])).await;
        assert!(cache.get("k1").await.is_some());
        // A key that never hit the local tier is simply a miss.
        assert!(cache.get("cold").await.is_none());
    }

    #[tokio::test]
    async fn test_durable_outage_still_honors_ttl() {
        let cache = cache_with(Arc::new(FailingTier), Duration::from_millis(30));
        cache.put("k1", answer("s", &["d1"])).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get("k1").await.is_none());
    }
}
