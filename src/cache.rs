//! Content-addressed embedding cache with a SQLite backend
//!
//! Keys are derived from the model identifier and the exact input text, so
//! identical texts re-embedded under the same model are served from disk.
//! Entries expire after a configurable TTL. A cache failure is never allowed
//! to fail an embedding request.

use crate::config::CacheConfig;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use md5::{Digest, Md5};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Embedding cache with SQLite backend
pub struct EmbeddingCache {
    pool: SqlitePool,
    config: CacheConfig,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl EmbeddingCache {
    /// Create a new embedding cache
    pub async fn new(config: CacheConfig) -> Result<Self> {
        info!("Initializing embedding cache at: {}", config.db_path);

        if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.db_path))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embedding_cache (
                key TEXT PRIMARY KEY,
                vector BLOB NOT NULL,
                model TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_embedding_cache_created_at ON embedding_cache(created_at)",
        )
        .execute(&pool)
        .await?;

        info!("Embedding cache initialized");

        Ok(Self {
            pool,
            config,
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Compute a deterministic cache key from the model id and input text
    pub fn compute_key(model: &str, text: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Serialize a vector for storage
    fn serialize_vector(vector: &[f32]) -> Vec<u8> {
        vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Deserialize a vector from storage
    fn deserialize_vector(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    /// Get a cached vector if present and not expired
    pub async fn get(&self, key: &str) -> Result<Option<Vec<f32>>> {
        use std::sync::atomic::Ordering;

        if !self.config.enabled {
            return Ok(None);
        }

        let row = sqlx::query_as::<_, (Vec<u8>, String)>(
            "SELECT vector, created_at FROM embedding_cache WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((blob, created_at_str)) = row {
            let created_at = DateTime::parse_from_rfc3339(&created_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());

            let age = Utc::now().signed_duration_since(created_at);
            if age > Duration::seconds(self.config.ttl_seconds) {
                debug!(
                    "Cache entry expired (age: {}s, ttl: {}s)",
                    age.num_seconds(),
                    self.config.ttl_seconds
                );
                self.invalidate(key).await?;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }

            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(Self::deserialize_vector(&blob)));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Store a vector under the given key
    pub async fn set(&self, key: &str, model: &str, vector: &[f32]) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO embedding_cache (key, vector, model, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(key)
        .bind(Self::serialize_vector(vector))
        .bind(model)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a single entry
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM embedding_cache WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove all entries
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM embedding_cache")
            .execute(&self.pool)
            .await?;
        info!("Cleared {} cached embeddings", result.rows_affected());
        Ok(result.rows_affected())
    }

    /// Get cache statistics
    pub async fn stats(&self) -> Result<CacheStats> {
        use std::sync::atomic::Ordering;

        let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        Ok(CacheStats {
            entries: row.0 as usize,
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        })
    }
}
