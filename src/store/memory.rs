//! In-process fallback backend
//!
//! Holds chunks in a map and scores searches with local cosine similarity.
//! Functionally equivalent to the external store but unindexed; used when
//! the vector database is unreachable.

use super::{
    CollectionStats, DocumentSummary, SearchFilters, SearchResult, StoreBackend, StoredChunk,
};
use crate::embedding::EmbeddingService;
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Map-backed store used in fallback mode
pub struct MemoryBackend {
    chunks: RwLock<HashMap<Uuid, StoredChunk>>,
    vector_size: usize,
}

impl MemoryBackend {
    pub fn new(vector_size: usize) -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
            vector_size,
        }
    }

    fn matches(chunk: &StoredChunk, filters: &SearchFilters) -> bool {
        if let Some(source) = &filters.source_file {
            if &chunk.source_file != source {
                return false;
            }
        }

        if let Some(sources) = &filters.source_files {
            if !sources.iter().any(|s| s == &chunk.source_file) {
                return false;
            }
        }

        if let Some(index) = filters.chunk_index {
            if chunk.chunk_index != index {
                return false;
            }
        }

        if let Some(min) = filters.chunk_index_min {
            if chunk.chunk_index < min {
                return false;
            }
        }

        if let Some(max) = filters.chunk_index_max {
            if chunk.chunk_index > max {
                return false;
            }
        }

        if let Some(after) = filters.created_after {
            if chunk.created_at < after {
                return false;
            }
        }

        if let Some(before) = filters.created_before {
            if chunk.created_at > before {
                return false;
            }
        }

        for (key, expected) in &filters.metadata {
            if chunk.metadata.get(key) != Some(expected) {
                return false;
            }
        }

        true
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn upsert(&self, chunks: &[StoredChunk]) -> Result<()> {
        let mut map = self.chunks.write().await;
        for chunk in chunks {
            map.insert(chunk.id, chunk.clone());
        }
        debug!("Upserted {} chunks into memory store", chunks.len());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<StoredChunk>> {
        Ok(self.chunks.read().await.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.chunks.write().await.remove(&id);
        Ok(())
    }

    async fn delete_by_source(&self, source_file: &str) -> Result<usize> {
        let mut map = self.chunks.write().await;
        let before = map.len();
        map.retain(|_, chunk| chunk.source_file != source_file);
        Ok(before - map.len())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f32,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        let map = self.chunks.read().await;

        let mut results: Vec<SearchResult> = map
            .values()
            .filter(|chunk| Self::matches(chunk, filters))
            .filter_map(|chunk| {
                let score = EmbeddingService::similarity(query, &chunk.vector).clamp(0.0, 1.0);
                (score >= min_score).then(|| SearchResult {
                    id: chunk.id,
                    text: chunk.text.clone(),
                    score,
                    source_file: chunk.source_file.clone(),
                    chunk_index: chunk.chunk_index,
                    metadata: chunk.metadata.clone(),
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(top_k);

        debug!("In-memory search returned {} results", results.len());
        Ok(results)
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DocumentSummary>> {
        let map = self.chunks.read().await;

        let mut grouped: BTreeMap<String, DocumentSummary> = BTreeMap::new();
        for chunk in map.values() {
            let entry = grouped
                .entry(chunk.source_file.clone())
                .or_insert_with(|| DocumentSummary {
                    source_file: chunk.source_file.clone(),
                    chunk_count: 0,
                    created_at: chunk.created_at,
                    updated_at: chunk.updated_at,
                    metadata: chunk.metadata.clone(),
                });
            entry.chunk_count += 1;
            entry.created_at = entry.created_at.min(chunk.created_at);
            entry.updated_at = entry.updated_at.max(chunk.updated_at);
        }

        Ok(grouped.into_values().skip(offset).take(limit).collect())
    }

    async fn stats(&self) -> Result<CollectionStats> {
        let map = self.chunks.read().await;

        let mut source_files: Vec<String> = map
            .values()
            .map(|chunk| chunk.source_file.clone())
            .collect();
        source_files.sort();
        source_files.dedup();

        Ok(CollectionStats {
            total_points: map.len(),
            total_vectors: map.len(),
            approx_size_bytes: map.len() * self.vector_size * std::mem::size_of::<f32>(),
            source_files,
            last_updated: Utc::now(),
        })
    }

    async fn clear(&self) -> Result<()> {
        self.chunks.write().await.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests_support::chunk_with;

    #[tokio::test]
    async fn test_upsert_get_delete() {
        let backend = MemoryBackend::new(4);
        let chunk = chunk_with("a.txt", 0, vec![1.0, 0.0, 0.0, 0.0]);
        let id = chunk.id;

        backend.upsert(&[chunk]).await.unwrap();
        assert!(backend.get(id).await.unwrap().is_some());

        backend.delete(id).await.unwrap();
        assert!(backend.get(id).await.unwrap().is_none());

        // Delete is idempotent
        backend.delete(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_idempotent_last_wins() {
        let backend = MemoryBackend::new(4);
        let mut chunk = chunk_with("a.txt", 0, vec![1.0, 0.0, 0.0, 0.0]);
        let id = chunk.id;

        backend.upsert(std::slice::from_ref(&chunk)).await.unwrap();
        chunk.text = "updated text".to_string();
        backend.upsert(&[chunk]).await.unwrap();

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.total_points, 1);
        assert_eq!(backend.get(id).await.unwrap().unwrap().text, "updated text");
    }

    #[tokio::test]
    async fn test_search_ranking_and_threshold() {
        let backend = MemoryBackend::new(4);
        backend
            .upsert(&[
                chunk_with("a.txt", 0, vec![1.0, 0.0, 0.0, 0.0]),
                chunk_with("a.txt", 1, vec![0.9, 0.1, 0.0, 0.0]),
                chunk_with("b.txt", 0, vec![0.0, 1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let results = backend
            .search(&[1.0, 0.0, 0.0, 0.0], 10, 0.5, &SearchFilters::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].score >= results[1].score);
        assert!(results.iter().all(|r| r.score >= 0.5));
    }

    #[tokio::test]
    async fn test_search_filters() {
        let backend = MemoryBackend::new(4);
        backend
            .upsert(&[
                chunk_with("a.txt", 0, vec![1.0, 0.0, 0.0, 0.0]),
                chunk_with("b.txt", 3, vec![1.0, 0.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let filters = SearchFilters {
            source_file: Some("b.txt".to_string()),
            ..SearchFilters::default()
        };
        let results = backend
            .search(&[1.0, 0.0, 0.0, 0.0], 10, 0.0, &filters)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_file, "b.txt");

        let filters = SearchFilters {
            chunk_index_min: Some(1),
            chunk_index_max: Some(5),
            ..SearchFilters::default()
        };
        let results = backend
            .search(&[1.0, 0.0, 0.0, 0.0], 10, 0.0, &filters)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_index, 3);
    }

    #[tokio::test]
    async fn test_delete_by_source_then_search_empty() {
        let backend = MemoryBackend::new(4);
        backend
            .upsert(&[
                chunk_with("a.txt", 0, vec![1.0, 0.0, 0.0, 0.0]),
                chunk_with("a.txt", 1, vec![1.0, 0.0, 0.0, 0.0]),
                chunk_with("b.txt", 0, vec![1.0, 0.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let deleted = backend.delete_by_source("a.txt").await.unwrap();
        assert_eq!(deleted, 2);

        let filters = SearchFilters {
            source_file: Some("a.txt".to_string()),
            ..SearchFilters::default()
        };
        let results = backend
            .search(&[1.0, 0.0, 0.0, 0.0], 10, 0.0, &filters)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_list_groups_by_source() {
        let backend = MemoryBackend::new(4);
        backend
            .upsert(&[
                chunk_with("a.txt", 0, vec![1.0, 0.0, 0.0, 0.0]),
                chunk_with("a.txt", 1, vec![1.0, 0.0, 0.0, 0.0]),
                chunk_with("b.txt", 0, vec![1.0, 0.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let summaries = backend.list(10, 0).await.unwrap();
        assert_eq!(summaries.len(), 2);

        let a = summaries
            .iter()
            .find(|s| s.source_file == "a.txt")
            .unwrap();
        assert_eq!(a.chunk_count, 2);

        let paged = backend.list(10, 1).await.unwrap();
        assert_eq!(paged.len(), 1);
    }
}
