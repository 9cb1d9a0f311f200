//! Qdrant-backed storage
//!
//! Owns one collection with cosine distance and payload indexes on the
//! filterable fields. Chunk ids are UUID point ids; payloads carry the text,
//! position fields and free-form metadata. `created_at_ts` duplicates the
//! RFC3339 timestamp as unix seconds because range filters are numeric.

use super::{
    CollectionStats, DocumentSummary, SearchFilters, SearchResult, StoreBackend, StoredChunk,
};
use crate::config::DatabaseConfig;
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    DeletePointsBuilder, Distance, FieldType, Filter, GetPointsBuilder, ListValue, PointId,
    PointStruct, PointsIdsList, Range, RetrievedPoint, ScrollPointsBuilder, SearchPointsBuilder,
    Struct, UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCROLL_PAGE: u32 = 1000;

/// Qdrant-backed store
pub struct QdrantBackend {
    client: Qdrant,
    collection_name: String,
    vector_size: usize,
}

impl QdrantBackend {
    /// Connect and ensure the collection and payload indexes exist
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to Qdrant at {}", config.qdrant_url);

        let mut builder = Qdrant::from_url(&config.qdrant_url);
        if let Some(api_key) = &config.qdrant_api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| StoreError::Collection(format!("Qdrant connection failed: {e}")))?;

        let backend = Self {
            client,
            collection_name: config.collection_name.clone(),
            vector_size: config.vector_size,
        };

        backend.ensure_collection().await?;
        info!("Qdrant collection '{}' ready", config.collection_name);
        Ok(backend)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection_name)
            .await
            .map_err(|e| StoreError::Collection(format!("Collection check failed: {e}")))?;

        if !exists {
            info!("Creating collection: {}", self.collection_name);
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection_name).vectors_config(
                        VectorParamsBuilder::new(self.vector_size as u64, Distance::Cosine),
                    ),
                )
                .await
                .map_err(|e| StoreError::Collection(format!("Collection create failed: {e}")))?;
        }

        for (field, field_type) in [
            ("source_file", FieldType::Keyword),
            ("chunk_index", FieldType::Integer),
            ("created_at_ts", FieldType::Float),
        ] {
            if let Err(e) = self
                .client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    &self.collection_name,
                    field,
                    field_type,
                ))
                .await
            {
                warn!("Payload index on '{}' not created: {}", field, e);
            }
        }

        Ok(())
    }

    fn chunk_to_point(chunk: &StoredChunk) -> PointStruct {
        let mut payload: HashMap<String, Value> = HashMap::new();
        payload.insert("text".to_string(), string_value(&chunk.text));
        payload.insert(
            "source_file".to_string(),
            string_value(&chunk.source_file),
        );
        payload.insert(
            "chunk_index".to_string(),
            int_value(chunk.chunk_index as i64),
        );
        payload.insert("start_char".to_string(), int_value(chunk.start_char as i64));
        payload.insert("end_char".to_string(), int_value(chunk.end_char as i64));
        payload.insert(
            "created_at".to_string(),
            string_value(&chunk.created_at.to_rfc3339()),
        );
        payload.insert(
            "created_at_ts".to_string(),
            Value {
                kind: Some(Kind::DoubleValue(
                    chunk.created_at.timestamp_millis() as f64 / 1000.0,
                )),
            },
        );
        payload.insert(
            "updated_at".to_string(),
            string_value(&chunk.updated_at.to_rfc3339()),
        );

        let metadata_fields: HashMap<String, Value> = chunk
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), json_to_value(v)))
            .collect();
        payload.insert(
            "metadata".to_string(),
            Value {
                kind: Some(Kind::StructValue(Struct {
                    fields: metadata_fields,
                })),
            },
        );

        PointStruct::new(chunk.id.to_string(), chunk.vector.clone(), payload)
    }

    fn payload_chunk(
        id: Uuid,
        payload: &HashMap<String, Value>,
        vector: Vec<f32>,
    ) -> StoredChunk {
        StoredChunk {
            id,
            text: payload_str(payload, "text"),
            vector,
            source_file: payload_str(payload, "source_file"),
            chunk_index: payload_int(payload, "chunk_index") as usize,
            start_char: payload_int(payload, "start_char") as usize,
            end_char: payload_int(payload, "end_char") as usize,
            metadata: payload_metadata(payload),
            created_at: payload_time(payload, "created_at"),
            updated_at: payload_time(payload, "updated_at"),
        }
    }

    fn build_filter(filters: &SearchFilters) -> Option<Filter> {
        let mut conditions: Vec<Condition> = Vec::new();

        if let Some(source) = &filters.source_file {
            conditions.push(Condition::matches("source_file", source.clone()));
        }
        if let Some(sources) = &filters.source_files {
            conditions.push(Condition::matches("source_file", sources.clone()));
        }
        if let Some(index) = filters.chunk_index {
            conditions.push(Condition::matches("chunk_index", index as i64));
        }
        if filters.chunk_index_min.is_some() || filters.chunk_index_max.is_some() {
            conditions.push(Condition::range(
                "chunk_index",
                Range {
                    gte: filters.chunk_index_min.map(|v| v as f64),
                    lte: filters.chunk_index_max.map(|v| v as f64),
                    ..Default::default()
                },
            ));
        }
        if filters.created_after.is_some() || filters.created_before.is_some() {
            conditions.push(Condition::range(
                "created_at_ts",
                Range {
                    gte: filters
                        .created_after
                        .map(|t| t.timestamp_millis() as f64 / 1000.0),
                    lte: filters
                        .created_before
                        .map(|t| t.timestamp_millis() as f64 / 1000.0),
                    ..Default::default()
                },
            ));
        }
        for (key, value) in &filters.metadata {
            let field = format!("metadata.{key}");
            match value {
                serde_json::Value::String(s) => {
                    conditions.push(Condition::matches(field, s.clone()));
                }
                serde_json::Value::Bool(b) => {
                    conditions.push(Condition::matches(field, *b));
                }
                serde_json::Value::Number(n) if n.is_i64() => {
                    conditions.push(Condition::matches(field, n.as_i64().unwrap_or_default()));
                }
                other => {
                    conditions.push(Condition::matches(field, other.to_string()));
                }
            }
        }

        if conditions.is_empty() {
            None
        } else {
            Some(Filter::must(conditions))
        }
    }

    async fn scroll_points(&self, limit: u32) -> Result<Vec<RetrievedPoint>> {
        let response = self
            .client
            .scroll(
                ScrollPointsBuilder::new(&self.collection_name)
                    .limit(limit)
                    .with_payload(true),
            )
            .await
            .map_err(|e| StoreError::SearchFailed(format!("Scroll failed: {e}")))?;
        Ok(response.result)
    }
}

#[async_trait]
impl StoreBackend for QdrantBackend {
    async fn upsert(&self, chunks: &[StoredChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = chunks.iter().map(Self::chunk_to_point).collect();
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await
            .map_err(|e| StoreError::StorageFailed(format!("Upsert failed: {e}")))?;

        debug!("Upserted {} points", chunks.len());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<StoredChunk>> {
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(
                    &self.collection_name,
                    vec![PointId::from(id.to_string())],
                )
                .with_payload(true)
                .with_vectors(true),
            )
            .await
            .map_err(|e| StoreError::SearchFailed(format!("Get failed: {e}")))?;

        Ok(response.result.first().map(|point| {
            let vector = extract_vector(point);
            Self::payload_chunk(id, &point.payload, vector)
        }))
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(PointsIdsList {
                        ids: vec![PointId::from(id.to_string())],
                    })
                    .wait(true),
            )
            .await
            .map_err(|e| StoreError::StorageFailed(format!("Delete failed: {e}")))?;
        Ok(())
    }

    async fn delete_by_source(&self, source_file: &str) -> Result<usize> {
        let filter = Filter::must([Condition::matches(
            "source_file",
            source_file.to_string(),
        )]);

        let count = self
            .client
            .count(
                CountPointsBuilder::new(&self.collection_name)
                    .filter(filter.clone())
                    .exact(true),
            )
            .await
            .map_err(|e| StoreError::SearchFailed(format!("Count failed: {e}")))?
            .result
            .map(|c| c.count as usize)
            .unwrap_or(0);

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(filter)
                    .wait(true),
            )
            .await
            .map_err(|e| StoreError::StorageFailed(format!("Filter delete failed: {e}")))?;

        info!("Deleted {} points for source '{}'", count, source_file);
        Ok(count)
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f32,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        let mut builder =
            SearchPointsBuilder::new(&self.collection_name, query.to_vec(), top_k as u64)
                .with_payload(true)
                .score_threshold(min_score);

        if let Some(filter) = Self::build_filter(filters) {
            builder = builder.filter(filter);
        }

        let response = self
            .client
            .search_points(builder)
            .await
            .map_err(|e| StoreError::SearchFailed(format!("Search failed: {e}")))?;

        let results = response
            .result
            .into_iter()
            .map(|point| {
                let id = point
                    .id
                    .as_ref()
                    .and_then(point_uuid)
                    .unwrap_or_else(Uuid::nil);
                SearchResult {
                    id,
                    text: payload_str(&point.payload, "text"),
                    score: point.score.clamp(0.0, 1.0),
                    source_file: payload_str(&point.payload, "source_file"),
                    chunk_index: payload_int(&point.payload, "chunk_index") as usize,
                    metadata: payload_metadata(&point.payload),
                }
            })
            .collect();

        Ok(results)
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DocumentSummary>> {
        let points = self.scroll_points(SCROLL_PAGE).await?;

        let mut grouped: std::collections::BTreeMap<String, DocumentSummary> = Default::default();
        for point in &points {
            let source_file = payload_str(&point.payload, "source_file");
            let created_at = payload_time(&point.payload, "created_at");
            let updated_at = payload_time(&point.payload, "updated_at");
            let entry = grouped
                .entry(source_file.clone())
                .or_insert_with(|| DocumentSummary {
                    source_file,
                    chunk_count: 0,
                    created_at,
                    updated_at,
                    metadata: payload_metadata(&point.payload),
                });
            entry.chunk_count += 1;
            entry.created_at = entry.created_at.min(created_at);
            entry.updated_at = entry.updated_at.max(updated_at);
        }

        Ok(grouped.into_values().skip(offset).take(limit).collect())
    }

    async fn stats(&self) -> Result<CollectionStats> {
        let total = self
            .client
            .count(CountPointsBuilder::new(&self.collection_name).exact(true))
            .await
            .map_err(|e| StoreError::SearchFailed(format!("Count failed: {e}")))?
            .result
            .map(|c| c.count as usize)
            .unwrap_or(0);

        let points = self.scroll_points(SCROLL_PAGE).await?;
        let mut source_files: Vec<String> = points
            .iter()
            .map(|p| payload_str(&p.payload, "source_file"))
            .filter(|s| !s.is_empty())
            .collect();
        source_files.sort();
        source_files.dedup();

        Ok(CollectionStats {
            total_points: total,
            total_vectors: total,
            approx_size_bytes: total * self.vector_size * std::mem::size_of::<f32>(),
            source_files,
            last_updated: Utc::now(),
        })
    }

    async fn clear(&self) -> Result<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(Filter::default())
                    .wait(true),
            )
            .await
            .map_err(|e| StoreError::StorageFailed(format!("Clear failed: {e}")))?;
        info!("Collection '{}' cleared", self.collection_name);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .health_check()
            .await
            .map_err(|_| StoreError::NotConnected)?;
        Ok(())
    }
}

fn string_value(s: &str) -> Value {
    Value {
        kind: Some(Kind::StringValue(s.to_string())),
    }
}

fn int_value(i: i64) -> Value {
    Value {
        kind: Some(Kind::IntegerValue(i)),
    }
}

/// Convert JSON metadata values into Qdrant payload values
fn json_to_value(json: &serde_json::Value) -> Value {
    let kind = match json {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Kind::IntegerValue(i)
            } else {
                Kind::DoubleValue(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Kind::StringValue(s.clone()),
        serde_json::Value::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(json_to_value).collect(),
        }),
        serde_json::Value::Object(fields) => Kind::StructValue(Struct {
            fields: fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        }),
    };
    Value { kind: Some(kind) }
}

/// Convert Qdrant payload values back into JSON
fn value_to_json(value: &Value) -> serde_json::Value {
    match &value.kind {
        Some(Kind::BoolValue(b)) => serde_json::json!(b),
        Some(Kind::IntegerValue(i)) => serde_json::json!(i),
        Some(Kind::DoubleValue(d)) => serde_json::json!(d),
        Some(Kind::StringValue(s)) => serde_json::json!(s),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.iter().map(value_to_json).collect())
        }
        Some(Kind::StructValue(fields)) => serde_json::Value::Object(
            fields
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
        _ => serde_json::Value::Null,
    }
}

fn payload_str(payload: &HashMap<String, Value>, key: &str) -> String {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::StringValue(s)) => s.clone(),
        _ => String::new(),
    }
}

fn payload_int(payload: &HashMap<String, Value>, key: &str) -> i64 {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::IntegerValue(i)) => *i,
        Some(Kind::DoubleValue(d)) => *d as i64,
        _ => 0,
    }
}

fn payload_time(payload: &HashMap<String, Value>, key: &str) -> DateTime<Utc> {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::StringValue(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        _ => Utc::now(),
    }
}

fn payload_metadata(payload: &HashMap<String, Value>) -> HashMap<String, serde_json::Value> {
    match payload.get("metadata").and_then(|v| v.kind.as_ref()) {
        Some(Kind::StructValue(fields)) => fields
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), value_to_json(v)))
            .collect(),
        _ => HashMap::new(),
    }
}

fn point_uuid(id: &PointId) -> Option<Uuid> {
    use qdrant_client::qdrant::point_id::PointIdOptions;
    match id.point_id_options.as_ref()? {
        PointIdOptions::Uuid(s) => Uuid::parse_str(s).ok(),
        PointIdOptions::Num(_) => None,
    }
}

fn extract_vector(point: &RetrievedPoint) -> Vec<f32> {
    use qdrant_client::qdrant::vectors_output::VectorsOptions;
    point
        .vectors
        .as_ref()
        .and_then(|v| v.vectors_options.as_ref())
        .map(|options| match options {
            VectorsOptions::Vector(vector) => vector.data.clone(),
            VectorsOptions::Vectors(_) => Vec::new(),
        })
        .unwrap_or_default()
}
