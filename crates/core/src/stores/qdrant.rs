use crate::error::IndexError;
use crate::models::{
    keys, parse_canonical_float, FailedUpsert, IndexMatch, IndexRecord, Metadata,
    MetadataFilter, MetadataValue, UpsertReport,
};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const BACKEND: &str = "qdrant";

/// Payload field holding the caller's record id; Qdrant point ids must be UUIDs.
pub const CHUNK_ID_FIELD: &str = "chunk_id";

pub struct QdrantStore {
    endpoint: Url,
    collection: String,
    client: Client,
    api_key: Option<String>,
    vector_size: usize,
}

impl QdrantStore {
    pub fn new(
        endpoint: &str,
        collection: impl Into<String>,
        vector_size: usize,
    ) -> Result<Self, IndexError> {
        Self::with_timeout(endpoint, collection, vector_size, None)
    }

    pub fn with_timeout(
        endpoint: &str,
        collection: impl Into<String>,
        vector_size: usize,
        request_timeout: Option<Duration>,
    ) -> Result<Self, IndexError> {
        let collection = collection.into();
        if collection.trim().is_empty() {
            return Err(IndexError::Request("collection name must not be empty".to_string()));
        }
        if vector_size == 0 {
            return Err(IndexError::Request("vector size must be positive".to_string()));
        }

        let endpoint = if endpoint.ends_with('/') {
            Url::parse(endpoint)?
        } else {
            Url::parse(&format!("{endpoint}/"))?
        };

        let mut builder = Client::builder();
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            endpoint,
            collection,
            client: builder.build()?,
            api_key: None,
            vector_size,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        self.api_key = (!api_key.is_empty()).then_some(api_key);
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Creates the collection with cosine distance when missing; an existing collection
    /// must have the configured vector size.
    pub async fn ensure_collection(&self) -> Result<(), IndexError> {
        let response = self
            .request(Method::GET, &format!("collections/{}", self.collection))?
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => self.create_collection().await,
            status if status.is_success() => {
                let parsed: Value = response.json().await?;
                match parsed
                    .pointer("/result/config/params/vectors/size")
                    .and_then(Value::as_u64)
                {
                    Some(size) if size as usize != self.vector_size => {
                        Err(IndexError::DimensionMismatch {
                            expected: self.vector_size,
                            actual: size as usize,
                        })
                    }
                    _ => Ok(()),
                }
            }
            _ => Err(Self::backend_error(response).await),
        }
    }

    async fn create_collection(&self) -> Result<(), IndexError> {
        let response = self
            .request(Method::PUT, &format!("collections/{}", self.collection))?
            .json(&json!({
                "vectors": {
                    "size": self.vector_size,
                    "distance": "Cosine",
                }
            }))
            .send()
            .await?;
        Self::ensure_success(response).await?;
        info!(collection = %self.collection, vector_size = self.vector_size, "created qdrant collection");
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, IndexError> {
        let url = self.endpoint.join(path)?;
        let mut request = self.client.request(method, url);
        if let Some(api_key) = &self.api_key {
            request = request.header("api-key", api_key);
        }
        Ok(request)
    }

    async fn ensure_success(response: Response) -> Result<Response, IndexError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::backend_error(response).await)
        }
    }

    async fn backend_error(response: Response) -> IndexError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(%status, %body, "qdrant request failed");
        IndexError::BackendResponse {
            backend: BACKEND.to_string(),
            details: format!("{status}: {body}"),
        }
    }

    fn points_path(&self, operation: &str) -> String {
        format!("collections/{}/points{operation}", self.collection)
    }
}

/// Maps an arbitrary record id onto a stable UUID point id.
pub fn point_id(record_id: &str) -> Uuid {
    let digest = Sha256::digest(record_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Builds a Qdrant filter for an exact-match metadata predicate.
///
/// Mirrors [`MetadataValue::matches_filter_text`]: the text is always compared as a
/// string, and as an integer, bool or float only when it is that type's canonical text,
/// so `page_number=3` matches a stored 3 while `page_number=03` does not.
pub fn build_filter(filter: &MetadataFilter) -> Option<Value> {
    let must: Vec<Value> = filter
        .iter()
        .map(|(key, value)| {
            let mut should = vec![json!({ "key": key, "match": { "value": value } })];
            if let Some(integer) = value.parse::<i64>().ok().filter(|i| i.to_string() == *value) {
                should.push(json!({ "key": key, "match": { "value": integer } }));
            }
            if let Some(flag) = value.parse::<bool>().ok().filter(|b| b.to_string() == *value) {
                should.push(json!({ "key": key, "match": { "value": flag } }));
            }
            if let Some(number) = parse_canonical_float(value) {
                should.push(json!({ "key": key, "range": { "gte": number, "lte": number } }));
            }
            json!({ "should": should })
        })
        .collect();

    if must.is_empty() {
        None
    } else {
        Some(json!({ "must": must }))
    }
}

fn payload_for(record: &IndexRecord) -> Result<Value, IndexError> {
    let mut payload = match serde_json::to_value(&record.metadata)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert(CHUNK_ID_FIELD.to_string(), Value::String(record.id.clone()));
    Ok(Value::Object(payload))
}

fn match_from_hit(hit: &Value) -> IndexMatch {
    let mut metadata = Metadata::new();
    let mut chunk_id = None;

    if let Some(payload) = hit.pointer("/payload").and_then(Value::as_object) {
        for (key, value) in payload {
            if key == CHUNK_ID_FIELD {
                chunk_id = value.as_str().map(str::to_string);
            } else if let Some(value) = MetadataValue::from_json(value) {
                metadata.insert(key.clone(), value);
            }
        }
    }

    let id = chunk_id.unwrap_or_else(|| match hit.pointer("/id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    });

    IndexMatch {
        id,
        score: hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0),
        metadata,
    }
}

#[async_trait]
impl VectorIndex for QdrantStore {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn upsert(&self, records: &[IndexRecord]) -> Result<UpsertReport, IndexError> {
        let mut report = UpsertReport::default();
        let mut points = Vec::with_capacity(records.len());
        let mut ids = Vec::with_capacity(records.len());

        for record in records {
            if record.vector.len() != self.vector_size {
                report.failed.push(FailedUpsert {
                    id: record.id.clone(),
                    reason: IndexError::DimensionMismatch {
                        expected: self.vector_size,
                        actual: record.vector.len(),
                    }
                    .to_string(),
                });
                continue;
            }

            points.push(json!({
                "id": point_id(&record.id).to_string(),
                "vector": record.vector,
                "payload": payload_for(record)?,
            }));
            ids.push(record.id.clone());
        }

        if points.is_empty() {
            return Ok(report);
        }

        let response = self
            .request(Method::PUT, &self.points_path("?wait=true"))?
            .json(&json!({ "points": points }))
            .send()
            .await?;
        Self::ensure_success(response).await?;

        debug!(collection = %self.collection, points = ids.len(), "qdrant upsert");
        report.upserted = ids;
        Ok(report)
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexMatch>, IndexError> {
        if vector.len() != self.vector_size {
            return Err(IndexError::DimensionMismatch {
                expected: self.vector_size,
                actual: vector.len(),
            });
        }

        let mut body = json!({
            "vector": vector,
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(filter) = filter.and_then(build_filter) {
            body["filter"] = filter;
        }

        let response = self
            .request(Method::POST, &self.points_path("/search"))?
            .json(&body)
            .send()
            .await?;
        let parsed: Value = Self::ensure_success(response).await?.json().await?;

        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .ok_or_else(|| IndexError::BackendResponse {
                backend: BACKEND.to_string(),
                details: "search response has no result array".to_string(),
            })?;

        Ok(hits.iter().map(match_from_hit).collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), IndexError> {
        if ids.is_empty() {
            return Ok(());
        }
        let points: Vec<String> = ids.iter().map(|id| point_id(id).to_string()).collect();
        let response = self
            .request(Method::POST, &self.points_path("/delete?wait=true"))?
            .json(&json!({ "points": points }))
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn delete_source(&self, source: &str) -> Result<(), IndexError> {
        self.delete_source_except(source, &[]).await
    }

    async fn delete_source_except(&self, source: &str, keep: &[String]) -> Result<(), IndexError> {
        let mut filter = json!({
            "must": [{ "key": keys::SOURCE, "match": { "value": source } }]
        });
        if !keep.is_empty() {
            let kept: Vec<String> = keep.iter().map(|id| point_id(id).to_string()).collect();
            filter["must_not"] = json!([{ "has_id": kept }]);
        }

        let response = self
            .request(Method::POST, &self.points_path("/delete?wait=true"))?
            .json(&json!({ "filter": filter }))
            .send()
            .await?;
        Self::ensure_success(response).await?;
        info!(collection = %self.collection, source, kept = keep.len(), "purged source from qdrant");
        Ok(())
    }

    /// Drops and recreates the collection.
    async fn delete_all(&self) -> Result<(), IndexError> {
        let response = self
            .request(Method::DELETE, &format!("collections/{}", self.collection))?
            .send()
            .await?;
        if response.status() != StatusCode::NOT_FOUND {
            Self::ensure_success(response).await?;
        }
        self.create_collection().await
    }

    async fn count(&self) -> Result<u64, IndexError> {
        let response = self
            .request(Method::POST, &self.points_path("/count"))?
            .json(&json!({ "exact": true }))
            .send()
            .await?;
        let parsed: Value = Self::ensure_success(response).await?.json().await?;
        parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .ok_or_else(|| IndexError::BackendResponse {
                backend: BACKEND.to_string(),
                details: "count response has no result.count".to_string(),
            })
    }
}
