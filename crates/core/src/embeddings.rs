use crate::config::{PipelineConfig, RetryPolicy};
use crate::error::{ConfigError, EmbeddingError};
use crate::models::FailedBatch;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// One vector per input text, in input order.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        if vectors.len() != 1 {
            return Err(EmbeddingError::CountMismatch {
                requested: 1,
                returned: vectors.len(),
            });
        }
        Ok(vectors.remove(0))
    }
}

#[async_trait]
impl<T: EmbeddingClient + ?Sized> EmbeddingClient for Arc<T> {
    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        (**self).embed(texts).await
    }
}

/// Hashed character trigram embedder. Deterministic and offline.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingClient for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1/";
pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-ada-002";
pub const DEFAULT_OPENAI_DIMENSIONS: usize = 1536;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub dimensions: usize,
    /// Per-request timeout supplied by the caller; `None` leaves requests unbounded.
    pub request_timeout: Option<Duration>,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_OPENAI_MODEL.to_string(),
            dimensions: DEFAULT_OPENAI_DIMENSIONS,
            request_timeout: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddingClient {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbeddingClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, ConfigError> {
        if config.api_key.trim().is_empty() {
            return Err(ConfigError::Missing("embedding API key".to_string()));
        }
        if config.dimensions == 0 {
            return Err(ConfigError::InvalidValue {
                field: "embedding_dimensions",
                details: "must be greater than zero".to_string(),
            });
        }

        let base = if config.base_url.ends_with('/') {
            config.base_url.clone()
        } else {
            format!("{}/", config.base_url)
        };
        let endpoint = Url::parse(&base)
            .and_then(|base| base.join("embeddings"))
            .map_err(|error| ConfigError::InvalidValue {
                field: "embedding_base_url",
                details: error.to_string(),
            })?;

        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|error| ConfigError::InvalidValue {
            field: "embedding_http_client",
            details: error.to_string(),
        })?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key,
            model: config.model,
            dimensions: config.dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddingClient {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EmbeddingError::BackendResponse {
                backend: "openai".to_string(),
                details: response.status().to_string(),
            });
        }

        let mut parsed: EmbeddingResponse = response.json().await?;
        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                requested: texts.len(),
                returned: parsed.data.len(),
            });
        }

        parsed.data.sort_by_key(|datum| datum.index);
        let mut vectors = Vec::with_capacity(parsed.data.len());
        for (position, datum) in parsed.data.into_iter().enumerate() {
            if datum.index != position {
                return Err(EmbeddingError::BackendResponse {
                    backend: "openai".to_string(),
                    details: format!("missing embedding for input {position}"),
                });
            }
            if datum.embedding.len() != self.dimensions {
                return Err(EmbeddingError::BackendResponse {
                    backend: "openai".to_string(),
                    details: format!(
                        "embedding dimension {} != {}",
                        datum.embedding.len(),
                        self.dimensions
                    ),
                });
            }
            vectors.push(datum.embedding);
        }

        Ok(vectors)
    }
}

/// Output of [`BatchEmbedder::embed_all`]. `vectors[i]` is `None` when input `i` sat
/// in a batch that was dropped after exhausting its retries.
#[derive(Debug, Clone, Default)]
pub struct BatchEmbedding {
    pub vectors: Vec<Option<Vec<f32>>>,
    pub failed: Vec<FailedBatch>,
}

/// Splits inputs into provider-sized batches, embeds up to `concurrency` batches at
/// a time, pauses between waves, and retries each failed batch with exponential
/// backoff before dropping it and reporting the drop.
#[derive(Debug, Clone)]
pub struct BatchEmbedder<E> {
    client: E,
    batch_size: usize,
    concurrency: usize,
    inter_batch_delay: Duration,
    retry: RetryPolicy,
}

impl<E: EmbeddingClient> BatchEmbedder<E> {
    pub fn new(client: E, config: &PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            client,
            batch_size: config.embedding_batch_size,
            concurrency: config.embedding_concurrency,
            inter_batch_delay: config.inter_batch_delay(),
            retry: config.retry,
        })
    }

    pub fn client(&self) -> &E {
        &self.client
    }

    pub async fn embed_all(&self, texts: &[String]) -> BatchEmbedding {
        let batches: Vec<(usize, &[String])> = texts
            .chunks(self.batch_size)
            .enumerate()
            .map(|(number, batch)| (number * self.batch_size, batch))
            .collect();

        let mut output = BatchEmbedding {
            vectors: vec![None; texts.len()],
            failed: Vec::new(),
        };

        for (wave_number, wave) in batches.chunks(self.concurrency).enumerate() {
            if wave_number > 0 && !self.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.inter_batch_delay).await;
            }

            let results = join_all(
                wave.iter()
                    .map(|(first_index, batch)| self.embed_with_retry(*first_index, batch)),
            )
            .await;

            for ((first_index, _), result) in wave.iter().zip(results) {
                match result {
                    Ok(vectors) => {
                        for (offset, vector) in vectors.into_iter().enumerate() {
                            output.vectors[first_index + offset] = Some(vector);
                        }
                    }
                    Err(failed) => output.failed.push(failed),
                }
            }
        }

        output
    }

    async fn embed_with_retry(
        &self,
        first_index: usize,
        batch: &[String],
    ) -> Result<Vec<Vec<f32>>, FailedBatch> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match self.client.embed(batch).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    debug!(first_index, size = batch.len(), attempt, "embedded batch");
                    return Ok(vectors);
                }
                Ok(vectors) => EmbeddingError::CountMismatch {
                    requested: batch.len(),
                    returned: vectors.len(),
                },
                Err(error) => error,
            };

            if attempt >= self.retry.max_attempts {
                warn!(first_index, size = batch.len(), attempt, %error, "dropping embedding batch");
                return Err(FailedBatch {
                    first_index,
                    len: batch.len(),
                    attempts: attempt,
                    reason: error.to_string(),
                });
            }

            let delay = self.retry.backoff(attempt);
            warn!(first_index, attempt, ?delay, %error, "embedding batch failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
