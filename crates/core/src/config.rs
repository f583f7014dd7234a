//! Pipeline configuration.
//!
//! Every component takes its settings through [`PipelineConfig`] (or a piece of it) at
//! construction time. Nothing in this crate reads the process environment; the binary
//! maps flags and environment variables onto this struct.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_batch_size: usize,
    /// Batches embedded in parallel per wave.
    pub embedding_concurrency: usize,
    /// Pause between embedding waves, in milliseconds.
    pub inter_batch_delay_ms: u64,
    pub upsert_batch_size: usize,
    /// How many leading characters the enricher scans for an embedded metadata block.
    pub metadata_scan_chars: usize,
    pub retry: RetryPolicy,
    pub taxonomy: CategoryTaxonomy,
    pub document_types: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_overlap: 200,
            embedding_batch_size: 100,
            embedding_concurrency: 1,
            inter_batch_delay_ms: 1_000,
            upsert_batch_size: 100,
            metadata_scan_chars: 2_000,
            retry: RetryPolicy::default(),
            taxonomy: CategoryTaxonomy::default(),
            document_types: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_overlap >= self.chunk_size {
            return Err(ConfigError::InvalidChunking {
                chunk_size: self.chunk_size,
                chunk_overlap: self.chunk_overlap,
            });
        }
        require_positive("embedding_batch_size", self.embedding_batch_size)?;
        require_positive("embedding_concurrency", self.embedding_concurrency)?;
        require_positive("upsert_batch_size", self.upsert_batch_size)?;
        self.retry.validate()?;
        self.taxonomy.validate()?;
        Ok(())
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }
}

fn require_positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            details: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Bounded exponential backoff for embedding batches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts",
                details: "must allow at least one attempt".to_string(),
            });
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.initial_backoff_ms",
                details: format!(
                    "{} exceeds retry.max_backoff_ms {}",
                    self.initial_backoff_ms, self.max_backoff_ms
                ),
            });
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based count of failures so far).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1).min(16));
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryDefinition {
    pub name: String,
    #[serde(default)]
    pub subcategories: Vec<String>,
}

impl CategoryDefinition {
    pub fn new(name: &str, subcategories: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            subcategories: subcategories.iter().map(|item| item.to_string()).collect(),
        }
    }
}

/// Closed folder-name vocabulary used to categorize documents by path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct CategoryTaxonomy {
    pub categories: Vec<CategoryDefinition>,
}

impl Default for CategoryTaxonomy {
    fn default() -> Self {
        Self {
            categories: vec![
                CategoryDefinition::new("design_documents", &["architectural_drawings"]),
                CategoryDefinition::new("project_management", &["project_schedules"]),
                CategoryDefinition::new("regulatory_compliance", &["building_codes"]),
                CategoryDefinition::new("hsa_regulations", &[]),
                CategoryDefinition::new("medical_guidelines", &[]),
            ],
        }
    }
}

impl CategoryTaxonomy {
    pub fn new(categories: Vec<CategoryDefinition>) -> Self {
        Self { categories }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for category in &self.categories {
            if category.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "taxonomy",
                    details: "category names must not be empty".to_string(),
                });
            }
            if category.subcategories.iter().any(|name| name.trim().is_empty()) {
                return Err(ConfigError::InvalidValue {
                    field: "taxonomy",
                    details: format!("category {} has an empty subcategory", category.name),
                });
            }
        }
        Ok(())
    }
}
