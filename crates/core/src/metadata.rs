//! Provenance metadata derived from a document's path and from an optional
//! `Metadata: {...}` block embedded near the start of its text.

use crate::config::{CategoryDefinition, CategoryTaxonomy, PipelineConfig};
use crate::error::ConfigError;
use crate::models::{keys, Metadata, MetadataValue, UNCATEGORIZED};
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

pub const DEFAULT_METADATA_MARKER: &str = r"\bMetadata\s*:";

#[derive(Debug, Clone)]
pub struct MetadataEnricher {
    taxonomy: CategoryTaxonomy,
    document_types: Vec<String>,
    marker: Regex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: String,
    pub subcategory: String,
}

impl Classification {
    fn uncategorized() -> Self {
        Self {
            category: UNCATEGORIZED.to_string(),
            subcategory: UNCATEGORIZED.to_string(),
        }
    }
}

impl MetadataEnricher {
    pub fn new(taxonomy: CategoryTaxonomy, document_types: Vec<String>) -> Result<Self, ConfigError> {
        Self::with_marker(taxonomy, document_types, DEFAULT_METADATA_MARKER)
    }

    pub fn with_marker(
        taxonomy: CategoryTaxonomy,
        document_types: Vec<String>,
        marker: &str,
    ) -> Result<Self, ConfigError> {
        let marker = Regex::new(marker).map_err(|error| ConfigError::InvalidValue {
            field: "metadata_marker",
            details: error.to_string(),
        })?;
        Ok(Self {
            taxonomy,
            document_types,
            marker,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Self::new(config.taxonomy.clone(), config.document_types.clone())
    }

    pub fn enrich(&self, source_path: &str, raw_text_head: &str) -> Metadata {
        self.enrich_at(source_path, raw_text_head, Utc::now())
    }

    /// Embedded metadata wins over path-derived values on key collisions.
    pub fn enrich_at(
        &self,
        source_path: &str,
        raw_text_head: &str,
        processed_at: DateTime<Utc>,
    ) -> Metadata {
        let classification = self.classify(source_path);

        let mut metadata = Metadata::new();
        metadata.insert(keys::SOURCE.to_string(), source_path.into());
        metadata.insert(keys::CATEGORY.to_string(), classification.category.into());
        metadata.insert(keys::SUBCATEGORY.to_string(), classification.subcategory.into());
        metadata.insert(
            keys::DOCUMENT_TYPE.to_string(),
            self.document_type(source_path).into(),
        );
        metadata.insert(
            keys::PROCESSING_DATE.to_string(),
            processed_at
                .to_rfc3339_opts(SecondsFormat::Secs, true)
                .into(),
        );

        if let Some(embedded) = self.embedded_metadata(raw_text_head) {
            metadata.extend(embedded);
        }

        metadata
    }

    /// Resolves category and subcategory from directory names. The deepest matching
    /// category folder wins; without one, a known subcategory folder implies its owner.
    pub fn classify(&self, source_path: &str) -> Classification {
        let directories = directory_components(source_path);

        let category_match = directories.iter().enumerate().rev().find_map(|(position, name)| {
            self.taxonomy
                .categories
                .iter()
                .find(|category| category.name.eq_ignore_ascii_case(name))
                .map(|category| (position, category))
        });

        if let Some((position, category)) = category_match {
            let subcategory = directories[position + 1..]
                .iter()
                .rev()
                .find_map(|name| find_subcategory(category, name))
                .unwrap_or(UNCATEGORIZED);
            return Classification {
                category: category.name.clone(),
                subcategory: subcategory.to_string(),
            };
        }

        directories
            .iter()
            .rev()
            .find_map(|name| {
                self.taxonomy.categories.iter().find_map(|category| {
                    find_subcategory(category, name).map(|subcategory| Classification {
                        category: category.name.clone(),
                        subcategory: subcategory.to_string(),
                    })
                })
            })
            .unwrap_or_else(Classification::uncategorized)
    }

    pub fn document_type(&self, source_path: &str) -> String {
        let file_name = file_name(source_path).to_lowercase();

        if let Some(known) = self
            .document_types
            .iter()
            .find(|candidate| !candidate.is_empty() && file_name.contains(&candidate.to_lowercase()))
        {
            return known.clone();
        }

        match file_name.rsplit_once('.') {
            Some((stem, extension)) if !stem.is_empty() && !extension.is_empty() => {
                extension.to_string()
            }
            _ => UNCATEGORIZED.to_string(),
        }
    }

    /// Parses the JSON object that follows the marker. Anything unparseable is
    /// treated as absent.
    pub fn embedded_metadata(&self, raw_text_head: &str) -> Option<Metadata> {
        let marker = self.marker.find(raw_text_head)?;
        let rest = &raw_text_head[marker.end()..];

        let parsed = serde_json::Deserializer::from_str(rest)
            .into_iter::<Map<String, Value>>()
            .next();

        match parsed {
            Some(Ok(object)) => Some(
                object
                    .iter()
                    .filter_map(|(key, value)| {
                        MetadataValue::from_json(value).map(|value| (key.clone(), value))
                    })
                    .collect(),
            ),
            Some(Err(error)) => {
                debug!(%error, "ignoring malformed embedded metadata block");
                None
            }
            None => None,
        }
    }
}

fn find_subcategory<'a>(category: &'a CategoryDefinition, folder: &str) -> Option<&'a str> {
    category
        .subcategories
        .iter()
        .find(|subcategory| subcategory.eq_ignore_ascii_case(folder))
        .map(String::as_str)
}

fn path_components(source_path: &str) -> Vec<&str> {
    source_path
        .split(['/', '\\'])
        .filter(|component| !component.is_empty())
        .collect()
}

fn directory_components(source_path: &str) -> Vec<&str> {
    let mut components = path_components(source_path);
    components.pop();
    components
}

fn file_name(source_path: &str) -> &str {
    path_components(source_path).pop().unwrap_or_default()
}

/// First `max_chars` characters of `text`.
pub fn text_head(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((offset, _)) => &text[..offset],
        None => text,
    }
}
