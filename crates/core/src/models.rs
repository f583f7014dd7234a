use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Metadata keys every stored chunk carries.
pub mod keys {
    pub const SOURCE: &str = "source";
    pub const CATEGORY: &str = "category";
    pub const SUBCATEGORY: &str = "subcategory";
    pub const DOCUMENT_TYPE: &str = "document_type";
    pub const PAGE_NUMBER: &str = "page_number";
    pub const CHUNK_INDEX: &str = "chunk_index";
    pub const TOTAL_CHUNKS: &str = "total_chunks";
    pub const PROCESSING_DATE: &str = "processing_date";
    /// Chunk text stored next to the vector in the index.
    pub const CONTENT: &str = "content";

    pub const REQUIRED: [&str; 8] = [
        SOURCE,
        CATEGORY,
        SUBCATEGORY,
        DOCUMENT_TYPE,
        PAGE_NUMBER,
        CHUNK_INDEX,
        TOTAL_CHUNKS,
        PROCESSING_DATE,
    ];
}

pub const UNCATEGORIZED: &str = "other";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Text,
    Image,
}

impl DocumentKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "pdf" => Some(Self::Pdf),
            "txt" | "md" | "text" => Some(Self::Text),
            "png" | "jpg" | "jpeg" => Some(Self::Image),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a document's raw bytes, either on disk or already in memory.
#[derive(Debug, Clone)]
pub enum DocumentRef {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl DocumentRef {
    pub fn describe(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Bytes(bytes) => format!("<{} in-memory bytes>", bytes.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Text form of a float that always keeps a fractional part or exponent (`2.0`, `2.5`).
pub fn canonical_float_text(value: f64) -> String {
    format!("{value:?}")
}

/// Parses `text` as a finite float only if it is already in canonical form.
pub fn parse_canonical_float(text: &str) -> Option<f64> {
    let number = text.parse::<f64>().ok().filter(|number| number.is_finite())?;
    (canonical_float_text(number) == text).then_some(number)
}

impl MetadataValue {
    /// Canonical text form used for equality filtering.
    pub fn as_filter_text(&self) -> String {
        match self {
            Self::Bool(value) => value.to_string(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => canonical_float_text(*value),
            Self::Text(value) => value.clone(),
        }
    }

    /// Exact-match test against filter text.
    ///
    /// Numbers and bools match only their canonical text, and numbers also match a
    /// canonical float of equal value, so stored `3` matches `3` and `3.0` but not `03`.
    pub fn matches_filter_text(&self, expected: &str) -> bool {
        match self {
            Self::Text(value) => value == expected,
            Self::Bool(value) => value.to_string() == expected,
            Self::Integer(value) => {
                value.to_string() == expected
                    || parse_canonical_float(expected) == Some(*value as f64)
            }
            Self::Float(value) => parse_canonical_float(expected) == Some(*value),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Converts a JSON scalar; arrays, objects and null have no metadata form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(flag) => Some(Self::Bool(*flag)),
            serde_json::Value::Number(number) => number
                .as_i64()
                .map(Self::Integer)
                .or_else(|| number.as_f64().map(Self::Float)),
            serde_json::Value::String(text) => Some(Self::Text(text.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_filter_text())
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u32> for MetadataValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<usize> for MetadataValue {
    fn from(value: usize) -> Self {
        Self::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn source(&self) -> &str {
        self.metadata
            .get(keys::SOURCE)
            .and_then(MetadataValue::as_str)
            .unwrap_or_default()
    }

    pub fn chunk_index(&self) -> Option<i64> {
        self.metadata.get(keys::CHUNK_INDEX).and_then(MetadataValue::as_i64)
    }

    /// Metadata as written to the index: chunk metadata plus the chunk text.
    pub fn index_metadata(&self) -> Metadata {
        let mut metadata = self.metadata.clone();
        metadata.insert(keys::CONTENT.to_string(), MetadataValue::from(self.content.as_str()));
        metadata
    }
}

/// AND-combined exact-match predicate over metadata.
///
/// A key missing from the stored metadata never matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MetadataFilter(BTreeMap<String, String>);

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Parses a `key=value` pair, as accepted on the command line.
    pub fn parse_pair(raw: &str) -> Option<(String, String)> {
        let (key, value) = raw.split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some((key.to_string(), value.trim().to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.0.iter().all(|(key, expected)| {
            metadata
                .get(key)
                .is_some_and(|value| value.matches_filter_text(expected))
        })
    }
}

impl FromIterator<(String, String)> for MetadataFilter {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub top_k: usize,
    pub filter: Option<MetadataFilter>,
    pub min_score: Option<f64>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            top_k,
            filter: None,
            min_score: None,
        }
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = if filter.is_empty() { None } else { Some(filter) };
        self
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    pub id: String,
    pub score: f64,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertReport {
    pub upserted: Vec<String>,
    pub failed: Vec<FailedUpsert>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedUpsert {
    pub id: String,
    pub reason: String,
}

/// A batch of chunks the embedding stage gave up on after retries.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedBatch {
    pub first_index: usize,
    pub len: usize,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentIngestion {
    pub source: String,
    pub total_chunks: usize,
    pub stored_ids: Vec<String>,
    pub dropped_batches: Vec<FailedBatch>,
    pub rejected: Vec<FailedUpsert>,
}

impl DocumentIngestion {
    pub fn dropped_chunks(&self) -> usize {
        self.dropped_batches.iter().map(|batch| batch.len).sum::<usize>() + self.rejected.len()
    }
}

#[derive(Debug, Clone)]
pub struct FailedDocument {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngestionReport {
    pub documents: Vec<DocumentIngestion>,
    pub failed_documents: Vec<FailedDocument>,
}

impl IngestionReport {
    pub fn stored_chunks(&self) -> usize {
        self.documents.iter().map(|doc| doc.stored_ids.len()).sum()
    }
}
