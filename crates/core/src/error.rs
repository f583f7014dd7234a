use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid chunking config: chunk_size={chunk_size} must be greater than chunk_overlap={chunk_overlap}")]
    InvalidChunking {
        chunk_size: usize,
        chunk_overlap: usize,
    },

    #[error("invalid config value for {field}: {details}")]
    InvalidValue { field: &'static str, details: String },

    #[error("missing required config: {0}")]
    Missing(String),

    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("no extractor registered for {0} documents")]
    Unsupported(String),

    #[error("document has no readable text: {0}")]
    NoText(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("multimodal OCR failed: {0}")]
    OcrFailed(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("embedding backend returned {returned} vectors for {requested} inputs")]
    CountMismatch { requested: usize, returned: usize },

    #[error("embedding request rejected: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("vector dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("extraction failed for {path}: {source}")]
    Extraction {
        path: String,
        #[source]
        source: ExtractError,
    },

    #[error("vector index failure: {0}")]
    Index(#[from] IndexError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl IngestError {
    /// Extraction failures only affect one document; everything else should stop a batch run.
    pub fn is_document_local(&self) -> bool {
        matches!(self, Self::Extraction { .. })
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Index(IndexError::Http(error)) => error.is_timeout(),
            Self::Extraction {
                source: ExtractError::Http(error),
                ..
            } => error.is_timeout(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("vector index query failed: {0}")]
    Index(#[from] IndexError),
}

impl SearchError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Embedding(EmbeddingError::Http(error)) | Self::Index(IndexError::Http(error)) => {
                error.is_timeout()
            }
            _ => false,
        }
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
