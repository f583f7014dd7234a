pub mod assembly;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod metadata;
pub mod models;
pub mod retrieval;
pub mod stores;
pub mod traits;

pub use assembly::{assemble, make_chunk_id, ChunkSpan};
pub use chunking::{Chunker, ChunkingConfig, TextWindow};
pub use config::{CategoryDefinition, CategoryTaxonomy, PipelineConfig, RetryPolicy};
pub use embeddings::{
    BatchEmbedder, BatchEmbedding, CharacterNgramEmbedder, EmbeddingClient, OpenAiConfig,
    OpenAiEmbeddingClient, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{ConfigError, EmbeddingError, ExtractError, IndexError, IngestError, SearchError};
pub use extractor::{
    ExtractedDocument, ExtractorRegistry, OcrEndpointConfig, OcrEndpointExtractor, PageText,
    PdfTextExtractor, PlainTextExtractor, TextExtractor,
};
pub use ingest::{discover_documents, IngestionPipeline};
pub use metadata::{text_head, Classification, MetadataEnricher};
pub use models::{
    keys, Chunk, DocumentIngestion, DocumentKind, DocumentRef, FailedBatch, FailedDocument,
    FailedUpsert, IndexMatch, IndexRecord, IngestionReport, Metadata, MetadataFilter,
    MetadataValue, SearchQuery, SearchResult, UpsertReport, UNCATEGORIZED,
};
pub use retrieval::RetrievalService;
pub use stores::{InMemoryIndex, QdrantStore};
pub use traits::VectorIndex;
