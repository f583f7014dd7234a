use crate::assembly::assemble;
use crate::chunking::{Chunker, ChunkingConfig};
use crate::config::PipelineConfig;
use crate::embeddings::{BatchEmbedder, EmbeddingClient};
use crate::error::{ConfigError, ExtractError, IngestError};
use crate::extractor::ExtractorRegistry;
use crate::metadata::{text_head, MetadataEnricher};
use crate::models::{
    DocumentIngestion, DocumentKind, DocumentRef, FailedDocument, IndexRecord, IngestionReport,
};
use crate::traits::VectorIndex;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Recursively lists files with a recognised [`DocumentKind`], sorted by path.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for item in WalkDir::new(folder) {
        let entry = match item {
            Ok(entry) => entry,
            Err(error) => {
                warn!(
                    path = ?error.path(),
                    %error,
                    "skipping unreadable folder entry"
                );
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        if DocumentKind::from_path(entry.path()).is_some() {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Extract, chunk, enrich, embed and upsert.
///
/// Each document is processed on its own; nothing is shared between documents
/// except the configured components.
pub struct IngestionPipeline<E, V> {
    extractors: ExtractorRegistry,
    enricher: MetadataEnricher,
    chunker: Chunker,
    embedder: BatchEmbedder<E>,
    index: V,
    upsert_batch_size: usize,
    metadata_scan_chars: usize,
    replace_existing: bool,
}

impl<E, V> IngestionPipeline<E, V>
where
    E: EmbeddingClient,
    V: VectorIndex,
{
    pub fn new(
        config: &PipelineConfig,
        extractors: ExtractorRegistry,
        embedder: E,
        index: V,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            extractors,
            enricher: MetadataEnricher::from_config(config)?,
            chunker: Chunker::new(ChunkingConfig::try_from(config)?),
            embedder: BatchEmbedder::new(embedder, config)?,
            index,
            upsert_batch_size: config.upsert_batch_size,
            metadata_scan_chars: config.metadata_scan_chars,
            replace_existing: false,
        })
    }

    /// After writing a source's new chunks, delete its stored records that the new
    /// chunking no longer produces.
    ///
    /// The purge runs only once at least one new chunk was stored, so an unreadable
    /// file or an embedding outage never wipes the previous generation. Ids of chunks
    /// whose embedding batch was dropped are kept too.
    pub fn replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }

    pub fn index(&self) -> &V {
        &self.index
    }

    pub async fn ingest(
        &self,
        document: &DocumentRef,
        source_path: &str,
        kind: DocumentKind,
    ) -> Result<DocumentIngestion, IngestError> {
        if source_path.trim().is_empty() {
            return Err(IngestError::InvalidArgument(
                "source path must not be empty".to_string(),
            ));
        }

        let extracted = self
            .extractors
            .extract(document, kind)
            .await
            .map_err(|source| IngestError::Extraction {
                path: source_path.to_string(),
                source,
            })?;

        let full_text = extracted.full_text();
        let windows = self.chunker.windows(&full_text);
        let metadata = self
            .enricher
            .enrich(source_path, text_head(&full_text, self.metadata_scan_chars));
        let spans = extracted.spans(windows);
        let chunks = assemble(source_path, &spans, &metadata)?;

        let mut outcome = DocumentIngestion {
            source: source_path.to_string(),
            total_chunks: chunks.len(),
            ..DocumentIngestion::default()
        };

        if chunks.is_empty() {
            warn!(source = source_path, "document produced no chunks");
            return Ok(outcome);
        }

        let chunk_ids: Vec<String> = chunks.iter().map(|chunk| chunk.id.clone()).collect();
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        let embedded = self.embedder.embed_all(&texts).await;
        outcome.dropped_batches = embedded.failed;

        let records: Vec<IndexRecord> = chunks
            .into_iter()
            .zip(embedded.vectors)
            .filter_map(|(chunk, vector)| {
                Some(IndexRecord {
                    metadata: chunk.index_metadata(),
                    vector: vector?,
                    id: chunk.id,
                })
            })
            .collect();

        for batch in records.chunks(self.upsert_batch_size) {
            let report = self.index.upsert(batch).await?;
            for failed in &report.failed {
                warn!(source = source_path, id = %failed.id, reason = %failed.reason, "index rejected chunk");
            }
            outcome.stored_ids.extend(report.upserted);
            outcome.rejected.extend(report.failed);
        }

        if self.replace_existing {
            if outcome.stored_ids.is_empty() {
                warn!(source = source_path, "nothing stored, keeping previous chunks");
            } else {
                self.index
                    .delete_source_except(source_path, &chunk_ids)
                    .await?;
                debug!(source = source_path, "purged stale chunks");
            }
        }

        info!(
            source = source_path,
            kind = %kind,
            total_chunks = outcome.total_chunks,
            stored = outcome.stored_ids.len(),
            dropped = outcome.dropped_chunks(),
            "ingested document"
        );

        Ok(outcome)
    }

    pub async fn ingest_path(&self, path: &Path) -> Result<DocumentIngestion, IngestError> {
        let source = path.to_string_lossy().to_string();
        let kind = DocumentKind::from_path(path).ok_or_else(|| IngestError::Extraction {
            path: source.clone(),
            source: ExtractError::Unsupported(
                path.extension()
                    .map(|ext| ext.to_string_lossy().to_string())
                    .unwrap_or_else(|| "extensionless".to_string()),
            ),
        })?;

        self.ingest(&DocumentRef::Path(path.to_path_buf()), &source, kind)
            .await
    }

    /// Ingests every discovered document under `folder`.
    ///
    /// Unreadable documents are recorded in the report and skipped. Configuration and
    /// index failures stop the run.
    pub async fn ingest_folder(&self, folder: &Path) -> Result<IngestionReport, IngestError> {
        if !folder.is_dir() {
            return Err(IngestError::InvalidArgument(format!(
                "{} is not a directory",
                folder.display()
            )));
        }

        let files = discover_documents(folder);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no supported documents found in {}",
                folder.display()
            )));
        }

        let mut report = IngestionReport::default();
        for path in files {
            match self.ingest_path(&path).await {
                Ok(document) => report.documents.push(document),
                Err(error) if error.is_document_local() => {
                    warn!(path = %path.display(), %error, "skipping document");
                    report.failed_documents.push(FailedDocument {
                        path,
                        reason: error.to_string(),
                    });
                }
                Err(error) => return Err(error),
            }
        }

        info!(
            folder = %folder.display(),
            documents = report.documents.len(),
            failed = report.failed_documents.len(),
            stored_chunks = report.stored_chunks(),
            "folder ingestion finished"
        );

        Ok(report)
    }

    pub async fn purge_source(&self, source: &str) -> Result<(), IngestError> {
        self.index.delete_source(source).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::EmbeddingError;
    use crate::models::{keys, MetadataValue};
    use crate::stores::InMemoryIndex;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    const DIMS: usize = 32;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            chunk_size: 40,
            chunk_overlap: 10,
            embedding_batch_size: 2,
            inter_batch_delay_ms: 0,
            upsert_batch_size: 3,
            retry: RetryPolicy::no_retry(),
            ..PipelineConfig::default()
        }
    }

    fn pipeline(
        index: Arc<InMemoryIndex>,
    ) -> Result<IngestionPipeline<CharacterNgramEmbedder, Arc<InMemoryIndex>>, ConfigError> {
        IngestionPipeline::new(
            &test_config(),
            ExtractorRegistry::new(),
            CharacterNgramEmbedder::new(DIMS),
            index,
        )
    }

    fn long_text(words: usize) -> String {
        (0..words)
            .map(|index| format!("clause{index}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn discover_documents_is_recursive_and_sorted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let nested = dir.path().join("design_documents");
        fs::create_dir(&nested)?;

        fs::write(dir.path().join("b.txt"), "b")?;
        fs::write(nested.join("a.pdf"), b"%PDF-1.4\n%fake")?;
        fs::write(dir.path().join("notes.docx"), "ignored")?;
        fs::write(dir.path().join("scan.PNG"), "png")?;

        let files = discover_documents(dir.path());
        let names: Vec<_> = files
            .iter()
            .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
            .collect();
        assert_eq!(names, vec!["b.txt", "a.pdf", "scan.PNG"]);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn discover_documents_skips_unreadable_subfolders() -> Result<(), Box<dyn std::error::Error>> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir()?;
        let locked = dir.path().join("locked");
        fs::create_dir(&locked)?;
        fs::write(locked.join("hidden.txt"), "hidden")?;
        fs::write(dir.path().join("visible.txt"), "visible")?;
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000))?;

        let files = discover_documents(dir.path());
        let readable_anyway = fs::read_dir(&locked).is_ok();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755))?;

        assert!(files.contains(&dir.path().join("visible.txt")));
        if !readable_anyway {
            assert_eq!(files, vec![dir.path().join("visible.txt")]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn ingest_stores_every_chunk_with_metadata() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let folder = dir.path().join("regulatory_compliance").join("building_codes");
        fs::create_dir_all(&folder)?;
        let path = folder.join("fire_code.txt");
        fs::write(&path, format!("Metadata: {{\"version\": \"2.0\"}}\n{}", long_text(40)))?;

        let index = Arc::new(InMemoryIndex::new(DIMS));
        let pipeline = pipeline(Arc::clone(&index))?;
        let outcome = pipeline.ingest_path(&path).await?;

        assert!(outcome.total_chunks > 1);
        assert_eq!(outcome.stored_ids.len(), outcome.total_chunks);
        assert_eq!(outcome.dropped_chunks(), 0);
        assert_eq!(index.count().await?, outcome.total_chunks as u64);

        let stored = index
            .get(&outcome.stored_ids[0])
            .await
            .ok_or("first chunk missing")?;
        assert_eq!(
            stored.metadata[keys::CATEGORY],
            MetadataValue::from("regulatory_compliance")
        );
        assert_eq!(
            stored.metadata[keys::SUBCATEGORY],
            MetadataValue::from("building_codes")
        );
        assert_eq!(stored.metadata["version"], MetadataValue::from("2.0"));
        assert_eq!(stored.metadata[keys::CHUNK_INDEX], MetadataValue::Integer(0));
        assert!(stored.metadata.contains_key(keys::CONTENT));
        for key in keys::REQUIRED {
            assert!(stored.metadata.contains_key(key), "missing {key}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn reingesting_unchanged_document_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.txt");
        fs::write(&path, long_text(30))?;

        let index = Arc::new(InMemoryIndex::new(DIMS));
        let pipeline = pipeline(Arc::clone(&index))?;

        let first = pipeline.ingest_path(&path).await?;
        let count = index.count().await?;
        let second = pipeline.ingest_path(&path).await?;

        assert_eq!(first.stored_ids, second.stored_ids);
        assert_eq!(index.count().await?, count);
        Ok(())
    }

    #[tokio::test]
    async fn replace_drops_stale_chunks() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.txt");
        fs::write(&path, long_text(30))?;

        let index = Arc::new(InMemoryIndex::new(DIMS));
        pipeline(Arc::clone(&index))?.ingest_path(&path).await?;
        assert!(index.count().await? > 1);

        fs::write(&path, "short replacement")?;
        let outcome = pipeline(Arc::clone(&index))?
            .replace_existing(true)
            .ingest_path(&path)
            .await?;

        assert_eq!(outcome.total_chunks, 1);
        assert_eq!(index.count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn folder_run_skips_unreadable_documents() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("broken.pdf"), b"%PDF-1.4\n%broken")?;
        fs::write(dir.path().join("readable.txt"), long_text(10))?;

        let index = Arc::new(InMemoryIndex::new(DIMS));
        let report = pipeline(Arc::clone(&index))?.ingest_folder(dir.path()).await?;

        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.failed_documents.len(), 1);
        assert_eq!(
            report.failed_documents[0]
                .path
                .file_name()
                .and_then(|name| name.to_str()),
            Some("broken.pdf")
        );
        assert_eq!(index.count().await?, report.stored_chunks() as u64);
        Ok(())
    }

    #[tokio::test]
    async fn folder_run_requires_documents() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = Arc::new(InMemoryIndex::new(DIMS));
        let result = pipeline(index)?.ingest_folder(dir.path()).await;
        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
        Ok(())
    }

    #[tokio::test]
    async fn rejected_chunks_are_reported() -> Result<(), Box<dyn std::error::Error>> {
        let index = Arc::new(InMemoryIndex::new(DIMS * 2));
        let outcome = pipeline(Arc::clone(&index))?
            .ingest(
                &DocumentRef::Bytes(long_text(20).into_bytes()),
                "/data/manual.txt",
                DocumentKind::Text,
            )
            .await?;

        assert!(outcome.stored_ids.is_empty());
        assert_eq!(outcome.rejected.len(), outcome.total_chunks);
        assert_eq!(outcome.dropped_chunks(), outcome.total_chunks);
        Ok(())
    }

    struct DownEmbedder;

    #[async_trait]
    impl EmbeddingClient for DownEmbedder {
        fn dimensions(&self) -> usize {
            DIMS
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::Request("quota exceeded".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_embedding_batches_are_reported_not_stored() -> Result<(), Box<dyn std::error::Error>> {
        let index = Arc::new(InMemoryIndex::new(DIMS));
        let pipeline = IngestionPipeline::new(
            &test_config(),
            ExtractorRegistry::new(),
            DownEmbedder,
            Arc::clone(&index),
        )?;

        let outcome = pipeline
            .ingest(
                &DocumentRef::Bytes(long_text(20).into_bytes()),
                "/data/manual.txt",
                DocumentKind::Text,
            )
            .await?;

        assert!(outcome.total_chunks > 0);
        assert!(outcome.stored_ids.is_empty());
        assert_eq!(outcome.dropped_chunks(), outcome.total_chunks);
        assert_eq!(index.count().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn replace_keeps_previous_chunks_when_embedding_fails() -> Result<(), Box<dyn std::error::Error>> {
        let index = Arc::new(InMemoryIndex::new(DIMS));
        let document = DocumentRef::Bytes(long_text(60).into_bytes());
        let first = pipeline(Arc::clone(&index))?
            .ingest(&document, "/data/manual.txt", DocumentKind::Text)
            .await?;
        assert!(first.stored_ids.len() > 1);

        let outcome = IngestionPipeline::new(
            &test_config(),
            ExtractorRegistry::new(),
            DownEmbedder,
            Arc::clone(&index),
        )?
        .replace_existing(true)
        .ingest(&document, "/data/manual.txt", DocumentKind::Text)
        .await?;

        assert!(outcome.stored_ids.is_empty());
        assert_eq!(outcome.dropped_chunks(), outcome.total_chunks);
        assert_eq!(index.count().await?, first.stored_ids.len() as u64);
        for id in &first.stored_ids {
            assert!(index.get(id).await.is_some());
        }
        Ok(())
    }

    #[tokio::test]
    async fn empty_source_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let index = Arc::new(InMemoryIndex::new(DIMS));
        let result = pipeline(index)?
            .ingest(&DocumentRef::Bytes(b"text".to_vec()), " ", DocumentKind::Text)
            .await;
        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn invalid_chunking_fails_at_construction() {
        let config = PipelineConfig {
            chunk_size: 10,
            chunk_overlap: 10,
            ..test_config()
        };
        let result = IngestionPipeline::new(
            &config,
            ExtractorRegistry::new(),
            CharacterNgramEmbedder::new(DIMS),
            InMemoryIndex::new(DIMS),
        );
        assert!(matches!(result, Err(ConfigError::InvalidChunking { .. })));
    }
}
