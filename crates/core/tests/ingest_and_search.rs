use doc_retrieval_core::{
    keys, CharacterNgramEmbedder, ExtractorRegistry, InMemoryIndex, IngestionPipeline,
    MetadataFilter, MetadataValue, PipelineConfig, RetrievalService, RetryPolicy, SearchQuery,
    VectorIndex,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const DIMS: usize = 96;

fn config() -> PipelineConfig {
    PipelineConfig {
        chunk_size: 120,
        chunk_overlap: 20,
        embedding_batch_size: 4,
        inter_batch_delay_ms: 0,
        retry: RetryPolicy::no_retry(),
        ..PipelineConfig::default()
    }
}

fn write(root: &Path, relative: &str, text: &str) -> Result<(), std::io::Error> {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, text)
}

#[tokio::test]
async fn folder_ingest_then_filtered_search() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    write(
        dir.path(),
        "regulatory_compliance/building_codes/fire_code.txt",
        "Metadata: {\"version\": \"2.0\", \"jurisdiction\": \"EU\"}\n\
         Fire exits must remain unobstructed at all times. Sprinkler systems \
         are inspected every quarter and extinguishers are checked monthly.",
    )?;
    write(
        dir.path(),
        "design_documents/architectural_drawings/floor_plan.txt",
        "The ground floor plan shows the lobby, two stairwells and the loading \
         dock. Fire exits are marked on the east and west elevations.",
    )?;
    write(
        dir.path(),
        "misc/readme.md",
        "Unsorted notes about the project kickoff meeting and catering.",
    )?;
    write(dir.path(), "misc/scan.pdf", "%PDF-1.4\n%not really a pdf")?;

    let index = Arc::new(InMemoryIndex::new(DIMS));
    let pipeline = IngestionPipeline::new(
        &config(),
        ExtractorRegistry::new(),
        CharacterNgramEmbedder::new(DIMS),
        Arc::clone(&index),
    )?;

    let report = pipeline.ingest_folder(dir.path()).await?;
    assert_eq!(report.documents.len(), 3);
    assert_eq!(report.failed_documents.len(), 1);
    assert_eq!(index.count().await?, report.stored_chunks() as u64);

    let service = RetrievalService::new(CharacterNgramEmbedder::new(DIMS), Arc::clone(&index));

    let query = SearchQuery::new("fire exits", 5)
        .with_filter(MetadataFilter::new().with(keys::CATEGORY, "regulatory_compliance"));
    let results = service.search(&query).await?;

    assert!(!results.is_empty());
    for result in &results {
        assert_eq!(
            result.metadata[keys::CATEGORY],
            MetadataValue::from("regulatory_compliance")
        );
        assert_eq!(result.metadata["version"], MetadataValue::from("2.0"));
        assert!(!result.content.is_empty());
        assert!(!result.metadata.contains_key(keys::CONTENT));
    }
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }

    let uncategorized = service
        .search(
            &SearchQuery::new("kickoff meeting", 5)
                .with_filter(MetadataFilter::new().with(keys::CATEGORY, "other")),
        )
        .await?;
    assert!(!uncategorized.is_empty());
    assert!(uncategorized
        .iter()
        .all(|result| result.metadata[keys::SUBCATEGORY] == MetadataValue::from("other")));

    Ok(())
}

#[tokio::test]
async fn reingest_and_purge_keep_the_index_consistent() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    write(
        dir.path(),
        "project_management/project_schedules/phase_one.txt",
        &"Milestone review scheduled for the end of the quarter. ".repeat(12),
    )?;

    let index = Arc::new(InMemoryIndex::new(DIMS));
    let pipeline = IngestionPipeline::new(
        &config(),
        ExtractorRegistry::new(),
        CharacterNgramEmbedder::new(DIMS),
        Arc::clone(&index),
    )?;

    let first = pipeline.ingest_folder(dir.path()).await?;
    let stored = index.count().await?;
    assert!(stored > 1);

    let second = pipeline.ingest_folder(dir.path()).await?;
    assert_eq!(index.count().await?, stored);
    assert_eq!(
        first.documents[0].stored_ids,
        second.documents[0].stored_ids
    );

    pipeline.purge_source(&first.documents[0].source).await?;
    assert_eq!(index.count().await?, 0);
    Ok(())
}
