use crate::error::IngestError;
use crate::models::{keys, Chunk, Metadata, MetadataValue};
use sha2::{Digest, Sha256};

/// A chunk's text plus the page its first character came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub content: String,
    pub page_number: u32,
}

/// Builds immutable chunks with deterministic ids.
///
/// Positional keys (`source`, `chunk_index`, `total_chunks`, `page_number`) are written
/// after the shared document metadata, so an embedded metadata block can never
/// overwrite them.
pub fn assemble(
    source: &str,
    spans: &[ChunkSpan],
    metadata: &Metadata,
) -> Result<Vec<Chunk>, IngestError> {
    if source.trim().is_empty() {
        return Err(IngestError::InvalidArgument(
            "chunk source must not be empty".to_string(),
        ));
    }

    let total = spans.len();
    let chunks = spans
        .iter()
        .enumerate()
        .map(|(index, span)| {
            let mut chunk_metadata = metadata.clone();
            chunk_metadata.remove(keys::CONTENT);
            chunk_metadata.insert(keys::SOURCE.to_string(), MetadataValue::from(source));
            chunk_metadata.insert(keys::CHUNK_INDEX.to_string(), MetadataValue::from(index));
            chunk_metadata.insert(keys::TOTAL_CHUNKS.to_string(), MetadataValue::from(total));
            chunk_metadata.insert(
                keys::PAGE_NUMBER.to_string(),
                MetadataValue::from(span.page_number),
            );

            Chunk {
                id: make_chunk_id(source, index as u64, &span.content),
                content: span.content.clone(),
                metadata: chunk_metadata,
                embedding: None,
            }
        })
        .collect();

    Ok(chunks)
}

/// Pure function of its inputs: same source, index and content always hash to the same id.
pub fn make_chunk_id(source: &str, index: u64, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((source.len() as u64).to_le_bytes());
    hasher.update(source.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
