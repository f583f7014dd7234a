use crate::embeddings::EmbeddingClient;
use crate::error::SearchError;
use crate::models::{keys, IndexMatch, MetadataValue, SearchQuery, SearchResult};
use crate::traits::VectorIndex;
use tracing::{debug, info};

/// Embeds a query and turns nearest-neighbour matches into search results.
///
/// Neither the embedding call nor the index query is retried here. When the index
/// cannot filter server-side, `top_k` bounds the candidates fetched *before* the
/// filter runs, so a filtered search may return fewer than `top_k` results even
/// though more matching records exist.
pub struct RetrievalService<E, V> {
    embedder: E,
    index: V,
}

impl<E, V> RetrievalService<E, V>
where
    E: EmbeddingClient,
    V: VectorIndex,
{
    pub fn new(embedder: E, index: V) -> Self {
        Self { embedder, index }
    }

    pub fn index(&self) -> &V {
        &self.index
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, SearchError> {
        if query.text.trim().is_empty() {
            return Err(SearchError::InvalidQuery("query is empty".to_string()));
        }
        if query.top_k == 0 {
            return Err(SearchError::InvalidQuery("top_k must be at least 1".to_string()));
        }
        if let Some(min_score) = query.min_score {
            if !min_score.is_finite() {
                return Err(SearchError::InvalidQuery(format!(
                    "min_score must be finite, got {min_score}"
                )));
            }
        }

        let vector = self.embedder.embed_query(&query.text).await?;

        let server_side = self.index.supports_server_side_filter();
        let filter = query.filter.as_ref().filter(|filter| !filter.is_empty());
        let matches = self
            .index
            .query(&vector, query.top_k, filter.filter(|_| server_side))
            .await?;
        let candidates = matches.len();

        let results: Vec<SearchResult> = matches
            .into_iter()
            .filter(|hit| server_side || filter.map_or(true, |filter| filter.matches(&hit.metadata)))
            .filter(|hit| query.min_score.map_or(true, |min_score| hit.score >= min_score))
            .map(into_result)
            .collect();

        if !server_side && filter.is_some() {
            debug!(
                backend = self.index.name(),
                candidates,
                kept = results.len(),
                "applied metadata filter client-side"
            );
        }
        info!(
            backend = self.index.name(),
            top_k = query.top_k,
            results = results.len(),
            "search completed"
        );

        Ok(results)
    }
}

fn into_result(hit: IndexMatch) -> SearchResult {
    let IndexMatch {
        id,
        score,
        mut metadata,
    } = hit;

    let content = match metadata.remove(keys::CONTENT) {
        Some(MetadataValue::Text(text)) => text,
        Some(other) => other.as_filter_text(),
        None => String::new(),
    };

    SearchResult {
        id,
        content,
        metadata,
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::{EmbeddingError, IndexError};
    use crate::models::{IndexRecord, Metadata, MetadataFilter, UpsertReport};
    use crate::stores::InMemoryIndex;
    use async_trait::async_trait;

    const DIMS: usize = 64;

    async fn seeded_index(index: InMemoryIndex) -> Result<InMemoryIndex, IndexError> {
        let embedder = CharacterNgramEmbedder::new(DIMS);
        let mut records = Vec::new();

        for (position, category) in [
            "regulatory_compliance",
            "design_documents",
            "regulatory_compliance",
            "design_documents",
            "project_management",
            "design_documents",
            "project_management",
        ]
        .iter()
        .enumerate()
        {
            let content = format!("fire safety rules section {position}");
            let mut metadata = Metadata::new();
            metadata.insert(keys::CATEGORY.to_string(), MetadataValue::from(*category));
            metadata.insert(keys::CONTENT.to_string(), MetadataValue::from(content.as_str()));
            records.push(IndexRecord {
                id: format!("chunk-{position}"),
                vector: embedder.embed_text(&content),
                metadata,
            });
        }

        index.upsert(&records).await?;
        Ok(index)
    }

    fn assert_regulatory_only(results: &[SearchResult]) {
        assert!(results.len() <= 2);
        for result in results {
            assert_eq!(
                result.metadata[keys::CATEGORY],
                MetadataValue::from("regulatory_compliance")
            );
            assert!(!result.metadata.contains_key(keys::CONTENT));
            assert!(result.content.starts_with("fire safety rules"));
        }
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn filtered_search_returns_only_matching_records() -> Result<(), Box<dyn std::error::Error>> {
        let index = seeded_index(InMemoryIndex::new(DIMS)).await?;
        let service = RetrievalService::new(CharacterNgramEmbedder::new(DIMS), index);

        let query = SearchQuery::new("fire safety", 3)
            .with_filter(MetadataFilter::new().with(keys::CATEGORY, "regulatory_compliance"));
        let results = service.search(&query).await?;

        assert_eq!(results.len(), 2);
        assert_regulatory_only(&results);
        Ok(())
    }

    #[tokio::test]
    async fn client_side_filter_applies_to_fetched_candidates() -> Result<(), Box<dyn std::error::Error>> {
        let index = seeded_index(InMemoryIndex::new(DIMS).without_server_side_filter()).await?;
        let service = RetrievalService::new(CharacterNgramEmbedder::new(DIMS), index);

        let query = SearchQuery::new("fire safety", 3)
            .with_filter(MetadataFilter::new().with(keys::CATEGORY, "regulatory_compliance"));
        let results = service.search(&query).await?;

        assert_regulatory_only(&results);

        // Every candidate is fetched, so nothing matching is lost to the pre-filter limit.
        let query = SearchQuery::new("fire safety", 7)
            .with_filter(MetadataFilter::new().with(keys::CATEGORY, "regulatory_compliance"));
        assert_eq!(service.search(&query).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn min_score_drops_weak_matches() -> Result<(), Box<dyn std::error::Error>> {
        let index = seeded_index(InMemoryIndex::new(DIMS)).await?;
        let service = RetrievalService::new(CharacterNgramEmbedder::new(DIMS), index);

        let results = service
            .search(&SearchQuery::new("fire safety", 7).with_min_score(1.1))
            .await?;
        assert!(results.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn invalid_queries_are_rejected() {
        let service = RetrievalService::new(CharacterNgramEmbedder::new(DIMS), InMemoryIndex::new(DIMS));

        assert!(matches!(
            service.search(&SearchQuery::new("   ", 3)).await,
            Err(SearchError::InvalidQuery(_))
        ));
        assert!(matches!(
            service.search(&SearchQuery::new("fire", 0)).await,
            Err(SearchError::InvalidQuery(_))
        ));
    }

    struct BrokenIndex;

    #[async_trait]
    impl VectorIndex for BrokenIndex {
        fn name(&self) -> &str {
            "broken"
        }

        async fn upsert(&self, _records: &[IndexRecord]) -> Result<UpsertReport, IndexError> {
            Err(IndexError::Request("unreachable".to_string()))
        }

        async fn query(
            &self,
            _vector: &[f32],
            _top_k: usize,
            _filter: Option<&MetadataFilter>,
        ) -> Result<Vec<IndexMatch>, IndexError> {
            Err(IndexError::Request("unreachable".to_string()))
        }

        async fn delete(&self, _ids: &[String]) -> Result<(), IndexError> {
            Ok(())
        }

        async fn delete_source(&self, _source: &str) -> Result<(), IndexError> {
            Ok(())
        }

        async fn delete_source_except(
            &self,
            _source: &str,
            _keep: &[String],
        ) -> Result<(), IndexError> {
            Ok(())
        }

        async fn delete_all(&self) -> Result<(), IndexError> {
            Ok(())
        }

        async fn count(&self) -> Result<u64, IndexError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn index_failure_is_not_an_empty_result() {
        let service = RetrievalService::new(CharacterNgramEmbedder::new(DIMS), BrokenIndex);
        let result = service.search(&SearchQuery::new("fire", 3)).await;
        assert!(matches!(result, Err(SearchError::Index(IndexError::Request(_)))));
    }

    struct DownEmbedder;

    #[async_trait]
    impl EmbeddingClient for DownEmbedder {
        fn dimensions(&self) -> usize {
            DIMS
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::Request("rate limited".to_string()))
        }
    }

    #[tokio::test]
    async fn embedding_failure_aborts_search() {
        let service = RetrievalService::new(DownEmbedder, InMemoryIndex::new(DIMS));
        let result = service.search(&SearchQuery::new("fire", 3)).await;
        assert!(matches!(result, Err(SearchError::Embedding(_))));
    }
}
