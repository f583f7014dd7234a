//! In-memory vector index used by tests and offline runs.

use crate::error::IndexError;
use crate::models::{keys, FailedUpsert, IndexMatch, IndexRecord, MetadataFilter, UpsertReport};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

/// Brute-force cosine index over a `BTreeMap`, so ties resolve by ascending id.
pub struct InMemoryIndex {
    dimensions: usize,
    records: RwLock<BTreeMap<String, IndexRecord>>,
    server_side_filter: bool,
}

impl InMemoryIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            records: RwLock::new(BTreeMap::new()),
            server_side_filter: true,
        }
    }

    /// Behaves like a backend that cannot filter: the filter passed to `query` is ignored.
    pub fn without_server_side_filter(mut self) -> Self {
        self.server_side_filter = false;
        self
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub async fn get(&self, id: &str) -> Option<IndexRecord> {
        self.records.read().await.get(id).cloned()
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        f64::from(dot / (norm_a * norm_b))
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn name(&self) -> &str {
        "memory"
    }

    fn supports_server_side_filter(&self) -> bool {
        self.server_side_filter
    }

    async fn upsert(&self, records: &[IndexRecord]) -> Result<UpsertReport, IndexError> {
        let mut store = self.records.write().await;
        let mut report = UpsertReport::default();

        for record in records {
            if record.vector.len() != self.dimensions {
                report.failed.push(FailedUpsert {
                    id: record.id.clone(),
                    reason: IndexError::DimensionMismatch {
                        expected: self.dimensions,
                        actual: record.vector.len(),
                    }
                    .to_string(),
                });
                continue;
            }
            store.insert(record.id.clone(), record.clone());
            report.upserted.push(record.id.clone());
        }

        debug!(
            upserted = report.upserted.len(),
            rejected = report.failed.len(),
            "memory index upsert"
        );
        Ok(report)
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexMatch>, IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }

        let store = self.records.read().await;
        let filter = filter.filter(|_| self.server_side_filter);

        let mut scored: Vec<(f64, &IndexRecord)> = store
            .values()
            .filter(|record| filter.map_or(true, |filter| filter.matches(&record.metadata)))
            .map(|record| (Self::cosine_similarity(vector, &record.vector), record))
            .collect();

        // Stable sort keeps BTreeMap (id) order among equal scores.
        scored.sort_by(|left, right| right.0.total_cmp(&left.0));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, record)| IndexMatch {
                id: record.id.clone(),
                score,
                metadata: record.metadata.clone(),
            })
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), IndexError> {
        let mut store = self.records.write().await;
        for id in ids {
            store.remove(id);
        }
        Ok(())
    }

    async fn delete_source(&self, source: &str) -> Result<(), IndexError> {
        self.delete_source_except(source, &[]).await
    }

    async fn delete_source_except(&self, source: &str, keep: &[String]) -> Result<(), IndexError> {
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let mut store = self.records.write().await;
        let before = store.len();
        store.retain(|id, record| {
            keep.contains(id.as_str())
                || record
                    .metadata
                    .get(keys::SOURCE)
                    .map_or(true, |value| !value.matches_filter_text(source))
        });
        debug!(source, deleted = before - store.len(), "memory index source purge");
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), IndexError> {
        self.records.write().await.clear();
        Ok(())
    }

    async fn count(&self) -> Result<u64, IndexError> {
        Ok(self.records.read().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Metadata, MetadataValue};

    fn record(id: &str, vector: Vec<f32>, category: &str) -> IndexRecord {
        let mut metadata = Metadata::new();
        metadata.insert(keys::CATEGORY.to_string(), MetadataValue::from(category));
        metadata.insert(keys::SOURCE.to_string(), MetadataValue::from(format!("/data/{id}.pdf")));
        IndexRecord {
            id: id.to_string(),
            vector,
            metadata,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() -> Result<(), IndexError> {
        let index = InMemoryIndex::new(2);
        index.upsert(&[record("a", vec![1.0, 0.0], "first")]).await?;
        index.upsert(&[record("a", vec![0.0, 1.0], "second")]).await?;

        assert_eq!(index.count().await?, 1);
        let stored = index.get("a").await.expect("record a is stored");
        assert_eq!(stored.metadata[keys::CATEGORY], MetadataValue::from("second"));
        Ok(())
    }

    #[tokio::test]
    async fn wrong_dimension_is_reported_not_dropped() -> Result<(), IndexError> {
        let index = InMemoryIndex::new(2);
        let report = index
            .upsert(&[record("ok", vec![1.0, 0.0], "x"), record("bad", vec![1.0], "x")])
            .await?;

        assert_eq!(report.upserted, vec!["ok".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, "bad");
        assert_eq!(index.count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn query_orders_by_score_then_id() -> Result<(), IndexError> {
        let index = InMemoryIndex::new(2);
        index
            .upsert(&[
                record("c", vec![1.0, 0.0], "x"),
                record("b", vec![1.0, 0.0], "x"),
                record("a", vec![0.0, 1.0], "x"),
            ])
            .await?;

        for _ in 0..3 {
            let matches = index.query(&[1.0, 0.0], 3, None).await?;
            let ids: Vec<_> = matches.iter().map(|hit| hit.id.as_str()).collect();
            assert_eq!(ids, vec!["b", "c", "a"]);
            assert!(matches[0].score >= matches[2].score);
        }
        Ok(())
    }

    #[tokio::test]
    async fn filter_excludes_missing_keys() -> Result<(), IndexError> {
        let index = InMemoryIndex::new(2);
        index
            .upsert(&[record("a", vec![1.0, 0.0], "x"), record("b", vec![1.0, 0.0], "y")])
            .await?;

        let filter = MetadataFilter::new().with(keys::CATEGORY, "x");
        let matches = index.query(&[1.0, 0.0], 10, Some(&filter)).await?;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "a");

        let filter = MetadataFilter::new().with("version", "1");
        assert!(index.query(&[1.0, 0.0], 10, Some(&filter)).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn filterless_backend_ignores_filter() -> Result<(), IndexError> {
        let index = InMemoryIndex::new(2).without_server_side_filter();
        index
            .upsert(&[record("a", vec![1.0, 0.0], "x"), record("b", vec![1.0, 0.0], "y")])
            .await?;

        let filter = MetadataFilter::new().with(keys::CATEGORY, "x");
        assert_eq!(index.query(&[1.0, 0.0], 10, Some(&filter)).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn deletes_by_id_source_and_all() -> Result<(), IndexError> {
        let index = InMemoryIndex::new(2);
        index
            .upsert(&[
                record("a", vec![1.0, 0.0], "x"),
                record("b", vec![1.0, 0.0], "x"),
                record("c", vec![1.0, 0.0], "x"),
            ])
            .await?;

        index.delete(&["a".to_string()]).await?;
        assert_eq!(index.count().await?, 2);

        index.delete_source("/data/b.pdf").await?;
        assert_eq!(index.count().await?, 1);
        assert!(index.get("c").await.is_some());

        index.delete_all().await?;
        assert_eq!(index.count().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn source_purge_keeps_listed_ids() -> Result<(), IndexError> {
        let index = InMemoryIndex::new(2);
        index
            .upsert(&[
                record("a", vec![1.0, 0.0], "x"),
                record("b", vec![1.0, 0.0], "x"),
                record("c", vec![1.0, 0.0], "x"),
            ])
            .await?;

        index.delete_source_except("/data/b.pdf", &["b".to_string()]).await?;
        assert_eq!(index.count().await?, 3);

        index.delete_source_except("/data/b.pdf", &["c".to_string()]).await?;
        assert!(index.get("b").await.is_none());
        assert_eq!(index.count().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn query_rejects_wrong_dimension() {
        let index = InMemoryIndex::new(3);
        assert!(matches!(
            index.query(&[1.0], 1, None).await,
            Err(IndexError::DimensionMismatch {
                expected: 3,
                actual: 1
            })
        ));
    }
}
