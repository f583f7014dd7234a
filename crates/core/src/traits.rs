use crate::error::IndexError;
use crate::models::{IndexMatch, IndexRecord, MetadataFilter, UpsertReport};
use async_trait::async_trait;
use std::sync::Arc;

/// Key -> (vector, metadata) store with nearest-neighbour search.
///
/// `upsert` replaces records by id and reports every id it stored or rejected.
/// `query` returns matches by descending score with a stable tie order. When
/// [`VectorIndex::supports_server_side_filter`] is false the filter argument is ignored
/// by the backend and callers must filter the returned candidates themselves.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &str;

    fn supports_server_side_filter(&self) -> bool {
        true
    }

    async fn upsert(&self, records: &[IndexRecord]) -> Result<UpsertReport, IndexError>;

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexMatch>, IndexError>;

    async fn delete(&self, ids: &[String]) -> Result<(), IndexError>;

    /// Removes every record whose `source` metadata equals `source`.
    async fn delete_source(&self, source: &str) -> Result<(), IndexError>;

    /// Removes every record of `source` whose id is not in `keep`.
    async fn delete_source_except(&self, source: &str, keep: &[String]) -> Result<(), IndexError>;

    async fn delete_all(&self) -> Result<(), IndexError>;

    async fn count(&self) -> Result<u64, IndexError>;
}

#[async_trait]
impl<T: VectorIndex + ?Sized> VectorIndex for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn supports_server_side_filter(&self) -> bool {
        (**self).supports_server_side_filter()
    }

    async fn upsert(&self, records: &[IndexRecord]) -> Result<UpsertReport, IndexError> {
        (**self).upsert(records).await
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexMatch>, IndexError> {
        (**self).query(vector, top_k, filter).await
    }

    async fn delete(&self, ids: &[String]) -> Result<(), IndexError> {
        (**self).delete(ids).await
    }

    async fn delete_source(&self, source: &str) -> Result<(), IndexError> {
        (**self).delete_source(source).await
    }

    async fn delete_source_except(&self, source: &str, keep: &[String]) -> Result<(), IndexError> {
        (**self).delete_source_except(source, keep).await
    }

    async fn delete_all(&self) -> Result<(), IndexError> {
        (**self).delete_all().await
    }

    async fn count(&self) -> Result<u64, IndexError> {
        (**self).count().await
    }
}
