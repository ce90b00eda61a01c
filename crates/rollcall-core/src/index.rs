//! Similarity index: one probe embedding → closest registered student.

use crate::store::EmbeddingStore;
use crate::types::{Embedding, MatchResult};
#[cfg(test)]
use crate::types::{CosineMatcher, GalleryEntry, Matcher};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Default minimum cosine similarity for a match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("similarity index unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Best registered student scoring at or above `threshold`, or a non-match.
    async fn find_closest(&self, embedding: &Embedding, threshold: f32) -> Result<MatchResult, IndexError>;
}

/// Index backed by the store's `lookup_closest_embedding` primitive.
pub struct StoreIndex<E> {
    store: Arc<E>,
}

impl<E: EmbeddingStore> StoreIndex<E> {
    pub fn new(store: Arc<E>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<E: EmbeddingStore> SimilarityIndex for StoreIndex<E> {
    async fn find_closest(&self, embedding: &Embedding, threshold: f32) -> Result<MatchResult, IndexError> {
        let hits = self
            .store
            .lookup_closest_embedding(embedding, threshold, 1)
            .await
            .map_err(|e| IndexError::Unavailable(e.to_string()))?;

        // The store is trusted for ordering but not for the threshold.
        Ok(match hits.into_iter().next() {
            Some(best) if best.score >= threshold => best.into(),
            Some(best) => MatchResult::no_match(best.score),
            None => MatchResult::no_match(0.0),
        })
    }
}

/// In-memory gallery scanned with [`CosineMatcher`]; stands in for a store in tests.
#[cfg(test)]
pub(crate) struct GalleryIndex {
    gallery: Vec<GalleryEntry>,
}

#[cfg(test)]
impl GalleryIndex {
    pub(crate) fn new(gallery: Vec<GalleryEntry>) -> Self {
        Self { gallery }
    }
}

#[cfg(test)]
#[async_trait]
impl SimilarityIndex for GalleryIndex {
    async fn find_closest(&self, embedding: &Embedding, threshold: f32) -> Result<MatchResult, IndexError> {
        Ok(CosineMatcher.compare(embedding, &self.gallery, threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use crate::types::{Candidate, StudentIdentity};

    fn student(id: &str) -> StudentIdentity {
        StudentIdentity { id: id.into(), name: id.to_uppercase() }
    }

    struct CannedStore(Result<Vec<Candidate>, StoreError>);

    #[async_trait]
    impl EmbeddingStore for CannedStore {
        async fn lookup_closest_embedding(
            &self,
            _embedding: &Embedding,
            _threshold: f32,
            limit: usize,
        ) -> Result<Vec<Candidate>, StoreError> {
            assert_eq!(limit, 1);
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_store_index_match() {
        let index = StoreIndex::new(Arc::new(CannedStore(Ok(vec![Candidate {
            student: student("s1"),
            score: 0.8,
        }]))));
        let result = index.find_closest(&Embedding::new(vec![1.0]), 0.5).await.unwrap();
        assert!(result.matched);
        assert_eq!(result.student, Some(student("s1")));
    }

    #[tokio::test]
    async fn test_store_index_empty_is_no_match() {
        let index = StoreIndex::new(Arc::new(CannedStore(Ok(vec![]))));
        let result = index.find_closest(&Embedding::new(vec![1.0]), 0.5).await.unwrap();
        assert_eq!(result, MatchResult::no_match(0.0));
    }

    #[tokio::test]
    async fn test_store_index_below_threshold_is_no_match() {
        let index = StoreIndex::new(Arc::new(CannedStore(Ok(vec![Candidate {
            student: student("s1"),
            score: 0.49,
        }]))));
        let result = index.find_closest(&Embedding::new(vec![1.0]), 0.5).await.unwrap();
        assert!(!result.matched);
        assert!(result.student.is_none());
    }

    #[tokio::test]
    async fn test_store_index_outage() {
        let index = StoreIndex::new(Arc::new(CannedStore(Err(StoreError::Unavailable("down".into())))));
        let err = index.find_closest(&Embedding::new(vec![1.0]), 0.5).await.unwrap_err();
        assert!(matches!(err, IndexError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_gallery_index_threshold_boundary() {
        // Probe at 60° from the registered face: cosine similarity 0.5.
        let index = GalleryIndex::new(vec![GalleryEntry {
            student: student("s1"),
            embedding: Embedding::new(vec![1.0, 0.0]),
        }]);
        let probe = Embedding::new(vec![0.5, 3f32.sqrt() / 2.0]);
        let eps = 1e-3;

        assert!(index.find_closest(&probe, 0.5 - eps).await.unwrap().matched);
        assert!(!index.find_closest(&probe, 0.5 + eps).await.unwrap().matched);
    }
}
