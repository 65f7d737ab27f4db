use crate::models::{PageAnchor, ScoredNode};
use crate::SearchError;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait DenseSearch: Send + Sync {
    async fn search_dense(
        &self,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredNode>, SearchError>;
}

#[async_trait]
pub trait SparseSearch: Send + Sync {
    async fn search_sparse(
        &self,
        query_terms: &[String],
        k: usize,
    ) -> Result<Vec<ScoredNode>, SearchError>;
}

/// Resolves a node id back to the live page it was cut from.
pub trait AnchorResolver: Send + Sync {
    fn resolve(&self, node_id: &str) -> Option<PageAnchor>;
}

#[async_trait]
impl<T: DenseSearch + ?Sized> DenseSearch for Arc<T> {
    async fn search_dense(
        &self,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredNode>, SearchError> {
        (**self).search_dense(query_embedding, k).await
    }
}

#[async_trait]
impl<T: SparseSearch + ?Sized> SparseSearch for Arc<T> {
    async fn search_sparse(
        &self,
        query_terms: &[String],
        k: usize,
    ) -> Result<Vec<ScoredNode>, SearchError> {
        (**self).search_sparse(query_terms, k).await
    }
}

impl<T: AnchorResolver + ?Sized> AnchorResolver for Arc<T> {
    fn resolve(&self, node_id: &str) -> Option<PageAnchor> {
        (**self).resolve(node_id)
    }
}
