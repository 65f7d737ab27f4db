use crate::embeddings::Embedder;
use crate::error::PipelineFailure;
use crate::lexical;
use crate::models::{Candidate, PipelineStage, RetrievalMethod, ScoredNode};
use crate::traits::{DenseSearch, SparseSearch};
use crate::SearchError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub timeout_ms: u64,
    /// Extra attempts after a transient failure.
    pub retries: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            retries: 1,
        }
    }
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub dense: Vec<Candidate>,
    pub sparse: Vec<Candidate>,
    pub partial_retrieval: bool,
    pub degraded_branch: Option<RetrievalMethod>,
}

pub struct HybridRetriever<D, S>
where
    D: DenseSearch,
    S: SparseSearch,
{
    dense: D,
    sparse: S,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl<D, S> HybridRetriever<D, S>
where
    D: DenseSearch,
    S: SparseSearch,
{
    pub fn new(dense: D, sparse: S, embedder: Arc<dyn Embedder>, config: RetrievalConfig) -> Self {
        Self {
            dense,
            sparse,
            embedder,
            config,
        }
    }

    /// Runs dense and sparse search concurrently. One failed branch
    /// degrades the result; two failed branches fail the stage.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<RetrievalOutcome, PipelineFailure> {
        let embedding = self.embedder.embed(query);
        let terms = lexical::tokenize(query);

        let (dense, sparse) = tokio::join!(
            with_retry(RetrievalMethod::Dense, &self.config, || self
                .dense
                .search_dense(&embedding, k)),
            with_retry(RetrievalMethod::Sparse, &self.config, || self
                .sparse
                .search_sparse(&terms, k)),
        );

        let outcome = match (dense, sparse) {
            (Ok(dense), Ok(sparse)) => RetrievalOutcome {
                dense: into_candidates(dense, RetrievalMethod::Dense, k),
                sparse: into_candidates(sparse, RetrievalMethod::Sparse, k),
                partial_retrieval: false,
                degraded_branch: None,
            },
            (Ok(dense), Err(error)) => {
                warn!(%error, "sparse retrieval failed after retry; continuing with dense only");
                RetrievalOutcome {
                    dense: into_candidates(dense, RetrievalMethod::Dense, k),
                    sparse: Vec::new(),
                    partial_retrieval: true,
                    degraded_branch: Some(RetrievalMethod::Sparse),
                }
            }
            (Err(error), Ok(sparse)) => {
                warn!(%error, "dense retrieval failed after retry; continuing with sparse only");
                RetrievalOutcome {
                    dense: Vec::new(),
                    sparse: into_candidates(sparse, RetrievalMethod::Sparse, k),
                    partial_retrieval: true,
                    degraded_branch: Some(RetrievalMethod::Dense),
                }
            }
            (Err(dense), Err(sparse)) => return Err(both_failed(dense, sparse)),
        };

        debug!(
            dense = outcome.dense.len(),
            sparse = outcome.sparse.len(),
            partial = outcome.partial_retrieval,
            "retrieval finished"
        );
        Ok(outcome)
    }
}

async fn with_retry<F, Fut>(
    method: RetrievalMethod,
    config: &RetrievalConfig,
    mut attempt: F,
) -> Result<Vec<ScoredNode>, SearchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<ScoredNode>, SearchError>>,
{
    let mut failures = 0u32;
    loop {
        let result = match tokio::time::timeout(config.timeout(), attempt()).await {
            Ok(result) => result,
            Err(_) => Err(SearchError::Timeout {
                branch: method.to_string(),
                after: config.timeout(),
            }),
        };

        match result {
            Ok(nodes) => return Ok(nodes),
            Err(error) if error.is_transient() && failures < config.retries => {
                failures += 1;
                warn!(branch = %method, attempt = failures, %error, "retrying retrieval branch");
            }
            Err(error) => return Err(error),
        }
    }
}

fn both_failed(dense: SearchError, sparse: SearchError) -> PipelineFailure {
    match (&dense, &sparse) {
        (SearchError::Timeout { after, .. }, SearchError::Timeout { .. }) => {
            PipelineFailure::PipelineTimeout {
                stage: PipelineStage::Retrieving,
                after: *after,
            }
        }
        _ => PipelineFailure::RetrievalFailed { dense, sparse },
    }
}

fn into_candidates(hits: Vec<ScoredNode>, method: RetrievalMethod, k: usize) -> Vec<Candidate> {
    hits.into_iter()
        .take(k)
        .enumerate()
        .map(|(position, hit)| Candidate {
            node: hit.node,
            method,
            raw_score: hit.score,
            rank: position + 1,
        })
        .collect()
}
