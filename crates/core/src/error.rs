use crate::models::PipelineStage;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("file type not supported: {0}")]
    UnsupportedType(String),

    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("index snapshot error: {0}")]
    Persistence(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("{branch} search timed out after {}ms", .after.as_millis())]
    Timeout { branch: String, after: Duration },

    #[error("search request failed: {0}")]
    Request(String),

    #[error("store not available yet: {0}")]
    NotReady(String),
}

impl SearchError {
    /// Transient failures are worth one retry; request errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SearchError::Timeout { .. }
                | SearchError::NotReady(_)
                | SearchError::BackendResponse { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum RerankError {
    #[error("reranker unavailable: {0}")]
    Unavailable(String),

    #[error("invalid reranker response: {0}")]
    InvalidResponse(String),

    #[error("invalid reranker endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("could not parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("answer generation failed: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum PipelineFailure {
    #[error("query is empty")]
    EmptyQuery,

    #[error("retrieval failed on both branches (dense: {dense}; sparse: {sparse})")]
    RetrievalFailed { dense: SearchError, sparse: SearchError },

    #[error("{stage} stage timed out after {}ms", .after.as_millis())]
    PipelineTimeout { stage: PipelineStage, after: Duration },

    #[error("citation integrity {score:.4} below threshold {threshold:.2}")]
    IntegrityBelowThreshold { score: f64, threshold: f64 },

    #[error("query cancelled")]
    Cancelled,

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// An aborted query: the reason plus the last stage that finished cleanly.
#[derive(Debug, Error)]
#[error("{kind} (last completed stage: {})", last_stage_label(.last_completed))]
pub struct PipelineError {
    pub kind: PipelineFailure,
    pub last_completed: Option<PipelineStage>,
}

impl PipelineError {
    pub fn new(kind: PipelineFailure, last_completed: Option<PipelineStage>) -> Self {
        Self {
            kind,
            last_completed,
        }
    }
}

fn last_stage_label(stage: &Option<PipelineStage>) -> &'static str {
    stage.map_or("none", PipelineStage::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_transient_but_request_errors_are_not() {
        let timeout = SearchError::Timeout {
            branch: "dense".to_string(),
            after: Duration::from_secs(2),
        };
        assert!(timeout.is_transient());
        assert!(!SearchError::Request("bad query".to_string()).is_transient());
    }

    #[test]
    fn pipeline_error_reports_last_completed_stage() {
        let error = PipelineError::new(
            PipelineFailure::IntegrityBelowThreshold {
                score: 0.82,
                threshold: 0.9,
            },
            Some(PipelineStage::Packing),
        );
        let rendered = error.to_string();
        assert!(rendered.contains("0.8200"));
        assert!(rendered.contains("last completed stage: packing"));

        let early = PipelineError::new(PipelineFailure::EmptyQuery, None);
        assert!(early.to_string().ends_with("(last completed stage: none)"));
    }
}
