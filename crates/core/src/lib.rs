pub mod answer;
pub mod cancellation;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod fusion;
pub mod index;
pub mod ingest;
pub mod integrity;
pub mod lexical;
pub mod models;
pub mod packer;
pub mod pipeline;
pub mod reranker;
pub mod retriever;
pub mod sectioning;
pub mod telemetry;
pub mod traits;

pub use answer::{format_context, AnswerGenerator, ExtractiveAnswerGenerator, NO_EVIDENCE_ANSWER};
pub use cancellation::CancellationToken;
pub use config::PipelineConfig;
pub use embeddings::{cosine_similarity, Embedder, HashedNgramEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{
    ConfigError, GenerationError, IngestError, PipelineError, PipelineFailure, RerankError,
    SearchError,
};
pub use extractor::{extract_page_texts, FileKind, PageText};
pub use fusion::{fuse, rrf_contribution, FusionConfig, DEFAULT_RRF_K};
pub use index::HierarchicalIndex;
pub use ingest::{
    discover_documents, ingest_folder_best_effort, read_raw_file, IngestionReport, SkippedFile,
};
pub use integrity::{audit_inline_citations, CitationAudit, IntegrityConfig, IntegrityReport, IntegrityScorer};
pub use models::{
    Candidate, Citation, Document, DocumentId, DocumentStatus, FusedCandidate, IntegrityStatus,
    Node, NodeId, Page, PageAnchor, PipelineStage, QueryOptions, QueryResult, RawFile,
    RerankedCandidate, RetrievalMethod, ScoredNode,
};
pub use packer::{estimate_tokens, pack, PackedContext, PackedPassage, PackingConfig, DEFAULT_TOKEN_BUDGET};
pub use pipeline::{CoordinatorState, PipelineCoordinator};
pub use reranker::{
    fusion_order, CrossEncoderReranker, HttpCrossEncoder, LexicalOverlapScorer, RelevanceScorer,
    RerankConfig,
};
pub use retriever::{HybridRetriever, RetrievalConfig, RetrievalOutcome};
pub use sectioning::{normalize_whitespace, Section, Sectioner, SectioningOptions};
pub use telemetry::{QueryTelemetry, StageEvent, StageStatus, StageTiming, TelemetrySender};
pub use traits::{AnchorResolver, DenseSearch, SparseSearch};
