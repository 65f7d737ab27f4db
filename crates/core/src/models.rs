use crate::integrity::CitationAudit;
use crate::telemetry::QueryTelemetry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use uuid::Uuid;

pub type DocumentId = String;
pub type NodeId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Queued,
    Processing,
    Indexed,
    Failed,
}

/// A page of an ingested document. `nodes` is the contiguous slice of the
/// document's node list that belongs to this page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page {
    pub number: u32,
    pub nodes: Range<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub filename: String,
    pub checksum: String,
    pub pages: Vec<Page>,
    pub ingested_at: DateTime<Utc>,
    pub status: DocumentStatus,
}

impl Document {
    pub fn page(&self, number: u32) -> Option<&Page> {
        self.pages.iter().find(|page| page.number == number)
    }

    pub fn node_count(&self) -> usize {
        self.pages.iter().map(|page| page.nodes.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub document_id: DocumentId,
    pub filename: String,
    pub page_number: u32,
    pub section_index: u32,
    pub title: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub term_frequencies: BTreeMap<String, u32>,
    pub term_count: u32,
}

/// Where a node lives: used to verify citations against live pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageAnchor {
    pub document_id: DocumentId,
    pub filename: String,
    pub page_number: u32,
}

#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: Arc<Node>,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
    Dense,
    Sparse,
}

impl RetrievalMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            RetrievalMethod::Dense => "dense",
            RetrievalMethod::Sparse => "sparse",
        }
    }
}

impl fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: Arc<Node>,
    pub method: RetrievalMethod,
    pub raw_score: f64,
    /// 1-based position in the source list.
    pub rank: usize,
}

#[derive(Debug, Clone)]
pub struct FusedCandidate {
    pub node: Arc<Node>,
    pub fused_score: f64,
    pub methods: Vec<RetrievalMethod>,
    pub dense_score: Option<f64>,
    pub sparse_score: Option<f64>,
}

impl FusedCandidate {
    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }
}

#[derive(Debug, Clone)]
pub struct RerankedCandidate {
    pub fused: FusedCandidate,
    /// Relevance in [0, 1].
    pub relevance: f64,
    pub rank: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub document_id: DocumentId,
    pub filename: String,
    pub page_number: u32,
    pub node_count: usize,
    pub node_ids: Vec<NodeId>,
    pub score: f64,
    pub high_integrity: bool,
    pub anchor_resolved: bool,
    pub section_title: String,
    pub snippet: String,
    pub token_cost: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntegrityStatus {
    Verified,
    Warning,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Retrieving,
    Fusing,
    Reranking,
    Packing,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 4] = [
        PipelineStage::Retrieving,
        PipelineStage::Fusing,
        PipelineStage::Reranking,
        PipelineStage::Packing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Retrieving => "retrieving",
            PipelineStage::Fusing => "fusing",
            PipelineStage::Reranking => "reranking",
            PipelineStage::Packing => "packing",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-query knobs exposed on the query surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryOptions {
    /// Candidate fan-out per retrieval source.
    pub k: usize,
    pub token_budget: usize,
    pub strict_integrity: bool,
    pub rerank_threshold: f64,
    pub dense_weight: f64,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            k: 20,
            token_budget: 3_000,
            strict_integrity: false,
            rerank_threshold: 0.65,
            dense_weight: 0.85,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query_id: Uuid,
    pub query: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub integrity_score: f64,
    pub integrity_status: IntegrityStatus,
    pub citation_audit: CitationAudit,
    pub context_tokens: usize,
    pub telemetry: QueryTelemetry,
}

/// A file handed to the ingestion surface.
#[derive(Debug, Clone)]
pub struct RawFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl RawFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }

    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }
}
