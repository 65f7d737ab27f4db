//! Citation integrity: how well an answer's citations are grounded in live
//! index pages.

use crate::models::{Citation, IntegrityStatus};
use crate::traits::AnchorResolver;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntegrityConfig {
    /// A citation is high-integrity when its score is strictly above this.
    pub citation_threshold: f64,
    /// Aggregates below this are reported as `Warning`.
    pub aggregate_threshold: f64,
    /// Multiplier applied to a citation whose anchor does not resolve.
    pub anchor_penalty: f64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            citation_threshold: 0.9,
            aggregate_threshold: 0.9,
            anchor_penalty: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityReport {
    /// `high_integrity` per citation, in citation order.
    pub flags: Vec<bool>,
    /// Anchor resolution per citation, in citation order.
    pub anchors: Vec<bool>,
    pub aggregate: f64,
    pub status: IntegrityStatus,
    pub unresolved_anchors: usize,
}

impl IntegrityReport {
    /// Copies the per-citation flags onto the citations they were computed from.
    pub fn apply(&self, citations: &mut [Citation]) {
        for ((citation, flag), anchor) in citations.iter_mut().zip(&self.flags).zip(&self.anchors) {
            citation.high_integrity = *flag;
            citation.anchor_resolved = *anchor;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityScorer {
    config: IntegrityConfig,
}

impl IntegrityScorer {
    pub fn new(config: IntegrityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IntegrityConfig {
        &self.config
    }

    /// Node-count-weighted mean of citation scores, with unresolved
    /// citations penalized. An empty citation set scores 0.
    pub fn score(&self, citations: &[Citation], resolver: &dyn AnchorResolver) -> IntegrityReport {
        let anchors: Vec<bool> = citations
            .iter()
            .map(|citation| anchor_resolves(citation, resolver))
            .collect();
        let flags: Vec<bool> = citations
            .iter()
            .map(|citation| citation.score > self.config.citation_threshold)
            .collect();

        let mut weighted = 0.0;
        let mut weight = 0.0;
        for (citation, resolved) in citations.iter().zip(&anchors) {
            let nodes = citation.node_count.max(1) as f64;
            let penalty = if *resolved {
                1.0
            } else {
                self.config.anchor_penalty
            };
            weighted += citation.score * penalty * nodes;
            weight += nodes;
        }
        let aggregate = if weight > 0.0 {
            (weighted / weight).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let status = if aggregate < self.config.aggregate_threshold {
            IntegrityStatus::Warning
        } else {
            IntegrityStatus::Verified
        };
        let unresolved_anchors = anchors.iter().filter(|resolved| !**resolved).count();

        debug!(
            citations = citations.len(),
            aggregate,
            unresolved = unresolved_anchors,
            "integrity scored"
        );
        IntegrityReport {
            flags,
            anchors,
            aggregate,
            status,
            unresolved_anchors,
        }
    }
}

/// Every node folded into the citation must still live on the cited page.
fn anchor_resolves(citation: &Citation, resolver: &dyn AnchorResolver) -> bool {
    !citation.node_ids.is_empty()
        && citation.node_ids.iter().all(|node_id| {
            resolver.resolve(node_id).is_some_and(|anchor| {
                anchor.document_id == citation.document_id
                    && anchor.page_number == citation.page_number
            })
        })
}

/// Inline `[Document: <file>, Page <n>]` markers found in answer text,
/// split by whether they point at a cited page.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CitationAudit {
    pub verified: Vec<String>,
    pub unverified: Vec<String>,
    pub ratio: f64,
}

fn marker_pattern() -> Option<&'static Regex> {
    static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    MARKER
        .get_or_init(|| Regex::new(r"(?i)\[Document:\s*([^,\]]+),\s*Page\s*(\d+)\]").ok())
        .as_ref()
}

/// Checks inline citation markers against the packed citations. Filenames
/// compare case-insensitively. An answer without markers scores 1 when
/// nothing was cited and 0 otherwise.
pub fn audit_inline_citations(answer: &str, citations: &[Citation]) -> CitationAudit {
    let cited: HashSet<(String, u32)> = citations
        .iter()
        .map(|citation| (citation.filename.trim().to_lowercase(), citation.page_number))
        .collect();

    let mut audit = CitationAudit::default();
    if let Some(pattern) = marker_pattern() {
        for captures in pattern.captures_iter(answer) {
            let filename = captures[1].trim();
            let Ok(page) = captures[2].parse::<u32>() else {
                audit.unverified.push(captures[0].to_string());
                continue;
            };
            let marker = format!("[Document: {filename}, Page {page}]");
            if cited.contains(&(filename.to_lowercase(), page)) {
                audit.verified.push(marker);
            } else {
                audit.unverified.push(marker);
            }
        }
    }

    let total = audit.verified.len() + audit.unverified.len();
    audit.ratio = if total > 0 {
        audit.verified.len() as f64 / total as f64
    } else if citations.is_empty() {
        1.0
    } else {
        0.0
    };
    info!(
        verified = audit.verified.len(),
        unverified = audit.unverified.len(),
        ratio = audit.ratio,
        "inline citations audited"
    );
    audit
}
