//! Reciprocal Rank Fusion: `score = Σ 1 / (K + rank_s)` over the sources
//! that returned a node.

use crate::models::{Candidate, FusedCandidate, RetrievalMethod};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

pub const DEFAULT_RRF_K: f64 = 60.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    /// Damps the influence of low ranks.
    pub k: f64,
    /// Share of the raw dense score in the tie-break blend.
    pub dense_weight: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_RRF_K,
            dense_weight: 0.85,
        }
    }
}

pub fn rrf_contribution(k: f64, rank: usize) -> f64 {
    1.0 / (k + rank as f64)
}

/// Merges the dense and sparse lists into one ranking with at most one
/// entry per node id. Equal fused scores fall back to the blended raw
/// score, then to node id, so the order is reproducible.
pub fn fuse(dense: &[Candidate], sparse: &[Candidate], config: &FusionConfig) -> Vec<FusedCandidate> {
    let mut fused: HashMap<String, FusedCandidate> = HashMap::new();
    apply_rrf(&mut fused, dense, config.k);
    apply_rrf(&mut fused, sparse, config.k);

    let sparse_max = sparse
        .iter()
        .map(|candidate| candidate.raw_score)
        .fold(0.0f64, f64::max);
    let dense_weight = config.dense_weight.clamp(0.0, 1.0);
    let blended = |candidate: &FusedCandidate| {
        let dense = candidate.dense_score.unwrap_or(0.0);
        let sparse = match candidate.sparse_score {
            Some(score) if sparse_max > 0.0 => score / sparse_max,
            _ => 0.0,
        };
        dense_weight * dense + (1.0 - dense_weight) * sparse
    };

    let mut ranked: Vec<FusedCandidate> = fused.into_values().collect();
    ranked.sort_by(|left, right| {
        right
            .fused_score
            .total_cmp(&left.fused_score)
            .then_with(|| blended(right).total_cmp(&blended(left)))
            .then_with(|| left.node_id().cmp(right.node_id()))
    });

    debug!(
        dense = dense.len(),
        sparse = sparse.len(),
        fused = ranked.len(),
        "rrf fusion finished"
    );
    ranked
}

fn apply_rrf(target: &mut HashMap<String, FusedCandidate>, hits: &[Candidate], k: f64) {
    for hit in hits {
        let entry = target
            .entry(hit.node.node_id.clone())
            .or_insert_with(|| FusedCandidate {
                node: hit.node.clone(),
                fused_score: 0.0,
                methods: Vec::new(),
                dense_score: None,
                sparse_score: None,
            });

        // A source contributes once per node, at its best rank.
        if entry.methods.contains(&hit.method) {
            continue;
        }
        entry.methods.push(hit.method);
        entry.fused_score += rrf_contribution(k, hit.rank);
        match hit.method {
            RetrievalMethod::Dense => entry.dense_score = Some(hit.raw_score),
            RetrievalMethod::Sparse => entry.sparse_score = Some(hit.raw_score),
        }
    }
}
