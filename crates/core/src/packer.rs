use crate::models::{Citation, DocumentId, NodeId, RerankedCandidate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

pub const DEFAULT_TOKEN_BUDGET: usize = 3_000;
const SNIPPET_CHARS: usize = 150;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PackingConfig {
    pub token_budget: usize,
}

impl Default for PackingConfig {
    fn default() -> Self {
        Self {
            token_budget: DEFAULT_TOKEN_BUDGET,
        }
    }
}

/// Roughly 1.3 tokens per whitespace-separated word, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    (words * 13).div_ceil(10)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackedPassage {
    pub node_id: NodeId,
    pub document_id: DocumentId,
    pub filename: String,
    pub page_number: u32,
    pub section_title: String,
    pub text: String,
    pub relevance: f64,
    pub token_cost: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PackedContext {
    pub citations: Vec<Citation>,
    /// Every packed node in rank order; citations group these by page.
    pub passages: Vec<PackedPassage>,
    pub total_tokens: usize,
    pub skipped_over_budget: usize,
}

/// Walks candidates in rank order and keeps each one whose cost still
/// fits the budget. A candidate that would overflow is skipped, and later
/// smaller candidates may still fit. Nodes from an already cited page fold
/// into that citation.
pub fn pack(reranked: &[RerankedCandidate], token_budget: usize) -> PackedContext {
    let mut context = PackedContext::default();
    let mut by_page: HashMap<(DocumentId, u32), usize> = HashMap::new();

    for candidate in reranked {
        let node = &candidate.fused.node;
        let cost = estimate_tokens(&node.text);
        if context.total_tokens + cost > token_budget {
            context.skipped_over_budget += 1;
            continue;
        }
        context.total_tokens += cost;

        let key = (node.document_id.clone(), node.page_number);
        match by_page.get(&key) {
            Some(&position) => {
                let citation = &mut context.citations[position];
                citation.node_count += 1;
                citation.node_ids.push(node.node_id.clone());
                citation.score = citation.score.max(candidate.relevance);
                citation.token_cost += cost;
            }
            None => {
                by_page.insert(key, context.citations.len());
                context.citations.push(Citation {
                    document_id: node.document_id.clone(),
                    filename: node.filename.clone(),
                    page_number: node.page_number,
                    node_count: 1,
                    node_ids: vec![node.node_id.clone()],
                    score: candidate.relevance,
                    high_integrity: false,
                    anchor_resolved: false,
                    section_title: node.title.clone(),
                    snippet: snippet(&node.text),
                    token_cost: cost,
                });
            }
        }

        context.passages.push(PackedPassage {
            node_id: node.node_id.clone(),
            document_id: node.document_id.clone(),
            filename: node.filename.clone(),
            page_number: node.page_number,
            section_title: node.title.clone(),
            text: node.text.clone(),
            relevance: candidate.relevance,
            token_cost: cost,
        });
    }

    debug!(
        packed = context.passages.len(),
        citations = context.citations.len(),
        tokens = context.total_tokens,
        budget = token_budget,
        skipped = context.skipped_over_budget,
        "context packed"
    );
    context
}

fn snippet(text: &str) -> String {
    if text.chars().count() <= SNIPPET_CHARS {
        text.to_string()
    } else {
        let head: String = text.chars().take(SNIPPET_CHARS).collect();
        format!("{head}...")
    }
}
