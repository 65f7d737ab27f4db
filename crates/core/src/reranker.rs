use crate::lexical;
use crate::models::{FusedCandidate, RerankedCandidate};
use crate::RerankError;
use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Scores (query, passage) pairs jointly. Scores need not be calibrated;
/// the reranker clamps them into [0, 1].
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError>;
}

#[async_trait]
impl<T: RelevanceScorer + ?Sized> RelevanceScorer for Arc<T> {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
        (**self).score(query, passages).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RerankConfig {
    /// Candidates past this many fused positions are dropped unscored.
    pub evaluation_budget: usize,
    pub batch_size: usize,
    pub top_n: usize,
    pub timeout_ms: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            evaluation_budget: 50,
            batch_size: 16,
            top_n: 10,
            timeout_ms: 3_000,
        }
    }
}

impl RerankConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

pub struct CrossEncoderReranker<R: RelevanceScorer> {
    scorer: R,
    config: RerankConfig,
}

impl<R: RelevanceScorer> CrossEncoderReranker<R> {
    pub fn new(scorer: R, config: RerankConfig) -> Self {
        Self { scorer, config }
    }

    pub fn config(&self) -> &RerankConfig {
        &self.config
    }

    /// Scores up to `evaluation_budget` fused candidates, keeps those at or
    /// above `threshold`, and returns the best `top_n` by relevance. Equal
    /// relevance keeps fusion order.
    pub async fn rerank(
        &self,
        query: &str,
        fused: &[FusedCandidate],
        top_n: usize,
        threshold: f64,
    ) -> Result<Vec<RerankedCandidate>, RerankError> {
        let budget = fused.len().min(self.config.evaluation_budget);
        let evaluated = &fused[..budget];
        if evaluated.is_empty() {
            return Ok(Vec::new());
        }

        let passages: Vec<String> = evaluated.iter().map(passage_text).collect();

        let batches = passages
            .chunks(self.config.batch_size.max(1))
            .map(|batch| self.score_batch(query, batch));
        let scores: Vec<f64> = try_join_all(batches).await?.into_iter().flatten().collect();

        let mut scored: Vec<(f64, &FusedCandidate)> = scores.into_iter().zip(evaluated).collect();
        scored.sort_by(|left, right| right.0.total_cmp(&left.0));

        let reranked: Vec<RerankedCandidate> = scored
            .into_iter()
            .filter(|(relevance, _)| *relevance >= threshold)
            .take(top_n)
            .enumerate()
            .map(|(position, (relevance, candidate))| RerankedCandidate {
                fused: candidate.clone(),
                relevance,
                rank: position + 1,
            })
            .collect();

        debug!(
            evaluated = budget,
            dropped_over_budget = fused.len() - budget,
            kept = reranked.len(),
            top = ?reranked.first().map(|c| c.relevance),
            "rerank finished"
        );
        Ok(reranked)
    }

    async fn score_batch(&self, query: &str, batch: &[String]) -> Result<Vec<f64>, RerankError> {
        let scores = self.scorer.score(query, batch).await?;
        if scores.len() != batch.len() {
            return Err(RerankError::InvalidResponse(format!(
                "expected {} scores, got {}",
                batch.len(),
                scores.len()
            )));
        }
        Ok(scores.into_iter().map(clamp_unit).collect())
    }
}

/// Keeps fusion order when no relevance model is available. Relevance is
/// the fused score relative to the best fused score.
pub fn fusion_order(fused: &[FusedCandidate], top_n: usize) -> Vec<RerankedCandidate> {
    let best = fused
        .first()
        .map(|candidate| candidate.fused_score)
        .unwrap_or(0.0);
    fused
        .iter()
        .take(top_n)
        .enumerate()
        .map(|(position, candidate)| RerankedCandidate {
            fused: candidate.clone(),
            relevance: if best > 0.0 {
                clamp_unit(candidate.fused_score / best)
            } else {
                0.0
            },
            rank: position + 1,
        })
        .collect()
}

fn passage_text(candidate: &FusedCandidate) -> String {
    let node = &candidate.node;
    if node.title.is_empty() {
        node.text.clone()
    } else {
        format!("{}\n{}", node.title, node.text)
    }
}

fn clamp_unit(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

fn sigmoid(logit: f64) -> f64 {
    1.0 / (1.0 + (-logit).exp())
}

/// Offline scorer: 0.5 plus half the share of distinct query terms the
/// passage contains. Passages sharing no terms score 0.5.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalOverlapScorer;

#[async_trait]
impl RelevanceScorer for LexicalOverlapScorer {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
        let query_terms: BTreeSet<String> = lexical::tokenize(query).into_iter().collect();
        if query_terms.is_empty() {
            return Ok(vec![0.0; passages.len()]);
        }

        Ok(passages
            .iter()
            .map(|passage| {
                let passage_terms: BTreeSet<String> =
                    lexical::tokenize(passage).into_iter().collect();
                let matched = query_terms.intersection(&passage_terms).count();
                0.5 + 0.5 * matched as f64 / query_terms.len() as f64
            })
            .collect())
    }
}

#[derive(Debug, Serialize)]
struct CrossEncoderRequest<'a> {
    query: &'a str,
    passages: &'a [String],
}

#[derive(Debug, Deserialize)]
struct CrossEncoderResponse {
    scores: Vec<f64>,
}

/// Client for a cross-encoder scoring service that accepts
/// `{"query", "passages"}` and answers `{"scores"}`.
pub struct HttpCrossEncoder {
    client: Client,
    endpoint: Url,
    /// Set when the service returns raw logits rather than probabilities.
    logits: bool,
}

impl HttpCrossEncoder {
    pub fn new(endpoint: &str, logits: bool) -> Result<Self, RerankError> {
        Ok(Self {
            client: Client::new(),
            endpoint: Url::parse(endpoint)?,
            logits,
        })
    }
}

#[async_trait]
impl RelevanceScorer for HttpCrossEncoder {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&CrossEncoderRequest { query, passages })
            .send()
            .await
            .map_err(|error| RerankError::Unavailable(error.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RerankError::Unavailable(format!(
                "{} returned {status}",
                self.endpoint
            )));
        }
        if !status.is_success() {
            return Err(RerankError::InvalidResponse(format!(
                "{} returned {status}",
                self.endpoint
            )));
        }

        let payload: CrossEncoderResponse = response.json().await?;
        Ok(if self.logits {
            payload.scores.into_iter().map(sigmoid).collect()
        } else {
            payload.scores
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Node, RetrievalMethod};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fused(id: &str, text: &str, fused_score: f64) -> FusedCandidate {
        FusedCandidate {
            node: Arc::new(Node {
                node_id: id.to_string(),
                document_id: "doc".to_string(),
                filename: "doc.pdf".to_string(),
                page_number: 1,
                section_index: 0,
                title: String::new(),
                text: text.to_string(),
                embedding: Vec::new(),
                term_frequencies: BTreeMap::new(),
                term_count: 0,
            }),
            fused_score,
            methods: vec![RetrievalMethod::Dense],
            dense_score: Some(fused_score),
            sparse_score: None,
        }
    }

    /// Reads the score out of the passage text, e.g. "0.92".
    #[derive(Default)]
    struct EchoScorer {
        calls: AtomicUsize,
        scored: AtomicUsize,
    }

    #[async_trait]
    impl RelevanceScorer for EchoScorer {
        async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.scored.fetch_add(passages.len(), Ordering::SeqCst);
            Ok(passages
                .iter()
                .map(|text| text.parse::<f64>().unwrap_or(0.0))
                .collect())
        }
    }

    struct DownScorer;

    #[async_trait]
    impl RelevanceScorer for DownScorer {
        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f64>, RerankError> {
            Err(RerankError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn reorders_by_relevance_and_keeps_fusion_order_on_ties() {
        let candidates = vec![
            fused("a", "0.70", 0.05),
            fused("b", "0.90", 0.04),
            fused("c", "0.70", 0.03),
            fused("d", "1.7", 0.02),
        ];
        let reranker = CrossEncoderReranker::new(EchoScorer::default(), RerankConfig::default());

        let reranked = reranker.rerank("q", &candidates, 10, 0.0).await.expect("rerank");
        let order: Vec<&str> = reranked.iter().map(|c| c.fused.node_id()).collect();

        assert_eq!(order, vec!["d", "b", "a", "c"]);
        assert_eq!(reranked[0].relevance, 1.0);
        assert_eq!(reranked[3].rank, 4);
    }

    #[tokio::test]
    async fn candidates_past_the_budget_are_dropped_not_scored() {
        let candidates: Vec<FusedCandidate> = (0..60)
            .map(|i| fused(&format!("n{i:02}"), "0.80", 1.0 / (61.0 + i as f64)))
            .collect();
        let scorer = Arc::new(EchoScorer::default());
        let reranker = CrossEncoderReranker::new(Arc::clone(&scorer), RerankConfig::default());

        let reranked = reranker.rerank("q", &candidates, 100, 0.0).await.expect("rerank");

        assert_eq!(reranked.len(), 50);
        assert_eq!(scorer.scored.load(Ordering::SeqCst), 50);
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 4);
        assert!(reranked.iter().all(|c| c.fused.node_id() < "n50"));
    }

    #[tokio::test]
    async fn threshold_and_top_n_trim_the_result() {
        let candidates = vec![
            fused("a", "0.95", 0.05),
            fused("b", "0.60", 0.04),
            fused("c", "0.88", 0.03),
            fused("d", "0.92", 0.02),
        ];
        let reranker = CrossEncoderReranker::new(EchoScorer::default(), RerankConfig::default());

        let reranked = reranker.rerank("q", &candidates, 2, 0.65).await.expect("rerank");
        let order: Vec<&str> = reranked.iter().map(|c| c.fused.node_id()).collect();
        assert_eq!(order, vec!["a", "d"]);
    }

    #[tokio::test]
    async fn unreachable_backend_surfaces_unavailable() {
        let reranker = CrossEncoderReranker::new(DownScorer, RerankConfig::default());
        let result = reranker.rerank("q", &[fused("a", "x", 0.1)], 5, 0.0).await;
        assert!(matches!(result, Err(RerankError::Unavailable(_))));
    }

    #[test]
    fn fusion_order_fallback_normalizes_against_the_leader() {
        let candidates = vec![fused("a", "", 0.04), fused("b", "", 0.02), fused("c", "", 0.01)];
        let fallback = fusion_order(&candidates, 2);

        assert_eq!(fallback.len(), 2);
        assert_eq!(fallback[0].relevance, 1.0);
        assert!((fallback[1].relevance - 0.5).abs() < 1e-12);
        assert_eq!(fallback[1].fused.node_id(), "b");
    }

    #[tokio::test]
    async fn lexical_scorer_rewards_query_coverage() {
        let passages = vec![
            "The pump seal must be replaced.".to_string(),
            "Replace the seal.".to_string(),
            "Invoices are due monthly.".to_string(),
        ];
        let scores = LexicalOverlapScorer
            .score("pump seal", &passages)
            .await
            .expect("lexical scoring");

        assert_eq!(scores, vec![1.0, 0.75, 0.5]);
        let empty = LexicalOverlapScorer.score("the of", &passages).await.expect("scores");
        assert_eq!(empty, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn http_scorer_rejects_bad_endpoints() {
        assert!(matches!(
            HttpCrossEncoder::new("not a url", false),
            Err(RerankError::Endpoint(_))
        ));
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
    }
}
