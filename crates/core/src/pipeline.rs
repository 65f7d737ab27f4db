//! Per-query coordinator: retrieve, fuse, rerank, pack, then score
//! citation integrity and generate the answer.

use crate::answer::{AnswerGenerator, ExtractiveAnswerGenerator};
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineFailure};
use crate::fusion::{fuse, FusionConfig};
use crate::index::HierarchicalIndex;
use crate::integrity::{audit_inline_citations, IntegrityScorer};
use crate::models::{IntegrityStatus, PipelineStage, QueryOptions, QueryResult};
use crate::packer::pack;
use crate::reranker::{fusion_order, CrossEncoderReranker, RelevanceScorer};
use crate::retriever::HybridRetriever;
use crate::telemetry::{QueryTelemetry, StageRecorder, TelemetrySender};
use crate::traits::{AnchorResolver, DenseSearch, SparseSearch};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Retrieving,
    Fusing,
    Reranking,
    Packing,
    Scoring,
    Done,
    Failed,
}

impl CoordinatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Retrieving => "retrieving",
            CoordinatorState::Fusing => "fusing",
            CoordinatorState::Reranking => "reranking",
            CoordinatorState::Packing => "packing",
            CoordinatorState::Scoring => "scoring",
            CoordinatorState::Done => "done",
            CoordinatorState::Failed => "failed",
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<PipelineStage> for CoordinatorState {
    fn from(stage: PipelineStage) -> Self {
        match stage {
            PipelineStage::Retrieving => CoordinatorState::Retrieving,
            PipelineStage::Fusing => CoordinatorState::Fusing,
            PipelineStage::Reranking => CoordinatorState::Reranking,
            PipelineStage::Packing => CoordinatorState::Packing,
        }
    }
}

/// State of one query as it moves through the coordinator.
struct QueryRun {
    query_id: Uuid,
    state: CoordinatorState,
    recorder: StageRecorder,
}

impl QueryRun {
    fn new(query_id: Uuid, telemetry: Option<TelemetrySender>) -> Self {
        Self {
            query_id,
            state: CoordinatorState::Idle,
            recorder: StageRecorder::new(query_id, telemetry),
        }
    }

    fn transition(&mut self, next: CoordinatorState) {
        debug!(query_id = %self.query_id, from = %self.state, to = %next, "coordinator transition");
        self.state = next;
    }

    fn begin(&mut self, stage: PipelineStage, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(self.fail(PipelineFailure::Cancelled));
        }
        self.transition(stage.into());
        self.recorder.start(stage);
        Ok(())
    }

    fn complete(&mut self, stage: PipelineStage) {
        self.recorder.complete(stage);
        info!(query_id = %self.query_id, stage = %stage, "stage complete");
    }

    fn fail(&mut self, kind: PipelineFailure) -> PipelineError {
        self.transition(CoordinatorState::Failed);
        let last_completed = self.recorder.last_completed();
        warn!(
            query_id = %self.query_id,
            error = %kind,
            last_completed = ?last_completed,
            "query aborted"
        );
        PipelineError::new(kind, last_completed)
    }

    /// Races `work` against cancellation; a cancelled query drops the
    /// in-flight future.
    async fn guard<T>(
        &mut self,
        cancel: &CancellationToken,
        work: impl Future<Output = T>,
    ) -> Result<T, PipelineError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(self.fail(PipelineFailure::Cancelled)),
            output = work => Ok(output),
        }
    }
}

pub struct PipelineCoordinator<D, S, R>
where
    D: DenseSearch,
    S: SparseSearch,
    R: RelevanceScorer,
{
    retriever: HybridRetriever<D, S>,
    reranker: CrossEncoderReranker<R>,
    generator: Box<dyn AnswerGenerator>,
    resolver: Arc<dyn AnchorResolver>,
    integrity: IntegrityScorer,
    config: PipelineConfig,
    telemetry: Option<TelemetrySender>,
}

impl<R: RelevanceScorer> PipelineCoordinator<Arc<HierarchicalIndex>, Arc<HierarchicalIndex>, R> {
    /// Coordinator that searches, and resolves anchors against, one shared index.
    pub fn over_index(index: Arc<HierarchicalIndex>, scorer: R, config: PipelineConfig) -> Self {
        let retriever = HybridRetriever::new(
            Arc::clone(&index),
            Arc::clone(&index),
            index.embedder(),
            config.retrieval.clone(),
        );
        let reranker = CrossEncoderReranker::new(scorer, config.rerank.clone());
        Self::new(retriever, reranker, index, config)
    }
}

impl<D, S, R> PipelineCoordinator<D, S, R>
where
    D: DenseSearch,
    S: SparseSearch,
    R: RelevanceScorer,
{
    pub fn new(
        retriever: HybridRetriever<D, S>,
        reranker: CrossEncoderReranker<R>,
        resolver: Arc<dyn AnchorResolver>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            retriever,
            reranker,
            generator: Box::new(ExtractiveAnswerGenerator::default()),
            resolver,
            integrity: IntegrityScorer::new(config.integrity.clone()),
            config,
            telemetry: None,
        }
    }

    pub fn with_generator(mut self, generator: Box<dyn AnswerGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_telemetry(mut self, sender: TelemetrySender) -> Self {
        self.telemetry = Some(sender);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn query(&self, text: &str, options: &QueryOptions) -> Result<QueryResult, PipelineError> {
        self.query_with_cancel(text, options, &CancellationToken::new())
            .await
    }

    pub async fn query_with_cancel(
        &self,
        text: &str,
        options: &QueryOptions,
        cancel: &CancellationToken,
    ) -> Result<QueryResult, PipelineError> {
        let query = text.trim();
        if query.is_empty() {
            return Err(PipelineError::new(PipelineFailure::EmptyQuery, None));
        }

        let query_id = Uuid::new_v4();
        let mut run = QueryRun::new(query_id, self.telemetry.clone());
        let mut telemetry = QueryTelemetry::default();
        info!(query_id = %query_id, query, k = options.k, "query started");

        run.begin(PipelineStage::Retrieving, cancel)?;
        let outcome = run
            .guard(cancel, self.retriever.retrieve(query, options.k))
            .await?
            .map_err(|kind| run.fail(kind))?;
        telemetry.partial_retrieval = outcome.partial_retrieval;
        telemetry.degraded_branch = outcome.degraded_branch;
        telemetry.dense_candidates = outcome.dense.len();
        telemetry.sparse_candidates = outcome.sparse.len();
        run.complete(PipelineStage::Retrieving);

        run.begin(PipelineStage::Fusing, cancel)?;
        let fusion = FusionConfig {
            dense_weight: options.dense_weight,
            ..self.config.fusion
        };
        let fused = fuse(&outcome.dense, &outcome.sparse, &fusion);
        telemetry.fused_candidates = fused.len();
        run.complete(PipelineStage::Fusing);

        run.begin(PipelineStage::Reranking, cancel)?;
        let rerank_config = self.reranker.config();
        let top_n = rerank_config.top_n;
        let timeout = rerank_config.timeout();
        let scored = run
            .guard(
                cancel,
                tokio::time::timeout(
                    timeout,
                    self.reranker
                        .rerank(query, &fused, top_n, options.rerank_threshold),
                ),
            )
            .await?;
        let reranked = match scored {
            Ok(Ok(reranked)) => {
                telemetry.reranked = true;
                reranked
            }
            Ok(Err(error)) => {
                warn!(query_id = %query_id, %error, "reranker unavailable; keeping fusion order");
                fusion_order(&fused, top_n)
            }
            Err(_) => {
                warn!(
                    query_id = %query_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "reranker timed out; keeping fusion order"
                );
                fusion_order(&fused, top_n)
            }
        };
        telemetry.reranked_candidates = reranked.len();
        run.complete(PipelineStage::Reranking);

        run.begin(PipelineStage::Packing, cancel)?;
        let mut context = pack(&reranked, options.token_budget);
        telemetry.packed_citations = context.citations.len();
        run.complete(PipelineStage::Packing);

        if cancel.is_cancelled() {
            return Err(run.fail(PipelineFailure::Cancelled));
        }
        run.transition(CoordinatorState::Scoring);
        let report = self
            .integrity
            .score(&context.citations, self.resolver.as_ref());
        report.apply(&mut context.citations);
        if options.strict_integrity && report.status == IntegrityStatus::Warning {
            return Err(run.fail(PipelineFailure::IntegrityBelowThreshold {
                score: report.aggregate,
                threshold: self.integrity.config().aggregate_threshold,
            }));
        }

        let answer = run
            .guard(cancel, self.generator.generate(query, &context))
            .await?
            .map_err(|error| run.fail(error.into()))?;
        let citation_audit = audit_inline_citations(&answer, &context.citations);

        run.transition(CoordinatorState::Done);
        telemetry.stage_timings = run.recorder.into_timings();
        info!(
            query_id = %query_id,
            citations = context.citations.len(),
            integrity = report.aggregate,
            status = ?report.status,
            reranked = telemetry.reranked,
            partial = telemetry.partial_retrieval,
            "query finished"
        );

        Ok(QueryResult {
            query_id,
            query: query.to_string(),
            answer,
            citations: context.citations,
            integrity_score: report.aggregate,
            integrity_status: report.status,
            citation_audit,
            context_tokens: context.total_tokens,
            telemetry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawFile, RetrievalMethod, ScoredNode};
    use crate::reranker::LexicalOverlapScorer;
    use crate::retriever::RetrievalConfig;
    use crate::telemetry::StageStatus;
    use crate::{RerankError, SearchError};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const PUMP_MANUAL: &str = "PUMP OVERVIEW\nThe hydraulic pump delivers 40 litres per minute.\n\
        2.1 Pressure Limits\nMaximum pressure is 200 bar. Never exceed the relief setting.\n\
        \u{000C}3 Maintenance\nReplace the pump seal every 500 operating hours.\n";

    const INVOICE_POLICY: &str = "BILLING\nInvoices are payable within thirty days of receipt.\n";

    async fn shared_index() -> Arc<HierarchicalIndex> {
        let index = HierarchicalIndex::with_defaults().expect("index builds");
        index
            .ingest(RawFile::new("pump.txt", PUMP_MANUAL))
            .await
            .expect("pump manual ingests");
        index
            .ingest(RawFile::new("billing.md", INVOICE_POLICY))
            .await
            .expect("billing policy ingests");
        Arc::new(index)
    }

    /// Scores every passage the same.
    struct FixedScorer(f64);

    #[async_trait]
    impl RelevanceScorer for FixedScorer {
        async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
            Ok(vec![self.0; passages.len()])
        }
    }

    struct UnreachableScorer;

    #[async_trait]
    impl RelevanceScorer for UnreachableScorer {
        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f64>, RerankError> {
            Err(RerankError::Unavailable("connection refused".to_string()))
        }
    }

    struct SlowScorer(Duration);

    #[async_trait]
    impl RelevanceScorer for SlowScorer {
        async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
            tokio::time::sleep(self.0).await;
            Ok(vec![1.0; passages.len()])
        }
    }

    struct BrokenBackend;

    #[async_trait]
    impl DenseSearch for BrokenBackend {
        async fn search_dense(&self, _embedding: &[f32], _k: usize) -> Result<Vec<ScoredNode>, SearchError> {
            Err(SearchError::NotReady("dense backend down".to_string()))
        }
    }

    #[async_trait]
    impl SparseSearch for BrokenBackend {
        async fn search_sparse(&self, _terms: &[String], _k: usize) -> Result<Vec<ScoredNode>, SearchError> {
            Err(SearchError::NotReady("sparse backend down".to_string()))
        }
    }

    fn fast_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.retrieval = RetrievalConfig {
            timeout_ms: 200,
            retries: 1,
        };
        config
    }

    #[tokio::test]
    async fn answers_with_verified_page_citations() {
        let index = shared_index().await;
        let coordinator = PipelineCoordinator::over_index(index, FixedScorer(0.97), fast_config());

        let result = coordinator
            .query("maximum pressure of the pump", &QueryOptions::default())
            .await
            .expect("query succeeds");

        assert!(!result.citations.is_empty());
        assert_eq!(result.integrity_status, IntegrityStatus::Verified);
        assert!((result.integrity_score - 0.97).abs() < 1e-9);
        assert!(result.citations.iter().all(|c| c.high_integrity && c.anchor_resolved));
        assert!(result.telemetry.reranked);
        assert!(!result.telemetry.partial_retrieval);
        assert_eq!(result.citation_audit.ratio, 1.0);
        assert!(result.answer.contains("[Document: pump.txt, Page"));
    }

    #[tokio::test]
    async fn lexical_reranking_surfaces_the_pressure_section_first() {
        let index = shared_index().await;
        let coordinator =
            PipelineCoordinator::over_index(index, LexicalOverlapScorer, fast_config());

        let result = coordinator
            .query("maximum pressure pump", &QueryOptions::default())
            .await
            .expect("query succeeds");

        assert_eq!(result.citations[0].filename, "pump.txt");
        assert_eq!(result.citations[0].page_number, 1);
        assert!(result.citations.iter().all(|c| c.filename != "billing.md"));
        assert_eq!(result.integrity_status, IntegrityStatus::Warning);
    }

    #[tokio::test]
    async fn repeated_queries_are_identical() {
        let index = shared_index().await;
        let coordinator =
            PipelineCoordinator::over_index(index, LexicalOverlapScorer, fast_config());
        let options = QueryOptions::default();

        let first = coordinator.query("pump seal maintenance", &options).await.expect("first");
        let second = coordinator.query("pump seal maintenance", &options).await.expect("second");

        assert_eq!(first.citations, second.citations);
        assert_eq!(first.integrity_score, second.integrity_score);
        assert_ne!(first.query_id, second.query_id);
    }

    #[tokio::test]
    async fn strict_mode_rejects_low_integrity_without_an_answer() {
        let index = shared_index().await;
        let coordinator = PipelineCoordinator::over_index(index, FixedScorer(0.82), fast_config());
        let options = QueryOptions {
            strict_integrity: true,
            ..QueryOptions::default()
        };

        let error = coordinator
            .query("maximum pressure of the pump", &options)
            .await
            .expect_err("strict mode rejects");

        match error.kind {
            PipelineFailure::IntegrityBelowThreshold { score, threshold } => {
                assert!((score - 0.82).abs() < 1e-9);
                assert_eq!(threshold, 0.9);
            }
            other => panic!("unexpected failure: {other}"),
        }
        assert_eq!(error.last_completed, Some(PipelineStage::Packing));
    }

    #[tokio::test]
    async fn low_integrity_is_advisory_outside_strict_mode() {
        let index = shared_index().await;
        let coordinator = PipelineCoordinator::over_index(index, FixedScorer(0.82), fast_config());

        let result = coordinator
            .query("maximum pressure of the pump", &QueryOptions::default())
            .await
            .expect("advisory only");

        assert_eq!(result.integrity_status, IntegrityStatus::Warning);
        assert!(result.citations.iter().all(|c| !c.high_integrity));
    }

    #[tokio::test]
    async fn sparse_failure_degrades_to_dense_results() {
        let index = shared_index().await;
        let retriever = HybridRetriever::new(
            Arc::clone(&index),
            BrokenBackend,
            index.embedder(),
            fast_config().retrieval,
        );
        let reranker = CrossEncoderReranker::new(FixedScorer(0.95), fast_config().rerank);
        let coordinator = PipelineCoordinator::new(retriever, reranker, index, fast_config());

        let result = coordinator
            .query("maximum pressure", &QueryOptions::default())
            .await
            .expect("degraded query succeeds");

        assert!(result.telemetry.partial_retrieval);
        assert_eq!(result.telemetry.degraded_branch, Some(RetrievalMethod::Sparse));
        assert_eq!(result.telemetry.sparse_candidates, 0);
        assert!(!result.citations.is_empty());
    }

    #[tokio::test]
    async fn both_branches_failing_aborts_before_any_stage_completes() {
        let index = shared_index().await;
        let retriever = HybridRetriever::new(
            BrokenBackend,
            BrokenBackend,
            index.embedder(),
            fast_config().retrieval,
        );
        let reranker = CrossEncoderReranker::new(FixedScorer(0.95), fast_config().rerank);
        let coordinator = PipelineCoordinator::new(retriever, reranker, index, fast_config());

        let error = coordinator
            .query("maximum pressure", &QueryOptions::default())
            .await
            .expect_err("both branches down");

        assert!(matches!(error.kind, PipelineFailure::RetrievalFailed { .. }));
        assert_eq!(error.last_completed, None);
    }

    #[tokio::test]
    async fn unreachable_reranker_falls_back_to_fusion_order() {
        let index = shared_index().await;
        let coordinator = PipelineCoordinator::over_index(index, UnreachableScorer, fast_config());

        let result = coordinator
            .query("maximum pressure", &QueryOptions::default())
            .await
            .expect("fallback succeeds");

        assert!(!result.telemetry.reranked);
        assert!(!result.citations.is_empty());
        assert_eq!(result.citations[0].score, 1.0);
    }

    #[tokio::test]
    async fn slow_reranker_times_out_into_fallback() {
        let index = shared_index().await;
        let mut config = fast_config();
        config.rerank.timeout_ms = 50;
        let coordinator =
            PipelineCoordinator::over_index(index, SlowScorer(Duration::from_secs(5)), config);

        let result = coordinator
            .query("maximum pressure", &QueryOptions::default())
            .await
            .expect("fallback succeeds");

        assert!(!result.telemetry.reranked);
        assert!(!result.citations.is_empty());
    }

    #[tokio::test]
    async fn telemetry_reports_each_stage_once_in_order() {
        let index = shared_index().await;
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let coordinator =
            PipelineCoordinator::over_index(index, FixedScorer(0.97), fast_config())
                .with_telemetry(sender);

        let result = coordinator
            .query("pump", &QueryOptions::default())
            .await
            .expect("query succeeds");

        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            assert_eq!(event.query_id, result.query_id);
            events.push((event.stage, event.status));
        }
        let expected: Vec<_> = PipelineStage::ALL
            .into_iter()
            .flat_map(|stage| [(stage, StageStatus::Start), (stage, StageStatus::Complete)])
            .collect();
        assert_eq!(events, expected);
        assert_eq!(result.telemetry.stage_timings.len(), 4);
    }

    #[tokio::test]
    async fn cancellation_drops_the_in_flight_rerank() {
        let index = shared_index().await;
        let mut config = fast_config();
        config.rerank.timeout_ms = 10_000;
        let coordinator =
            PipelineCoordinator::over_index(index, SlowScorer(Duration::from_secs(10)), config);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let error = coordinator
            .query_with_cancel("maximum pressure", &QueryOptions::default(), &cancel)
            .await
            .expect_err("cancelled");

        assert!(matches!(error.kind, PipelineFailure::Cancelled));
        assert_eq!(error.last_completed, Some(PipelineStage::Fusing));
    }

    #[tokio::test]
    async fn cancelled_before_start_reports_no_stage() {
        let index = shared_index().await;
        let coordinator = PipelineCoordinator::over_index(index, FixedScorer(0.9), fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = coordinator
            .query_with_cancel("pump", &QueryOptions::default(), &cancel)
            .await
            .expect_err("cancelled");

        assert!(matches!(error.kind, PipelineFailure::Cancelled));
        assert_eq!(error.last_completed, None);
    }

    #[tokio::test]
    async fn blank_query_is_rejected() {
        let index = shared_index().await;
        let coordinator = PipelineCoordinator::over_index(index, FixedScorer(0.9), fast_config());

        let error = coordinator
            .query("   ", &QueryOptions::default())
            .await
            .expect_err("empty query");
        assert!(matches!(error.kind, PipelineFailure::EmptyQuery));
    }
}
