use crate::models::{PipelineStage, RetrievalMethod};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Start,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageEvent {
    pub query_id: Uuid,
    pub stage: PipelineStage,
    pub status: StageStatus,
    pub timestamp_ms: i64,
}

pub type TelemetrySender = UnboundedSender<StageEvent>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageTiming {
    pub stage: PipelineStage,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryTelemetry {
    pub stage_timings: Vec<StageTiming>,
    /// One retrieval branch failed after retry; results come from the other.
    pub partial_retrieval: bool,
    pub degraded_branch: Option<RetrievalMethod>,
    /// False when the reranker was unavailable and fusion order was kept.
    pub reranked: bool,
    pub dense_candidates: usize,
    pub sparse_candidates: usize,
    pub fused_candidates: usize,
    pub reranked_candidates: usize,
    pub packed_citations: usize,
}

/// Emits start/complete events for one query and records stage timings.
pub struct StageRecorder {
    query_id: Uuid,
    sender: Option<TelemetrySender>,
    open: Option<(PipelineStage, Instant)>,
    timings: Vec<StageTiming>,
    last_completed: Option<PipelineStage>,
}

impl StageRecorder {
    pub fn new(query_id: Uuid, sender: Option<TelemetrySender>) -> Self {
        Self {
            query_id,
            sender,
            open: None,
            timings: Vec::new(),
            last_completed: None,
        }
    }

    pub fn start(&mut self, stage: PipelineStage) {
        self.open = Some((stage, Instant::now()));
        self.emit(stage, StageStatus::Start);
    }

    pub fn complete(&mut self, stage: PipelineStage) {
        if let Some((open_stage, started)) = self.open.take() {
            if open_stage == stage {
                self.timings.push(StageTiming {
                    stage,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
        self.last_completed = Some(stage);
        self.emit(stage, StageStatus::Complete);
    }

    pub fn last_completed(&self) -> Option<PipelineStage> {
        self.last_completed
    }

    pub fn into_timings(self) -> Vec<StageTiming> {
        self.timings
    }

    fn emit(&self, stage: PipelineStage, status: StageStatus) {
        if let Some(sender) = &self.sender {
            // A dropped receiver only means nobody is watching progress.
            let _ = sender.send(StageEvent {
                query_id: self.query_id,
                stage,
                status,
                timestamp_ms: Utc::now().timestamp_millis(),
            });
        }
    }
}
