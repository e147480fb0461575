mod runner;

use std::any::Any;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::artifacts::{ArtifactManifest, VerificationReport};
use crate::core::error::TiError;
use crate::core::montage::SimulationMode;

pub use runner::PipelineRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    Setup,
    Visualize,
    Solve,
    ComputeEnvelope,
    ExtractTissue,
    Transform,
    Verify,
    Done,
}

impl Stage {
    /// Stages that do work, in execution order.
    pub const PIPELINE: [Stage; 7] = [
        Stage::Setup,
        Stage::Visualize,
        Stage::Solve,
        Stage::ComputeEnvelope,
        Stage::ExtractTissue,
        Stage::Transform,
        Stage::Verify,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Setup => "setup",
            Stage::Visualize => "visualize",
            Stage::Solve => "solve",
            Stage::ComputeEnvelope => "compute_envelope",
            Stage::ExtractTissue => "extract_tissue",
            Stage::Transform => "transform",
            Stage::Verify => "verify",
            Stage::Done => "done",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Stage::Queued),
            "setup" => Some(Stage::Setup),
            "visualize" => Some(Stage::Visualize),
            "solve" => Some(Stage::Solve),
            "compute_envelope" => Some(Stage::ComputeEnvelope),
            "extract_tissue" => Some(Stage::ExtractTissue),
            "transform" => Some(Stage::Transform),
            "verify" => Some(Stage::Verify),
            "done" => Some(Stage::Done),
            _ => None,
        }
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Queued => Some(Stage::Setup),
            Stage::Setup => Some(Stage::Visualize),
            Stage::Visualize => Some(Stage::Solve),
            Stage::Solve => Some(Stage::ComputeEnvelope),
            Stage::ComputeEnvelope => Some(Stage::ExtractTissue),
            Stage::ExtractTissue => Some(Stage::Transform),
            Stage::Transform => Some(Stage::Verify),
            Stage::Verify => Some(Stage::Done),
            Stage::Done => None,
        }
    }
}

/// Text carried by a panic payload, for failure details.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Strictly forward, one step at a time. No skipping, no going back.
pub fn can_transition(from: Stage, to: Stage) -> bool {
    from.next() == Some(to)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: String,
    pub detail: String,
}

/// Life of one montage through the pipeline. Owned and mutated by the worker
/// running that montage only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub montage: String,
    pub mode: SimulationMode,
    pub position: Stage,
    pub stages: Vec<StageRecord>,
    pub manifest: Option<ArtifactManifest>,
    pub verification: Option<VerificationReport>,
    pub log_path: Option<PathBuf>,
    pub outcome: Option<Outcome>,
    pub failure: Option<StageFailure>,
}

impl PipelineRun {
    pub fn new(montage: impl Into<String>, mode: SimulationMode) -> Self {
        Self {
            montage: montage.into(),
            mode,
            position: Stage::Queued,
            stages: Stage::PIPELINE
                .iter()
                .map(|&stage| StageRecord {
                    stage,
                    status: StageStatus::Pending,
                    started_at: None,
                    ended_at: None,
                    detail: None,
                })
                .collect(),
            manifest: None,
            verification: None,
            log_path: None,
            outcome: None,
            failure: None,
        }
    }

    pub fn record(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    fn record_mut(&mut self, stage: Stage) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|r| r.stage == stage)
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Some(Outcome::Success)
    }

    /// Moves into `stage`. Refused once finished or out of order.
    pub fn begin(&mut self, stage: Stage) -> bool {
        if self.is_finished() || !can_transition(self.position, stage) {
            return false;
        }
        self.position = stage;
        if let Some(record) = self.record_mut(stage) {
            record.status = StageStatus::Running;
            record.started_at = Some(Utc::now());
        }
        true
    }

    pub fn succeed(&mut self, stage: Stage, detail: Option<String>) {
        if let Some(record) = self.record_mut(stage)
            && record.status == StageStatus::Running
        {
            record.status = StageStatus::Succeeded;
            record.ended_at = Some(Utc::now());
            record.detail = detail;
        }
    }

    /// Fails `stage` and finalizes the run. Later stages stay pending.
    pub fn fail(&mut self, stage: Stage, error: &TiError) {
        self.record_failure(stage, error.kind(), error.to_string());
    }

    /// Records a failure that has no [`TiError`] behind it, such as a worker
    /// task that panicked.
    pub fn abandon(&mut self, detail: impl Into<String>) {
        let stage = self.current_or_next();
        self.record_failure(stage, "worker", detail.into());
    }

    fn record_failure(&mut self, stage: Stage, kind: &str, detail: String) {
        if self.is_finished() {
            return;
        }
        if let Some(record) = self.record_mut(stage) {
            record.status = StageStatus::Failed;
            record.started_at.get_or_insert_with(Utc::now);
            record.ended_at = Some(Utc::now());
            record.detail = Some(detail.clone());
        }
        self.failure = Some(StageFailure {
            stage,
            kind: kind.to_string(),
            detail,
        });
        self.outcome = Some(Outcome::Failure);
    }

    fn current_or_next(&self) -> Stage {
        match self.record(self.position) {
            Some(r) if r.status == StageStatus::Running => self.position,
            _ => self.position.next().unwrap_or(Stage::Verify),
        }
    }

    /// Fails whichever stage is running, or the next one if none is.
    pub fn fail_current(&mut self, error: &TiError) {
        let stage = self.current_or_next();
        self.fail(stage, error);
    }

    /// Marks the run successful once every stage succeeded.
    pub fn complete(&mut self) {
        if self.is_finished() {
            return;
        }
        let all_ok = self
            .stages
            .iter()
            .all(|r| r.status == StageStatus::Succeeded);
        if all_ok && can_transition(self.position, Stage::Done) {
            self.position = Stage::Done;
            self.outcome = Some(Outcome::Success);
        } else {
            let stalled = self
                .stages
                .iter()
                .find(|r| r.status != StageStatus::Succeeded)
                .map(|r| r.stage)
                .unwrap_or(Stage::Verify);
            self.record_failure(
                stalled,
                "worker",
                "pipeline stopped before every stage ran".to_string(),
            );
        }
    }
}

#[cfg(test)]
mod tests;
