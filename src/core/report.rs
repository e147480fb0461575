//! Batch outcome handed back to the caller.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::artifacts::write_json_atomic;
use crate::core::error::TiResult;
use crate::core::montage::RejectedMontage;
use crate::core::pipeline::PipelineRun;

/// Stage name reported for montages rejected before scheduling.
pub const CATALOG_STAGE: &str = "catalog";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub montage: String,
    pub stage: String,
    pub kind: String,
    pub detail: String,
}

/// Identity and clock of one scheduler invocation.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    clock: Instant,
}

impl Session {
    pub fn start() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub session_id: Uuid,
    pub subject_id: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub succeeded: usize,
    pub failed: usize,
    /// Every scheduled montage, in request order.
    pub runs: Vec<PipelineRun>,
    /// Failed runs and catalog rejections.
    pub failures: Vec<FailureSummary>,
    /// Names rejected before scheduling.
    pub rejected: Vec<String>,
}

impl CompletionReport {
    pub fn build(
        session: &Session,
        subject_id: &str,
        runs: Vec<PipelineRun>,
        rejected: &[RejectedMontage],
    ) -> Self {
        let mut failures: Vec<FailureSummary> = rejected
            .iter()
            .map(|r| FailureSummary {
                montage: r.name.clone(),
                stage: CATALOG_STAGE.to_string(),
                kind: r.error.kind().to_string(),
                detail: r.error.to_string(),
            })
            .collect();
        failures.extend(runs.iter().filter(|r| !r.is_success()).map(|r| {
            match &r.failure {
                Some(f) => FailureSummary {
                    montage: r.montage.clone(),
                    stage: f.stage.as_str().to_string(),
                    kind: f.kind.clone(),
                    detail: f.detail.clone(),
                },
                None => FailureSummary {
                    montage: r.montage.clone(),
                    stage: r.position.as_str().to_string(),
                    kind: "worker".to_string(),
                    detail: "run never finished".to_string(),
                },
            }
        }));

        let succeeded = runs.iter().filter(|r| r.is_success()).count();
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            session_id: session.id,
            subject_id: subject_id.to_string(),
            hostname,
            started_at: session.started_at,
            finished_at: Utc::now(),
            duration_secs: session.clock.elapsed().as_secs_f64(),
            succeeded,
            failed: failures.len(),
            runs,
            failures,
            rejected: rejected.iter().map(|r| r.name.clone()).collect(),
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn run(&self, montage: &str) -> Option<&PipelineRun> {
        self.runs.iter().find(|r| r.montage == montage)
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{} montage(s) for sub-{}: {} succeeded, {} failed in {:.1}s",
            self.total(),
            self.subject_id,
            self.succeeded,
            self.failed,
            self.duration_secs
        );
        if !self.failures.is_empty() {
            let failed: Vec<String> = self
                .failures
                .iter()
                .map(|f| format!("{} at {}", f.montage, f.stage))
                .collect();
            line.push_str(&format!(" ({})", failed.join(", ")));
        }
        line
    }

    pub fn file_name(&self) -> String {
        format!("completion_{}.json", self.session_id)
    }

    /// Written once, atomically, after every run has settled.
    pub async fn persist(&self, dir: &Path) -> TiResult<PathBuf> {
        let path = dir.join(self.file_name());
        write_json_atomic(&path, self).await?;
        Ok(path)
    }
}
