//! Run and suite reports

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FailureKind, HarnessError, HarnessResult};
use crate::evidence::EvidenceArtifact;
use crate::mock::DispatchRecord;
use crate::scenario::Criticality;
use crate::visual::VisualDiff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    SoftFailed,
    HardFailed,
    /// Not attempted because an earlier required step failed
    Skipped,
}

/// Scenario lifecycle: `Pending` until the first step is dispatched,
/// `Running` until the last one settles, then one of the final states.
/// Reports only ever carry a final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Pending,
    Running,
    Completed,
    /// Completed with warnings: only best-effort steps failed
    SoftFailed,
    HardFailed,
}

impl ScenarioStatus {
    /// Whether the scenario counts as a success for the exit code
    pub fn is_success(&self) -> bool {
        matches!(self, ScenarioStatus::Completed | ScenarioStatus::SoftFailed)
    }
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScenarioStatus::Pending => "pending",
            ScenarioStatus::Running => "running",
            ScenarioStatus::Completed => "completed",
            ScenarioStatus::SoftFailed => "completed with warnings",
            ScenarioStatus::HardFailed => "failed",
        };
        f.write_str(s)
    }
}

/// Classified failure, as stored in reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<PathBuf>,
}

impl From<&HarnessError> for FailureInfo {
    fn from(err: &HarnessError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            evidence: err.evidence().cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub label: String,
    pub criticality: Criticality,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    /// Artifacts captured while running or failing this step
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<PathBuf>,
}

impl StepOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, StepStatus::SoftFailed | StepStatus::HardFailed)
    }
}

/// Outcome of one scenario run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub scenario: String,
    pub status: ScenarioStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub steps: Vec<StepOutcome>,
    pub artifacts: Vec<EvidenceArtifact>,
    /// Every request the registry saw
    pub dispatches: Vec<DispatchRecord>,
    /// Set when any step forced in-page state; findings are then structural,
    /// not end-to-end
    pub state_injected: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub visual_diffs: Vec<VisualDiff>,
    /// Failure that ended the run, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureInfo>,
}

impl RunReport {
    /// Report for a scenario whose session never opened
    pub fn not_started(scenario: &str, err: &HarnessError) -> Self {
        Self {
            scenario: scenario.to_string(),
            status: ScenarioStatus::HardFailed,
            started_at: Utc::now(),
            duration_ms: 0,
            steps: Vec::new(),
            artifacts: Vec::new(),
            dispatches: Vec::new(),
            state_injected: false,
            visual_diffs: Vec::new(),
            error: Some(FailureInfo::from(err)),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.is_failure())
    }

    pub fn statuses(&self) -> Vec<StepStatus> {
        self.steps.iter().map(|s| s.status).collect()
    }
}

/// Outcome of a set of runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub total: usize,
    pub completed: usize,
    pub warnings: usize,
    pub failed: usize,
    pub duration_ms: u64,
    /// Why the suite stopped early
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub results: Vec<RunReport>,
}

impl SuiteReport {
    pub fn new(results: Vec<RunReport>, duration_ms: u64, aborted: Option<String>) -> Self {
        let count = |status: ScenarioStatus| results.iter().filter(|r| r.status == status).count();
        Self {
            total: results.len(),
            completed: count(ScenarioStatus::Completed),
            warnings: count(ScenarioStatus::SoftFailed),
            failed: count(ScenarioStatus::HardFailed),
            duration_ms,
            aborted,
            results,
        }
    }

    /// 0 on success, 1 when a scenario hard-failed, 2 when the harness
    /// itself could not run the suite
    pub fn exit_code(&self) -> i32 {
        if self.aborted.is_some() {
            2
        } else if self.failed > 0 {
            1
        } else {
            0
        }
    }

    /// Write `report.json` into `dir`
    pub fn write_json(&self, dir: &Path) -> HarnessResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("report.json");
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!("Report written to: {}", path.display());
        Ok(path)
    }
}
