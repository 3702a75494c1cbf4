//! Evidence capture: screenshots and logs under a deterministic naming scheme
//!
//! Every artifact lands in `<output>/<scenario>/` as
//! `{scenario}_{stepIndex}_{sequence}.{png|log}`. The sequence number is
//! shared by all artifacts of one run and only ever increases.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::condition::{CheckContext, Condition, Observation};
use crate::error::{HarnessError, HarnessResult};
use crate::page::{PageDriver, ScreenshotTarget};
use crate::poll::{poll_until, PollOutcome, PollPolicy, Probe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Screenshot,
    Log,
}

impl ArtifactKind {
    fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "png",
            ArtifactKind::Log => "log",
        }
    }
}

/// A captured screenshot or log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceArtifact {
    pub scenario: String,
    pub step_index: usize,
    pub sequence: u64,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Replace everything outside `[A-Za-z0-9-]` with `-`
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Per-run evidence collector
#[derive(Debug)]
pub struct EvidenceCollector {
    scenario: String,
    stem: String,
    dir: PathBuf,
    next_sequence: u64,
    artifacts: Vec<EvidenceArtifact>,
}

impl EvidenceCollector {
    pub fn new(output_root: &Path, scenario: &str) -> Self {
        let stem = sanitize(scenario);
        Self {
            scenario: scenario.to_string(),
            dir: output_root.join(&stem),
            stem,
            next_sequence: 0,
            artifacts: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifacts(&self) -> &[EvidenceArtifact] {
        &self.artifacts
    }

    pub fn into_artifacts(self) -> Vec<EvidenceArtifact> {
        self.artifacts
    }

    fn allocate(&mut self, step_index: usize, kind: ArtifactKind) -> HarnessResult<(u64, PathBuf)> {
        std::fs::create_dir_all(&self.dir)?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let file = format!("{}_{}_{}.{}", self.stem, step_index, sequence, kind.extension());
        Ok((sequence, self.dir.join(file)))
    }

    fn record(
        &mut self,
        step_index: usize,
        sequence: u64,
        kind: ArtifactKind,
        path: PathBuf,
        label: Option<String>,
    ) -> EvidenceArtifact {
        let sha256 = match std::fs::read(&path) {
            Ok(bytes) => Some(hex::encode(Sha256::digest(&bytes))),
            Err(e) => {
                warn!("Cannot hash {}: {}", path.display(), e);
                None
            }
        };
        let artifact = EvidenceArtifact {
            scenario: self.scenario.clone(),
            step_index,
            sequence,
            kind,
            path,
            label,
            sha256,
            timestamp: Utc::now(),
        };
        debug!("Captured {:?} {}", artifact.kind, artifact.path.display());
        self.artifacts.push(artifact.clone());
        artifact
    }

    /// Capture the page or one element.
    ///
    /// An element target must resolve to exactly one visible element within
    /// the policy; otherwise this fails with `TargetNotFound`.
    pub async fn screenshot(
        &mut self,
        page: &dyn PageDriver,
        step_index: usize,
        target: &ScreenshotTarget,
        label: Option<String>,
        policy: PollPolicy,
    ) -> HarnessResult<EvidenceArtifact> {
        if let ScreenshotTarget::Element { selector } = target {
            let outcome = poll_until(policy, move || async move {
                let state = page.query(selector).await?;
                Ok::<_, HarnessError>(if state.visible == 1 {
                    Probe::Done(state.visible)
                } else {
                    Probe::Pending(state.visible)
                })
            })
            .await?;

            if let PollOutcome::TimedOut {
                attempts,
                last,
                last_error,
            } = outcome
            {
                if attempts == 0 {
                    return Err(HarnessError::Timeout {
                        what: format!("screenshot of {}", selector),
                        timeout_ms: policy.timeout_ms(),
                    });
                }
                let reason = match (last, last_error) {
                    (Some(visible), _) => format!("{} visible elements, expected exactly 1", visible),
                    (None, Some(err)) => err.to_string(),
                    (None, None) => "no observation".to_string(),
                };
                return Err(HarnessError::TargetNotFound {
                    target: selector.clone(),
                    reason,
                });
            }
        }

        let (sequence, path) = self.allocate(step_index, ArtifactKind::Screenshot)?;
        page.screenshot(target, &path).await?;
        Ok(self.record(step_index, sequence, ArtifactKind::Screenshot, path, label))
    }

    /// Write lines to a log artifact
    pub fn write_log(
        &mut self,
        step_index: usize,
        label: Option<String>,
        lines: &[String],
    ) -> HarnessResult<EvidenceArtifact> {
        let (sequence, path) = self.allocate(step_index, ArtifactKind::Log)?;
        let mut text = lines.join("\n");
        text.push('\n');
        std::fs::write(&path, text)?;
        Ok(self.record(step_index, sequence, ArtifactKind::Log, path, label))
    }

    /// Poll `condition` until it holds. On a final false, capture a full
    /// page screenshot and fail with `AssertionFailure`.
    pub async fn assert(
        &mut self,
        ctx: &CheckContext<'_>,
        step_index: usize,
        condition: &Condition,
        description: &str,
        policy: PollPolicy,
    ) -> HarnessResult<Observation> {
        let outcome = poll_until(policy, move || async move {
            let observation = condition.evaluate(ctx).await?;
            Ok::<_, HarnessError>(if observation.passed {
                Probe::Done(observation)
            } else {
                Probe::Pending(observation)
            })
        })
        .await?;

        let (attempts, last, last_error) = match outcome {
            PollOutcome::Ready(observation) => return Ok(observation),
            PollOutcome::TimedOut {
                attempts,
                last,
                last_error,
            } => (attempts, last, last_error),
        };

        if attempts == 0 {
            return Err(HarnessError::Timeout {
                what: format!("assert {}", description),
                timeout_ms: policy.timeout_ms(),
            });
        }

        let observed = match (last, last_error) {
            (_, Some(err)) => err.to_string(),
            (Some(observation), None) => observation.observed,
            (None, None) => "no observation".to_string(),
        };

        let evidence = match self
            .screenshot(
                ctx.page,
                step_index,
                &ScreenshotTarget::Page { full_page: true },
                Some(format!("assertion failed: {}", description)),
                policy,
            )
            .await
        {
            Ok(artifact) => Some(artifact.path),
            Err(e) => {
                warn!("Could not capture evidence for '{}': {}", description, e);
                None
            }
        };

        Err(HarnessError::AssertionFailure {
            description: description.to_string(),
            observed,
            evidence,
        })
    }

    /// Screenshot plus console log after a hard failure. Capture problems
    /// are logged, never raised.
    pub async fn capture_failure(&mut self, page: &dyn PageDriver, step_index: usize) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        let already_shot = self
            .artifacts
            .iter()
            .any(|a| a.step_index == step_index && a.kind == ArtifactKind::Screenshot);

        if !already_shot {
            let (sequence, path) = match self.allocate(step_index, ArtifactKind::Screenshot) {
                Ok(slot) => slot,
                Err(e) => {
                    warn!("Cannot create evidence directory: {}", e);
                    return paths;
                }
            };
            match page
                .screenshot(&ScreenshotTarget::Page { full_page: true }, &path)
                .await
            {
                Ok(()) => {
                    let artifact = self.record(
                        step_index,
                        sequence,
                        ArtifactKind::Screenshot,
                        path,
                        Some("failure".to_string()),
                    );
                    paths.push(artifact.path);
                }
                Err(e) => warn!("Failure screenshot not captured: {}", e),
            }
        }

        let console = page.console().await;
        match self.write_log(step_index, Some("console".to_string()), &console) {
            Ok(artifact) => paths.push(artifact.path),
            Err(e) => warn!("Console log not written: {}", e),
        }
        paths
    }
}
