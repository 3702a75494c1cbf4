//! Error types for the harness

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Browser session failed to start: {0}")]
    SessionStart(String),

    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Target not found: {target} ({reason})")]
    TargetNotFound { target: String, reason: String },

    #[error("Assertion failed: {description} (observed: {observed})")]
    AssertionFailure {
        description: String,
        observed: String,
        evidence: Option<PathBuf>,
    },

    #[error("No mock route matched {method} {url} (strict mode)")]
    MockMismatch { method: String, url: String },

    #[error("Failed to load fixture {path}: {reason}")]
    FixtureLoad { path: PathBuf, reason: String },

    #[error("Unknown fixture: {0}")]
    UnknownFixture(String),

    #[error("Timed out after {timeout_ms} ms: {what}")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("Script evaluation failed: {0}")]
    Evaluation(String),

    #[error("Browser driver exited unexpectedly")]
    DriverClosed,

    #[error("Browser driver error: {0}")]
    Driver(String),

    #[error("Auxiliary server error: {0}")]
    Server(String),

    #[error("Scenario error: {0}")]
    Scenario(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Visual regression: {0}")]
    Visual(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type HarnessResult<T> = Result<T, HarnessError>;

/// Report-facing classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SessionStart,
    Navigation,
    TargetNotFound,
    AssertionFailure,
    MockMismatch,
    Fixture,
    Timeout,
    Evaluation,
    Driver,
    Visual,
    Other,
}

impl HarnessError {
    pub fn kind(&self) -> FailureKind {
        match self {
            HarnessError::SessionStart(_) => FailureKind::SessionStart,
            HarnessError::Navigation { .. } => FailureKind::Navigation,
            HarnessError::TargetNotFound { .. } => FailureKind::TargetNotFound,
            HarnessError::AssertionFailure { .. } => FailureKind::AssertionFailure,
            HarnessError::MockMismatch { .. } => FailureKind::MockMismatch,
            HarnessError::FixtureLoad { .. } | HarnessError::UnknownFixture(_) => {
                FailureKind::Fixture
            }
            HarnessError::Timeout { .. } => FailureKind::Timeout,
            HarnessError::Evaluation(_) => FailureKind::Evaluation,
            HarnessError::DriverClosed | HarnessError::Driver(_) => FailureKind::Driver,
            HarnessError::Visual(_) => FailureKind::Visual,
            _ => FailureKind::Other,
        }
    }

    /// Errors that mean the environment itself is unreliable. These end a
    /// scenario regardless of step criticality.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarnessError::SessionStart(_)
                | HarnessError::MockMismatch { .. }
                | HarnessError::DriverClosed
        )
    }

    /// Evidence path attached to the error, if one was captured.
    pub fn evidence(&self) -> Option<&PathBuf> {
        match self {
            HarnessError::AssertionFailure { evidence, .. } => evidence.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(HarnessError::SessionStart("node missing".into()), true; "session start")]
    #[test_case(HarnessError::MockMismatch { method: "GET".into(), url: "http://x/".into() }, true; "strict mismatch")]
    #[test_case(HarnessError::DriverClosed, true; "driver closed")]
    #[test_case(HarnessError::TargetNotFound { target: "#a".into(), reason: "0 matches".into() }, false; "target")]
    #[test_case(HarnessError::Timeout { what: "click".into(), timeout_ms: 0 }, false; "timeout")]
    fn test_fatal_classification(err: HarnessError, fatal: bool) {
        assert_eq!(err.is_fatal(), fatal);
    }

    #[test]
    fn test_kind_groups_fixture_errors() {
        assert_eq!(
            HarnessError::UnknownFixture("pricing".into()).kind(),
            FailureKind::Fixture
        );
        assert_eq!(
            HarnessError::FixtureLoad {
                path: PathBuf::from("fixtures/bad.json"),
                reason: "eof".into()
            }
            .kind(),
            FailureKind::Fixture
        );
    }
}
