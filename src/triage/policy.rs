//! Default retryable / terminal classification.

use super::traits::FailurePolicy;
use super::types::{FailureClass, FailureKind, StageFailure};
use crate::config::IngestConfig;

#[derive(Debug, Clone)]
pub struct DefaultFailurePolicy {
    /// A missing file may appear later (sync lag, remote download pending).
    pub retry_missing_artifact: bool,
    /// Executor failures at this attempt become terminal.
    pub max_attempts: u32,
}

impl DefaultFailurePolicy {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            retry_missing_artifact: config.retry_missing_artifact,
            max_attempts: config.max_attempts,
        }
    }
}

impl Default for DefaultFailurePolicy {
    fn default() -> Self {
        Self::from_config(&IngestConfig::default())
    }
}

impl FailurePolicy for DefaultFailurePolicy {
    fn classify(&self, failure: &StageFailure, attempt: u32) -> FailureClass {
        match failure.kind {
            // Not capped by max_attempts: the file is expected to show up eventually.
            FailureKind::MissingArtifact if self.retry_missing_artifact => FailureClass::Retryable,
            FailureKind::MissingArtifact | FailureKind::CorruptArtifact => FailureClass::Terminal,
            FailureKind::Executor if failure.retryable && attempt < self.max_attempts => {
                FailureClass::Retryable
            }
            FailureKind::Executor => FailureClass::Terminal,
        }
    }
}
