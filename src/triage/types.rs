//! Types shared across the triage scheduler, its stores and executors.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::db::DatabaseError;

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$(Self::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(RecordStatus {
    Pending => "pending",
    Downloaded => "downloaded",
    OcrInProgress => "ocr_in_progress",
    OcrProcessed => "ocr_processed",
    Summarizing => "summarizing",
    Summarized => "summarized",
    Error => "error",
});

impl RecordStatus {
    /// Stage-coarse position in the pipeline. A claim shares the rank of
    /// the stage's input status, so releasing it is not a regression.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Downloaded | Self::OcrInProgress => 1,
            Self::OcrProcessed | Self::Summarizing => 2,
            Self::Summarized => 3,
            Self::Error => 4,
        }
    }

    /// The stage currently holding a claim on a record in this status.
    pub fn in_flight_stage(&self) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.in_flight() == *self)
    }

    /// Targets an operator reset may move a record back to.
    pub fn is_reset_target(&self) -> bool {
        matches!(self, Self::Pending | Self::Downloaded | Self::OcrProcessed)
    }

    pub(crate) fn code(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }
}

str_enum!(Stage {
    Ocr => "ocr",
    Summarize => "summarize",
});

impl Stage {
    /// Status a record must have to be selected for this stage.
    pub fn input(&self) -> RecordStatus {
        match self {
            Self::Ocr => RecordStatus::Downloaded,
            Self::Summarize => RecordStatus::OcrProcessed,
        }
    }

    /// Status held while a worker owns the record.
    pub fn in_flight(&self) -> RecordStatus {
        match self {
            Self::Ocr => RecordStatus::OcrInProgress,
            Self::Summarize => RecordStatus::Summarizing,
        }
    }

    pub fn output(&self) -> RecordStatus {
        match self {
            Self::Ocr => RecordStatus::OcrProcessed,
            Self::Summarize => RecordStatus::Summarized,
        }
    }

    /// Whether the stage reads the record's physical file.
    pub fn needs_artifact(&self) -> bool {
        matches!(self, Self::Ocr)
    }

    /// Column that receives the stage's primary output, or its failure marker.
    pub fn output_column(&self) -> &'static str {
        match self {
            Self::Ocr => "ocr_text",
            Self::Summarize => "ai_summary",
        }
    }
}

str_enum!(RecordTable {
    Documents => "documents",
    FlightLogs => "flight_logs",
    NewsArticles => "news_articles",
});

/// Prefix written into a stage's output column when the stage failed.
pub const FAILURE_SENTINEL: &str = "[failed] ";

pub fn failure_marker(reason: &str) -> String {
    format!("{FAILURE_SENTINEL}{reason}")
}

pub fn is_failure_marker(value: &str) -> bool {
    value.starts_with(FAILURE_SENTINEL)
}

/// A record with a lifecycle through the pipeline stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub id: i64,
    pub table: RecordTable,
    pub title: Option<String>,
    /// Logical artifact reference recorded at ingestion.
    pub local_path: Option<String>,
    pub status: RecordStatus,
    /// Lower value = more urgent.
    pub priority: i64,
    pub created_at: NaiveDateTime,
    pub attempts: u32,
    pub claim_token: Option<String>,
    pub ocr_text: Option<String>,
    pub last_error: Option<String>,
}

/// Ingestion-side input for a new record.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub title: Option<String>,
    pub local_path: Option<String>,
    pub status: RecordStatus,
    pub priority: i64,
    /// `None` stamps the current time.
    pub created_at: Option<NaiveDateTime>,
}

impl NewRecord {
    pub fn downloaded(local_path: &str) -> Self {
        Self {
            title: None,
            local_path: Some(local_path.to_string()),
            status: RecordStatus::Downloaded,
            priority: crate::config::DEFAULT_PRIORITY,
            created_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = status;
        self
    }

    pub fn created_at(mut self, at: NaiveDateTime) -> Self {
        self.created_at = Some(at);
        self
    }
}

/// Derived data a successful stage persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageOutput {
    Ocr {
        text: String,
        page_count: Option<u32>,
    },
    Summary {
        summary: String,
        significance: Option<f64>,
        #[serde(default)]
        entities: Vec<String>,
    },
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Ocr { .. } => Stage::Ocr,
            Self::Summary { .. } => Stage::Summarize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No file reference, or the reference resolved to nothing on this host.
    MissingArtifact,
    /// The file exists but cannot be processed.
    CorruptArtifact,
    /// The stage executor itself failed.
    Executor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub reason: String,
    /// Executor's own opinion; the policy has the final word.
    pub retryable: bool,
}

impl StageFailure {
    pub fn missing_artifact(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::MissingArtifact,
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn corrupt_artifact(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::CorruptArtifact,
            reason: reason.into(),
            retryable: false,
        }
    }

    pub fn executor(reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind: FailureKind::Executor,
            reason: reason.into(),
            retryable,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Success(StageOutput),
    Failure(StageFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Retryable,
    Terminal,
}

/// What `complete_one` did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    Advanced(RecordStatus),
    Requeued,
    Failed,
}

/// One row of the `ingestion_errors` audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionErrorEntry {
    pub record_id: i64,
    pub step: String,
    pub message: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub claimed: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl PassSummary {
    pub fn absorb(&mut self, completion: Completion) {
        match completion {
            Completion::Advanced(_) => self.succeeded += 1,
            Completion::Requeued => self.requeued += 1,
            Completion::Failed => self.failed += 1,
        }
    }
}
