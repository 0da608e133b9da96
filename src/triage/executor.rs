//! External-program stage executor.
//!
//! The OCR program receives the artifact path as its last argument and
//! prints the text. The summarize program reads OCR text on stdin and prints
//! `{"summary": ..., "significance": ..., "entities": [...]}`.
//!
//! Exit codes follow sysexits: 0 success, 75 (`EX_TEMPFAIL`) retry later,
//! 65 (`EX_DATAERR`) the input is unusable, anything else is terminal.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use serde::Deserialize;

use super::traits::StageExecutor;
use super::types::*;

const EX_DATAERR: i32 = 65;
const EX_TEMPFAIL: i32 = 75;

/// Longest stderr excerpt kept as a failure reason.
const MAX_REASON_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    stage: Stage,
    program: String,
    args: Vec<String>,
}

#[derive(Deserialize)]
struct SummaryReply {
    summary: String,
    significance: Option<f64>,
    #[serde(default)]
    entities: Vec<String>,
}

impl CommandExecutor {
    pub fn new(stage: Stage, program: impl Into<String>) -> Self {
        Self {
            stage,
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Split a whitespace-separated command line. `None` when empty.
    pub fn from_command_line(stage: Stage, line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(parts.fold(Self::new(stage, program), |exec, a| exec.arg(a)))
    }

    fn spawn(&self, artifact: Option<&Path>, stdin: Option<&str>) -> std::io::Result<Output> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(path) = artifact {
            cmd.arg(path);
        }
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let (Some(text), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // Fed from another thread so a chatty child cannot fill its
            // stdout pipe while we block on stdin.
            let text = text.to_string();
            std::thread::spawn(move || {
                let _ = pipe.write_all(text.as_bytes());
            });
        }
        child.wait_with_output()
    }

    fn interpret(&self, output: &Output) -> StageResult {
        let code = output.status.code();
        if code != Some(0) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut reason: String = stderr.trim().chars().take(MAX_REASON_CHARS).collect();
            if reason.is_empty() {
                reason = format!("{} exited with {}", self.program, output.status);
            }
            return StageResult::Failure(match code {
                Some(EX_TEMPFAIL) => StageFailure::executor(reason, true),
                Some(EX_DATAERR) => StageFailure::corrupt_artifact(reason),
                _ => StageFailure::executor(reason, false),
            });
        }

        match self.stage {
            Stage::Ocr => {
                let text = String::from_utf8_lossy(&output.stdout).into_owned();
                if text.trim().is_empty() {
                    return StageResult::Failure(StageFailure::corrupt_artifact(
                        "no text extracted",
                    ));
                }
                // pdftotext and friends separate pages with form feeds.
                let breaks = text.trim_end().matches('\x0c').count();
                let page_count = (breaks > 0).then_some(breaks as u32 + 1);
                StageResult::Success(StageOutput::Ocr { text, page_count })
            }
            Stage::Summarize => match serde_json::from_slice::<SummaryReply>(&output.stdout) {
                Ok(reply) => StageResult::Success(StageOutput::Summary {
                    summary: reply.summary,
                    significance: reply.significance,
                    entities: reply.entities,
                }),
                Err(e) => StageResult::Failure(StageFailure::executor(
                    format!("unparseable summarizer output: {e}"),
                    true,
                )),
            },
        }
    }
}

impl StageExecutor for CommandExecutor {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn run(&self, record: &ProcessingRecord, artifact: Option<&Path>) -> StageResult {
        let spawned = match self.stage {
            Stage::Ocr => {
                let Some(path) = artifact else {
                    return StageResult::Failure(StageFailure::missing_artifact(
                        "no resolved file for OCR",
                    ));
                };
                self.spawn(Some(path), None)
            }
            Stage::Summarize => {
                let text = match record.ocr_text.as_deref() {
                    Some(text) if !text.trim().is_empty() && !is_failure_marker(text) => text,
                    _ => {
                        return StageResult::Failure(StageFailure::executor(
                            "no OCR text to summarize",
                            false,
                        ))
                    }
                };
                self.spawn(None, Some(text))
            }
        };

        match spawned {
            Ok(output) => self.interpret(&output),
            Err(e) => {
                tracing::error!(program = %self.program, error = %e, "Failed to start stage program");
                StageResult::Failure(StageFailure::executor(
                    format!("failed to start {}: {e}", self.program),
                    false,
                ))
            }
        }
    }
}
