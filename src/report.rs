//! Outcome taxonomy and the report returned for every submission

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::runner::ExecutionResult;

/// Terminal outcome of one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    Rejected,
    RunnerError,
}

impl Outcome {
    /// Default HTTP status for this outcome
    pub fn http_status(&self) -> u16 {
        match self {
            Outcome::Success | Outcome::Failure => 200,
            Outcome::Timeout => 408,
            Outcome::Rejected => 400,
            Outcome::RunnerError => 500,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Timeout => "timeout",
            Outcome::Rejected => "rejected",
            Outcome::RunnerError => "runner_error",
        };
        write!(f, "{}", s)
    }
}

/// Structured result returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub submission_id: Uuid,
    pub outcome: Outcome,
    pub stdout: String,
    pub stderr: String,
    pub message: String,
    pub next_lesson_id: Option<u32>,
    pub matched_case_index: Option<usize>,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
    /// Output beyond the capture cap was dropped
    #[serde(default)]
    pub output_truncated: bool,
    pub progress_recorded: bool,
    /// Transport status; a rejection may be 403/404 rather than 400
    #[serde(skip)]
    pub http_status: u16,
}

impl ExecutionReport {
    fn new(submission_id: Uuid, outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            submission_id,
            outcome,
            stdout: String::new(),
            stderr: String::new(),
            message: message.into(),
            next_lesson_id: None,
            matched_case_index: None,
            exit_code: None,
            duration_ms: None,
            output_truncated: false,
            progress_recorded: false,
            http_status: outcome.http_status(),
        }
    }

    /// Bad input; nothing was run
    pub fn rejected(submission_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(submission_id, Outcome::Rejected, message)
    }

    /// Success that carries no program output
    pub fn success(submission_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(submission_id, Outcome::Success, message)
    }

    /// Infrastructure failure; the message must be safe to show a student
    pub fn runner_error(submission_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(submission_id, Outcome::RunnerError, message)
    }

    /// Report carrying the program's output
    pub fn from_execution(
        submission_id: Uuid,
        outcome: Outcome,
        result: &ExecutionResult,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            exit_code: result.exit_code,
            duration_ms: Some(result.duration_ms),
            output_truncated: result.output_truncated,
            ..Self::new(submission_id, outcome, message)
        }
    }

    pub fn with_status(mut self, http_status: u16) -> Self {
        self.http_status = http_status;
        self
    }

    pub fn with_next_lesson(mut self, next_lesson_id: Option<u32>) -> Self {
        self.next_lesson_id = next_lesson_id;
        self
    }

    pub fn with_matched_case(mut self, index: Option<usize>) -> Self {
        self.matched_case_index = index;
        self
    }

    pub fn with_progress_recorded(mut self, recorded: bool) -> Self {
        self.progress_recorded = recorded;
        self
    }
}
