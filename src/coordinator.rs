//! Execution coordinator
//!
//! Single entry point for submissions. Each submission moves strictly through
//! `Received -> Normalized -> Executed -> Verified`, and every failure along
//! the way becomes exactly one [`Outcome`]. Internal error text is logged
//! here and never returned to the client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::curriculum::Curriculum;
use crate::error::NormalizeError;
use crate::languages::DEFAULT_LANGUAGE;
use crate::normalizer::Normalizer;
use crate::progress::{LessonGate, ProgressTracker};
use crate::report::{ExecutionReport, Outcome};
use crate::runner::{ExecutionResult, RunLimits, Runner};
use crate::verifier::Verifier;

const GENERIC_FAILURE: &str = "Code execution failed. Please try again later.";

/// How long a failed progress update stays retryable
const PENDING_TTL: Duration = Duration::from_secs(60 * 60);

/// Most unsaved passes kept at once; the oldest are dropped first
const MAX_PENDING: usize = 10_000;

/// Graded submission for one lesson
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    pub code: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    pub lesson_id: Option<u32>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Ungraded run
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    pub code: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Retry of a progress update that failed after a verified pass
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressRetryRequest {
    pub submission_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Received,
    Normalized,
    Executed,
    Verified,
}

#[derive(Debug, Clone)]
struct PendingCompletion {
    user_id: String,
    lesson_id: u32,
    next_lesson_id: Option<u32>,
    recorded_at: Instant,
}

/// Verified passes whose progress update failed, bounded by age and count
#[derive(Debug)]
struct PendingCompletions {
    entries: HashMap<Uuid, PendingCompletion>,
    ttl: Duration,
    capacity: usize,
}

impl PendingCompletions {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, submission_id: Uuid, completion: PendingCompletion) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.recorded_at.elapsed() < ttl);

        while self.entries.len() >= self.capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.recorded_at)
                .map(|(id, _)| *id)
            else {
                break;
            };
            if let Some(dropped) = self.entries.remove(&oldest) {
                warn!(
                    "[{}] Dropping unsaved progress for user {} lesson {}: too many pending updates",
                    oldest, dropped.user_id, dropped.lesson_id
                );
            }
        }

        self.entries.insert(submission_id, completion);
    }

    fn get(&self, submission_id: &Uuid) -> Option<PendingCompletion> {
        self.entries
            .get(submission_id)
            .filter(|entry| entry.recorded_at.elapsed() < self.ttl)
            .cloned()
    }

    fn remove(&mut self, submission_id: &Uuid) {
        self.entries.remove(submission_id);
    }
}

fn stage(submission_id: Uuid, stage: Stage) {
    debug!("[{}] stage={:?}", submission_id, stage);
}

fn timeout_message(limits: &RunLimits) -> String {
    format!(
        "Code execution timed out ({} second limit). Your program may be stuck in a loop.",
        limits.time_ms.div_ceil(1000)
    )
}

/// Orchestrates normalizer, runner, verifier and the progress collaborator
pub struct Coordinator {
    normalizer: Normalizer,
    runner: Arc<dyn Runner>,
    curriculum: Arc<dyn Curriculum>,
    progress: Arc<dyn ProgressTracker>,
    limits: RunLimits,
    gate: LessonGate,
    /// Verified passes whose progress update failed, keyed by submission
    pending: Mutex<PendingCompletions>,
}

impl Coordinator {
    pub fn new(
        normalizer: Normalizer,
        runner: Arc<dyn Runner>,
        curriculum: Arc<dyn Curriculum>,
        progress: Arc<dyn ProgressTracker>,
        limits: RunLimits,
    ) -> Self {
        Self {
            normalizer,
            runner,
            curriculum,
            progress,
            limits,
            gate: LessonGate::default(),
            pending: Mutex::new(PendingCompletions::new(PENDING_TTL, MAX_PENDING)),
        }
    }

    pub fn with_gate(mut self, gate: LessonGate) -> Self {
        self.gate = gate;
        self
    }

    /// Bound how long and how many failed progress updates stay retryable
    pub fn with_pending_limits(mut self, ttl: Duration, capacity: usize) -> Self {
        self.pending = Mutex::new(PendingCompletions::new(ttl, capacity));
        self
    }

    pub fn is_isolated(&self) -> bool {
        self.runner.is_isolated()
    }

    pub fn limits(&self) -> &RunLimits {
        &self.limits
    }

    /// Normalize and run; Err carries the terminal report for early exits
    async fn execute(
        &self,
        submission_id: Uuid,
        code: &str,
        stdin: &str,
        language: Option<&str>,
    ) -> Result<ExecutionResult, ExecutionReport> {
        let language = language.unwrap_or(DEFAULT_LANGUAGE);
        let program = match self.normalizer.prepare(submission_id, code, stdin, language) {
            Ok(program) => program,
            Err(e @ (NormalizeError::EmptySource | NormalizeError::UnsupportedLanguage(_))) => {
                info!("[{}] Rejected: {}", submission_id, e);
                return Err(ExecutionReport::rejected(submission_id, e.to_string()));
            }
            Err(e) => {
                error!("[{}] Failed to prepare submission: {}", submission_id, e);
                return Err(ExecutionReport::runner_error(submission_id, GENERIC_FAILURE));
            }
        };
        stage(submission_id, Stage::Normalized);

        let result = match self
            .runner
            .run(program, &self.limits)
            .instrument(info_span!("submission", id = %submission_id))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!("[{}] Runner fault: {}", submission_id, e);
                return Err(ExecutionReport::runner_error(submission_id, GENERIC_FAILURE));
            }
        };
        stage(submission_id, Stage::Executed);

        if result.timed_out {
            info!(
                "[{}] Timed out after {}ms",
                submission_id, result.duration_ms
            );
            return Err(ExecutionReport::from_execution(
                submission_id,
                Outcome::Timeout,
                &result,
                timeout_message(&self.limits),
            ));
        }

        Ok(result)
    }

    /// Run a submission for a lesson, verify it, and record progress on a pass
    pub async fn submit_code(&self, request: SubmitRequest) -> ExecutionReport {
        let submission_id = Uuid::new_v4();
        stage(submission_id, Stage::Received);

        let Some(code) = request.code else {
            return ExecutionReport::rejected(submission_id, NormalizeError::EmptySource.to_string());
        };
        let Some(lesson_id) = request.lesson_id else {
            return ExecutionReport::rejected(submission_id, "No lesson id provided");
        };
        let Some(user_id) = request.user_id.filter(|u| !u.trim().is_empty()) else {
            return ExecutionReport::rejected(submission_id, "No user id provided");
        };

        info!(
            "[{}] Submission from user {} for lesson {}",
            submission_id, user_id, lesson_id
        );

        let lesson = match self.curriculum.lesson(lesson_id).await {
            Ok(Some(lesson)) => lesson,
            Ok(None) => {
                return ExecutionReport::rejected(
                    submission_id,
                    format!("Lesson {} not found", lesson_id),
                )
                .with_status(404)
            }
            Err(e) => {
                error!("[{}] Curriculum lookup failed: {:#}", submission_id, e);
                return ExecutionReport::runner_error(
                    submission_id,
                    "Could not load the lesson. Please try again later.",
                );
            }
        };

        if self.gate != LessonGate::Open {
            if let Err(report) = self.check_access(submission_id, &user_id, lesson_id).await {
                return report;
            }
        }

        let stdin = request
            .stdin
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| lesson.default_stdin.clone());

        let result = match self
            .execute(submission_id, &code, &stdin, request.language.as_deref())
            .await
        {
            Ok(result) => result,
            Err(report) => return report,
        };

        let verification = match lesson.verifier().verify(&result, &stdin, &lesson.test_cases) {
            Ok(verification) => verification,
            Err(e) => {
                error!("[{}] Lesson {}: {}", submission_id, lesson_id, e);
                return ExecutionReport::from_execution(
                    submission_id,
                    Outcome::Failure,
                    &result,
                    "This lesson has no test cases configured yet.",
                );
            }
        };
        stage(submission_id, Stage::Verified);

        if !verification.passed {
            info!(
                "[{}] Lesson {} not passed (failed run: {})",
                submission_id, lesson_id, verification.failed_run
            );
            return ExecutionReport::from_execution(
                submission_id,
                Outcome::Failure,
                &result,
                verification.message,
            );
        }

        info!(
            "[{}] Lesson {} passed (case {:?})",
            submission_id, lesson_id, verification.matched_case_index
        );
        let report = ExecutionReport::from_execution(
            submission_id,
            Outcome::Success,
            &result,
            verification.message,
        )
        .with_matched_case(verification.matched_case_index)
        .with_next_lesson(lesson.next_lesson_id);

        match self.progress.record_completion(&user_id, lesson_id).await {
            Ok(()) => report.with_progress_recorded(true),
            Err(e) => {
                error!(
                    "[{}] Failed to record progress for user {} lesson {}: {:#}",
                    submission_id, user_id, lesson_id, e
                );
                self.pending.lock().await.insert(
                    submission_id,
                    PendingCompletion {
                        user_id,
                        lesson_id,
                        next_lesson_id: lesson.next_lesson_id,
                        recorded_at: Instant::now(),
                    },
                );
                ExecutionReport {
                    message: "All tests passed, but your progress could not be saved. Please retry saving your progress.".to_string(),
                    ..report
                }
            }
        }
    }

    async fn check_access(
        &self,
        submission_id: Uuid,
        user_id: &str,
        lesson_id: u32,
    ) -> Result<(), ExecutionReport> {
        let lookups = async {
            let first = self.curriculum.first_lesson_id().await?;
            let completed = self.progress.completed_lessons(user_id).await?;
            anyhow::Ok((first, completed))
        };
        let (first, completed) = match lookups.await {
            Ok(found) => found,
            Err(e) => {
                error!("[{}] Progress lookup failed: {:#}", submission_id, e);
                return Err(ExecutionReport::runner_error(
                    submission_id,
                    "Could not check lesson access. Please try again later.",
                ));
            }
        };

        if self.gate.is_accessible(lesson_id, first, &completed) {
            Ok(())
        } else {
            info!(
                "[{}] Lesson {} locked for user {} ({} gating)",
                submission_id, lesson_id, user_id, self.gate
            );
            Err(ExecutionReport::rejected(
                submission_id,
                format!(
                    "Lesson {} is locked. Complete the previous lessons first.",
                    lesson_id
                ),
            )
            .with_status(403))
        }
    }

    /// Run code without verification or progress side effects
    pub async fn run_code(&self, request: RunRequest) -> ExecutionReport {
        let submission_id = Uuid::new_v4();
        stage(submission_id, Stage::Received);

        let Some(code) = request.code else {
            return ExecutionReport::rejected(submission_id, NormalizeError::EmptySource.to_string());
        };
        let stdin = request.stdin.unwrap_or_default();

        let result = match self
            .execute(submission_id, &code, &stdin, request.language.as_deref())
            .await
        {
            Ok(result) => result,
            Err(report) => return report,
        };

        match Verifier::default().failed_run(&result) {
            None if result.is_success() => ExecutionReport::from_execution(
                submission_id,
                Outcome::Success,
                &result,
                "Program ran successfully.",
            ),
            None => ExecutionReport::from_execution(
                submission_id,
                Outcome::Failure,
                &result,
                "Program did not exit cleanly.",
            ),
            Some(message) => {
                ExecutionReport::from_execution(submission_id, Outcome::Failure, &result, message)
            }
        }
    }

    /// Record progress for a pass whose progress update previously failed
    pub async fn retry_progress(&self, request: ProgressRetryRequest) -> ExecutionReport {
        let Some(submission_id) = request.submission_id else {
            return ExecutionReport::rejected(Uuid::nil(), "No submission id provided");
        };

        let Some(pending) = self.pending.lock().await.get(&submission_id) else {
            return ExecutionReport::rejected(
                submission_id,
                "No pending progress update for this submission",
            )
            .with_status(404);
        };

        match self
            .progress
            .record_completion(&pending.user_id, pending.lesson_id)
            .await
        {
            Ok(()) => {
                self.pending.lock().await.remove(&submission_id);
                info!(
                    "[{}] Progress recorded on retry for user {} lesson {}",
                    submission_id, pending.user_id, pending.lesson_id
                );
                ExecutionReport::success(submission_id, "Progress saved.")
                    .with_next_lesson(pending.next_lesson_id)
                    .with_progress_recorded(true)
            }
            Err(e) => {
                warn!(
                    "[{}] Progress retry failed for user {}: {:#}",
                    submission_id, pending.user_id, e
                );
                ExecutionReport::runner_error(
                    submission_id,
                    "Your progress could not be saved. Please try again later.",
                )
            }
        }
    }
}
