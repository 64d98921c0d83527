//! Output verifier
//!
//! Decides pass/fail for one [`ExecutionResult`] against a lesson's ordered
//! test cases. One comparison rule for every caller:
//!
//! - `Exact`: equal after removing exactly one trailing newline from each side
//! - `Contains`: the expected text (same normalization) occurs in the output
//!
//! Leading and internal whitespace is always significant. Cases are tried in
//! declared order and the first match wins.

use serde::{Deserialize, Serialize};

use crate::error::VerifyError;
use crate::runner::ExecutionResult;

/// Longest slice of program output echoed back in a mismatch message
const MAX_ACTUAL_IN_MESSAGE: usize = 200;

/// How expected output is compared with program output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    #[default]
    Exact,
    Contains,
}

impl std::fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchPolicy::Exact => write!(f, "exact"),
            MatchPolicy::Contains => write!(f, "contains"),
        }
    }
}

/// One expected-output specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    /// When set, the case only applies to runs fed this stdin
    #[serde(default)]
    pub input: Option<String>,
    pub expected_output: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl TestCase {
    pub fn new(expected_output: impl Into<String>) -> Self {
        Self {
            input: None,
            expected_output: expected_output.into(),
            description: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether this case is relevant for a run fed `stdin`
    pub fn applies_to(&self, stdin: &str) -> bool {
        match &self.input {
            None => true,
            Some(input) => strip_trailing_newline(input) == strip_trailing_newline(stdin),
        }
    }
}

/// Result of verification; the only thing that decides whether progress advances
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationOutcome {
    pub passed: bool,
    pub matched_case_index: Option<usize>,
    pub message: String,
    /// The program itself failed (crash, error exit) before output could count
    pub failed_run: bool,
}

impl VerificationOutcome {
    fn pass(index: usize) -> Self {
        Self {
            passed: true,
            matched_case_index: Some(index),
            message: "All tests passed!".to_string(),
            failed_run: false,
        }
    }

    fn fail(message: String) -> Self {
        Self {
            passed: false,
            matched_case_index: None,
            message,
            failed_run: false,
        }
    }

    fn run_failed(message: String) -> Self {
        Self {
            failed_run: true,
            ..Self::fail(message)
        }
    }
}

/// Remove exactly one trailing `\n`; nothing else is trimmed
pub fn strip_trailing_newline(s: &str) -> &str {
    s.strip_suffix('\n').unwrap_or(s)
}

fn truncate_for_message(s: &str) -> String {
    match s.char_indices().nth(MAX_ACTUAL_IN_MESSAGE) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}

/// Stateless comparison of program output with expected output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verifier {
    policy: MatchPolicy,
    match_stderr: bool,
}

impl Verifier {
    pub fn new(policy: MatchPolicy) -> Self {
        Self {
            policy,
            match_stderr: false,
        }
    }

    /// Compare against stdout followed by stderr, and accept error exits
    pub fn with_match_stderr(mut self, match_stderr: bool) -> Self {
        self.match_stderr = match_stderr;
        self
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Message describing why the run itself failed, if it did
    pub fn failed_run(&self, result: &ExecutionResult) -> Option<String> {
        if result.timed_out {
            return Some("Your program did not finish in time.".to_string());
        }
        if self.match_stderr {
            return None;
        }

        match (result.exit_code, result.signal) {
            (Some(0), _) => {}
            (Some(code), _) => return Some(format!("Your program exited with an error (exit code {}).", code)),
            (None, Some(signal)) => return Some(format!("Your program was terminated by signal {}.", signal)),
            (None, None) => return Some("Your program was terminated.".to_string()),
        }

        if result.stdout.is_empty() && !result.stderr.is_empty() {
            return Some("Your program produced error output and no regular output.".to_string());
        }

        None
    }

    fn matches(&self, actual: &str, expected: &str) -> bool {
        let expected = strip_trailing_newline(expected);
        match self.policy {
            MatchPolicy::Exact => strip_trailing_newline(actual) == expected,
            MatchPolicy::Contains => actual.contains(expected),
        }
    }

    fn mismatch_message(&self, case: &TestCase, actual: &str) -> String {
        let expected = strip_trailing_newline(&case.expected_output);
        let actual = truncate_for_message(strip_trailing_newline(actual));
        let detail = match self.policy {
            MatchPolicy::Exact => format!("Expected {:?} but got {:?}", expected, actual),
            MatchPolicy::Contains => {
                format!("Expected output to contain {:?} but got {:?}", expected, actual)
            }
        };
        match &case.description {
            Some(description) => format!("{}: {}", description, detail),
            None => detail,
        }
    }

    /// Verify one run fed `stdin` against `cases`, in order.
    ///
    /// An empty case list is a configuration error, never an implicit pass.
    pub fn verify(
        &self,
        result: &ExecutionResult,
        stdin: &str,
        cases: &[TestCase],
    ) -> Result<VerificationOutcome, VerifyError> {
        if cases.is_empty() {
            return Err(VerifyError::NoTestCases);
        }

        if let Some(message) = self.failed_run(result) {
            return Ok(VerificationOutcome::run_failed(message));
        }

        let target = if self.match_stderr {
            format!("{}{}", result.stdout, result.stderr)
        } else {
            result.stdout.clone()
        };

        let mut first_mismatch = None;
        for (index, case) in cases.iter().enumerate() {
            if !case.applies_to(stdin) {
                continue;
            }
            if self.matches(&target, &case.expected_output) {
                return Ok(VerificationOutcome::pass(index));
            }
            first_mismatch.get_or_insert(case);
        }

        Ok(VerificationOutcome::fail(match first_mismatch {
            Some(case) => self.mismatch_message(case, &target),
            None => "No test case applies to the provided input.".to_string(),
        }))
    }
}
