//! Error types for the execution pipeline

use thiserror::Error;

/// Errors raised while preparing a submission for execution
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("No code provided")]
    EmptySource,
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Failed to prepare submission directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Infrastructure failures while running a program
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Interpreter not found: {0}")]
    InterpreterMissing(String),
    #[error("Empty run command")]
    EmptyCommand,
    #[error("Failed to spawn program: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("I/O error while running program: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sandbox isolation unavailable: {0}")]
    IsolationUnavailable(String),
}

/// Verifier configuration errors
#[derive(Debug, Error, PartialEq)]
pub enum VerifyError {
    #[error("Lesson has no test cases configured")]
    NoTestCases,
}
