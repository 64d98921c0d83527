//! Runner module - Execution abstraction layer
//!
//! This module provides a unified interface for running submitted programs:
//! - `Runner`: async trait the coordinator calls, one call per submission
//! - `SandboxedRunner`: fresh interpreter process under the sandbox hardening
//!
//! The runner module does NOT:
//! - Compare outputs or decide pass/fail
//! - Know about lessons or progress
//! - Retry failed runs

pub mod sandboxed;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::RunnerError;
use crate::normalizer::PreparedProgram;

/// Command specification for execution
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Environment variables (key=value)
    pub env: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(|e| e.into()).collect();
        self
    }

    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String]) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self::new(program).with_args(iter.cloned())
    }

    /// Environment entries split into (key, value) pairs; malformed entries are skipped
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|entry| entry.split_once('='))
    }
}

/// Resource limits for one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunLimits {
    /// Wall-clock time limit in milliseconds
    pub time_ms: u32,
    /// Address space limit in MB (0 = unlimited)
    pub memory_mb: u32,
    /// Maximum bytes captured per output stream
    pub max_output_bytes: usize,
}

impl RunLimits {
    pub fn new(time_ms: u32, memory_mb: u32) -> Self {
        Self {
            time_ms,
            memory_mb,
            ..Self::default()
        }
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            time_ms: 5000,
            memory_mb: 256,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// Outcome of running one program (raw, no pass/fail interpretation)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// Stdout content (lossy UTF-8)
    pub stdout: String,
    /// Stderr content (lossy UTF-8)
    pub stderr: String,
    /// Exit code; None when timed out or killed by a signal
    pub exit_code: Option<i32>,
    /// Signal that terminated the program, if any
    pub signal: Option<i32>,
    /// Wall-clock limit was hit and the process group was killed
    pub timed_out: bool,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// At least one stream exceeded the capture cap
    pub output_truncated: bool,
}

impl ExecutionResult {
    /// Exited on its own with status 0
    pub fn is_success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runner trait for executing prepared submissions
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a prepared program. The runner takes ownership of the program's
    /// temporary directory and removes it before returning.
    async fn run(
        &self,
        program: PreparedProgram,
        limits: &RunLimits,
    ) -> Result<ExecutionResult, RunnerError>;

    /// Whether children run in private namespaces (network, mounts, pids)
    fn is_isolated(&self) -> bool {
        false
    }
}

// Re-exports
pub use sandboxed::SandboxedRunner;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_from_vec() {
        let cmd = CommandSpec::from_vec(&[
            "python3".to_string(),
            "-I".to_string(),
            "main.py".to_string(),
        ]);
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args, vec!["-I", "main.py"]);

        let empty = CommandSpec::from_vec(&[]);
        assert!(empty.program.is_empty());
    }

    #[test]
    fn test_env_pairs_skip_malformed() {
        let cmd = CommandSpec::new("sh").with_env(["A=1", "broken", "B=x=y"]);
        let pairs: Vec<_> = cmd.env_pairs().collect();
        assert_eq!(pairs, vec![("A", "1"), ("B", "x=y")]);
    }

    #[test]
    fn test_execution_result_success() {
        let ok = ExecutionResult {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.is_success());

        let timed_out = ExecutionResult {
            timed_out: true,
            ..Default::default()
        };
        assert!(!timed_out.is_success());
    }
}
