//! Sandbox configuration
//!
//! Process-wide ceilings for untrusted programs. Per-run limits (time, memory,
//! output) live in [`crate::runner::RunLimits`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How strictly the runner confines the child (network, filesystem, process tree)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Process group and rlimits only (development only)
    None,
    /// Use private user, mount, pid and network namespaces when the host supports them
    #[default]
    BestEffort,
    /// Refuse to run programs without those namespaces
    Required,
}

impl FromStr for IsolationLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "best_effort" | "best-effort" => Ok(Self::BestEffort),
            "required" | "strict" => Ok(Self::Required),
            other => anyhow::bail!("Unknown isolation level: {}", other),
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IsolationLevel::None => "none",
            IsolationLevel::BestEffort => "best_effort",
            IsolationLevel::Required => "required",
        };
        write!(f, "{}", s)
    }
}

/// Sandbox configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Namespace isolation policy
    pub isolation: IsolationLevel,
    /// RLIMIT_NPROC for the child (default: 64)
    pub max_processes: u64,
    /// RLIMIT_NOFILE for the child (default: 64)
    pub max_open_files: u64,
    /// RLIMIT_FSIZE for the child in KB (default: 1024KB)
    pub max_file_size_kb: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::BestEffort,
            max_processes: 64,
            max_open_files: 64,
            max_file_size_kb: 1024,
        }
    }
}

impl SandboxConfig {
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }
}
