//! Environment-driven configuration

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::progress::LessonGate;
use crate::runner::RunLimits;
use crate::sandbox::{IsolationLevel, SandboxConfig};

/// Everything the binary needs to start
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub bind_addr: String,
    pub limits: RunLimits,
    pub sandbox: SandboxConfig,
    /// Parent of per-submission directories (None = system temp dir)
    pub work_root: Option<PathBuf>,
    /// Interpreter registry override (None = embedded defaults)
    pub languages_config: Option<PathBuf>,
    pub curriculum_path: PathBuf,
    /// Progress goes to Redis when set, otherwise stays in memory
    pub redis_url: Option<String>,
    pub gating: LessonGate,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            limits: RunLimits::default(),
            sandbox: SandboxConfig::default(),
            work_root: None,
            languages_config: None,
            curriculum_path: PathBuf::from("./files/curriculum.json"),
            redis_url: None,
            gating: LessonGate::default(),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
    }
}

impl AppConfig {
    /// Read `DOJO_*` variables from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or empty keys keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = parse_var::<String>(&lookup, "DOJO_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(time_ms) = parse_var(&lookup, "DOJO_TIMEOUT_MS")? {
            config.limits.time_ms = time_ms;
        }
        if let Some(memory_mb) = parse_var(&lookup, "DOJO_MEMORY_LIMIT_MB")? {
            config.limits.memory_mb = memory_mb;
        }
        if let Some(max_output) = parse_var(&lookup, "DOJO_MAX_OUTPUT_BYTES")? {
            config.limits.max_output_bytes = max_output;
        }
        if let Some(processes) = parse_var(&lookup, "DOJO_MAX_PROCESSES")? {
            config.sandbox.max_processes = processes;
        }
        if let Some(file_size) = parse_var(&lookup, "DOJO_MAX_FILE_SIZE_KB")? {
            config.sandbox.max_file_size_kb = file_size;
        }
        if let Some(isolation) = parse_var::<IsolationLevel>(&lookup, "DOJO_ISOLATION")? {
            config.sandbox.isolation = isolation;
        }
        config.work_root = parse_var(&lookup, "DOJO_WORK_ROOT")?;
        config.languages_config = parse_var(&lookup, "DOJO_LANGUAGES_CONFIG")?;
        if let Some(path) = parse_var(&lookup, "DOJO_CURRICULUM_PATH")? {
            config.curriculum_path = path;
        }
        config.redis_url = parse_var(&lookup, "DOJO_REDIS_URL")?;
        if let Some(gating) = parse_var(&lookup, "DOJO_LESSON_GATING")? {
            config.gating = gating;
        }

        if config.limits.time_ms == 0 {
            anyhow::bail!("DOJO_TIMEOUT_MS must be greater than zero");
        }

        Ok(config)
    }
}
