//! Interpreter configuration for submitted programs

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Language used when a submission does not name one
pub const DEFAULT_LANGUAGE: &str = "python";

/// Configuration for a supported interpreter
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageConfig {
    /// Name of the source file written into the submission directory (e.g., "main.py")
    pub source_file: String,
    /// Run command; the first element is the interpreter
    pub run_command: Vec<String>,
    /// Extra environment variables (KEY=VALUE) for the child process
    pub env: Vec<String>,
}

impl LanguageConfig {
    pub fn new(source_file: impl Into<String>, run_command: &str) -> Self {
        Self {
            source_file: source_file.into(),
            run_command: into_command(run_command),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(Into::into).collect();
        self
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    run_command: String,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Lookup table of interpreters keyed by lowercase name and alias
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: HashMap<String, LanguageConfig>,
}

impl LanguageRegistry {
    /// Registry built from the `files/languages.toml` shipped with the binary
    pub fn embedded() -> anyhow::Result<Self> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        Self::from_toml_str(content)
    }

    /// Load a registry from a TOML file on disk
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read language config {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> =
            toml::from_str(content).context("Invalid language configuration")?;

        let mut registry = Self::default();
        for (name, raw) in raw_configs {
            let run_command = into_command(&raw.run_command);
            if run_command.is_empty() {
                anyhow::bail!("Empty run_command for language {}", name);
            }
            for key in [&raw.source_file, &name] {
                if key.trim().is_empty() {
                    anyhow::bail!("Invalid language entry {:?}", name);
                }
            }

            let config = LanguageConfig {
                source_file: raw.source_file,
                run_command,
                env: raw.env,
            };

            for alias in raw.aliases {
                registry.insert(&alias, config.clone());
            }
            registry.insert(&name, config);
        }

        Ok(registry)
    }

    /// Register (or replace) a language under the given name
    pub fn insert(&mut self, name: &str, config: LanguageConfig) {
        self.languages.insert(name.to_lowercase(), config);
    }

    /// Get language configuration by language name or alias
    pub fn get(&self, language: &str) -> Option<&LanguageConfig> {
        self.languages.get(&language.to_lowercase())
    }

    /// All registered names and aliases, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.languages.keys().cloned().collect();
        names.sort();
        names
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
