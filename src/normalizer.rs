//! Source normalizer
//!
//! Turns submitted source text and stdin into a [`PreparedProgram`]: a private
//! directory holding the source file, the interpreter command, and the stdin
//! bytes. Input is never spliced into the program text; it is delivered on the
//! child's standard input by the runner.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;
use uuid::Uuid;

use crate::error::NormalizeError;
use crate::languages::LanguageRegistry;
use crate::runner::CommandSpec;

/// A submission ready to run. Dropping it removes its directory.
#[derive(Debug)]
pub struct PreparedProgram {
    dir: TempDir,
    source_path: PathBuf,
    command: CommandSpec,
    stdin: Vec<u8>,
}

impl PreparedProgram {
    /// Directory that holds the source file; also the child's working directory
    pub fn work_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    pub fn stdin(&self) -> &[u8] {
        &self.stdin
    }

    /// Give up ownership of the directory, e.g. to close it explicitly
    pub fn into_dir(self) -> TempDir {
        self.dir
    }
}

/// Builds [`PreparedProgram`]s; holds no per-submission state
#[derive(Debug, Clone)]
pub struct Normalizer {
    languages: LanguageRegistry,
    work_root: Option<PathBuf>,
}

impl Normalizer {
    pub fn new(languages: LanguageRegistry) -> Self {
        Self {
            languages,
            work_root: None,
        }
    }

    /// Create submission directories under `root` instead of the system temp dir
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    pub fn languages(&self) -> &LanguageRegistry {
        &self.languages
    }

    /// Write the source into a fresh, uniquely named directory
    pub fn prepare(
        &self,
        submission_id: Uuid,
        source_code: &str,
        stdin: &str,
        language: &str,
    ) -> Result<PreparedProgram, NormalizeError> {
        if source_code.trim().is_empty() {
            return Err(NormalizeError::EmptySource);
        }

        let lang_config = self
            .languages
            .get(language)
            .ok_or_else(|| NormalizeError::UnsupportedLanguage(language.to_string()))?;

        let prefix = format!("dojo-{}-", submission_id.simple());
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.work_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };

        let source_path = dir.path().join(&lang_config.source_file);
        std::fs::write(&source_path, source_code)?;

        let command = CommandSpec::from_vec(&lang_config.run_command)
            .with_env(lang_config.env.iter().cloned());

        debug!(
            "Prepared submission {} in {} ({} bytes of stdin)",
            submission_id,
            dir.path().display(),
            stdin.len()
        );

        Ok(PreparedProgram {
            dir,
            source_path,
            command,
            stdin: stdin.as_bytes().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::LanguageConfig;

    fn normalizer(root: &Path) -> Normalizer {
        let mut languages = LanguageRegistry::default();
        languages.insert(
            "python",
            LanguageConfig::new("main.py", "python3 -I main.py").with_env(["PYTHONIOENCODING=utf-8"]),
        );
        Normalizer::new(languages).with_work_root(root)
    }

    #[test]
    fn test_rejects_empty_source() {
        let root = tempfile::tempdir().unwrap();
        let normalizer = normalizer(root.path());

        for source in ["", "   \n\t"] {
            let err = normalizer
                .prepare(Uuid::new_v4(), source, "", "python")
                .unwrap_err();
            assert!(matches!(err, NormalizeError::EmptySource));
        }
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_rejects_unknown_language() {
        let root = tempfile::tempdir().unwrap();
        let err = normalizer(root.path())
            .prepare(Uuid::new_v4(), "puts 1", "", "ruby")
            .unwrap_err();
        assert!(matches!(err, NormalizeError::UnsupportedLanguage(lang) if lang == "ruby"));
    }

    #[test]
    fn test_source_is_written_verbatim_and_stdin_kept_apart() {
        let root = tempfile::tempdir().unwrap();
        let source = "name = input()\nprint(\"Hi \" + name + '\\\\')\n";
        let program = normalizer(root.path())
            .prepare(Uuid::new_v4(), source, "Ada \"quoted\"\n", "python")
            .unwrap();

        assert_eq!(std::fs::read_to_string(program.source_path()).unwrap(), source);
        assert_eq!(program.stdin(), b"Ada \"quoted\"\n");
        assert_eq!(program.command().program, "python3");
        assert_eq!(program.command().args, vec!["-I", "main.py"]);
        assert!(program.work_dir().starts_with(root.path()));
    }

    #[test]
    fn test_concurrent_submissions_get_distinct_dirs() {
        let root = tempfile::tempdir().unwrap();
        let normalizer = normalizer(root.path());

        let a = normalizer
            .prepare(Uuid::new_v4(), "print(1)", "", "python")
            .unwrap();
        let b = normalizer
            .prepare(Uuid::new_v4(), "print(2)", "", "python")
            .unwrap();
        assert_ne!(a.work_dir(), b.work_dir());
        assert_eq!(std::fs::read_to_string(a.source_path()).unwrap(), "print(1)");
        assert_eq!(std::fs::read_to_string(b.source_path()).unwrap(), "print(2)");
    }

    #[test]
    fn test_dropping_program_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let program = normalizer(root.path())
            .prepare(Uuid::new_v4(), "print(1)", "", "python")
            .unwrap();
        let dir = program.work_dir().to_path_buf();
        assert!(dir.exists());
        drop(program);
        assert!(!dir.exists());
    }
}
