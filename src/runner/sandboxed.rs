//! Sandboxed runner implementation
//!
//! Executes untrusted user code in a fresh interpreter process with resource
//! limits and a private process group. When the host allows it, the process
//! also gets private namespaces: no network, a read-only filesystem apart from
//! its own directory, and a pid namespace that dies with the run.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ExecutionResult, RunLimits, Runner};
use crate::error::RunnerError;
use crate::normalizer::PreparedProgram;
use crate::sandbox::{
    harden_child, is_namespace_isolation_available, ChildLimits, IsolationLevel, NamespacePlan,
    ProcessGroupGuard, SandboxConfig,
};

/// PATH inside the sandbox
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long to wait for output pipes to close after the process group is gone
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Bytes captured from one output stream
#[derive(Debug, Default)]
struct CapturedStream {
    bytes: Vec<u8>,
    truncated: bool,
}

impl CapturedStream {
    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Runner that executes each submission in its own sandboxed process
pub struct SandboxedRunner {
    config: SandboxConfig,
    /// Resolved once at construction from the isolation level and a host check
    isolated: bool,
}

impl SandboxedRunner {
    /// Create a new sandboxed runner, probing namespace support as required by the config
    pub async fn new(config: SandboxConfig) -> Result<Self, RunnerError> {
        let isolated = match config.isolation {
            IsolationLevel::None => {
                warn!("Namespace isolation disabled; submissions share the host network and filesystem");
                false
            }
            IsolationLevel::BestEffort => {
                let available = is_namespace_isolation_available().await;
                if !available {
                    warn!("Namespaces unavailable; running submissions with process-group isolation only");
                }
                available
            }
            IsolationLevel::Required => {
                if !is_namespace_isolation_available().await {
                    return Err(RunnerError::IsolationUnavailable(
                        "unprivileged user, mount and pid namespaces are disabled".to_string(),
                    ));
                }
                true
            }
        };

        info!(
            "Sandboxed runner ready (isolation={}, namespaces={})",
            config.isolation, isolated
        );

        Ok(Self { config, isolated })
    }

    fn child_limits(&self, limits: &RunLimits) -> ChildLimits {
        let address_space_bytes = match limits.memory_mb {
            0 => None,
            mb => Some(u64::from(mb) * 1024 * 1024),
        };
        // CPU limit backs up the wall-clock timeout for CPU-bound programs.
        let cpu_secs = u64::from(limits.time_ms).div_ceil(1000) + 1;

        ChildLimits {
            address_space_bytes,
            cpu_secs,
            file_size_bytes: self.config.max_file_size_kb * 1024,
            processes: self.config.max_processes,
            open_files: self.config.max_open_files,
        }
    }

    /// Run a prepared program, then remove its directory whatever happened
    pub async fn execute(
        &self,
        program: PreparedProgram,
        limits: &RunLimits,
    ) -> Result<ExecutionResult, RunnerError> {
        let result = self.execute_in_place(&program, limits).await;

        let dir = program.into_dir();
        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => debug!("Removed submission directory {}", path.display()),
            Err(e) => warn!(
                "Failed to remove submission directory {}: {}",
                path.display(),
                e
            ),
        }

        result
    }

    async fn execute_in_place(
        &self,
        program: &PreparedProgram,
        limits: &RunLimits,
    ) -> Result<ExecutionResult, RunnerError> {
        let spec = program.command();
        if spec.program.is_empty() {
            return Err(RunnerError::EmptyCommand);
        }

        let work_dir = program.work_dir();
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(work_dir)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", work_dir)
            .env("TMPDIR", work_dir)
            .env("LANG", "C.UTF-8")
            .envs(spec.env_pairs())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child_limits = self.child_limits(limits);
        let plan = if self.isolated {
            Some(NamespacePlan::for_work_dir(work_dir)?)
        } else {
            None
        };
        // SAFETY: harden_child only issues raw syscalls and touches no shared state.
        unsafe {
            cmd.pre_exec(move || harden_child(&child_limits, plan.as_ref()));
        }

        debug!(
            "Spawning {:?} {:?} in {} (time limit {}ms)",
            spec.program,
            spec.args,
            work_dir.display(),
            limits.time_ms
        );

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                RunnerError::InterpreterMissing(spec.program.clone())
            } else {
                RunnerError::Spawn(e)
            }
        })?;
        let mut group = ProcessGroupGuard::new(child.id());

        // Feed stdin from its own task so a program that never reads cannot block us.
        let stdin_task = child.stdin.take().map(|mut pipe| {
            let input = program.stdin().to_vec();
            tokio::spawn(async move {
                if !input.is_empty() {
                    if let Err(e) = pipe.write_all(&input).await {
                        if e.kind() != io::ErrorKind::BrokenPipe {
                            debug!("Failed to write stdin: {}", e);
                        }
                    }
                }
                // Dropping the pipe delivers EOF.
            })
        });
        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe, limits.max_output_bytes)));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe, limits.max_output_bytes)));

        let deadline = started + Duration::from_millis(u64::from(limits.time_ms));
        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(status) => Some(status?),
            Err(_) => None,
        };

        // Leader is done or out of time: nothing in its group may outlive the call.
        group.kill();
        if status.is_none() {
            child.wait().await?;
        }
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(task) = stdin_task {
            task.abort();
        }
        let stdout = join_capture(stdout_task).await?;
        let stderr = join_capture(stderr_task).await?;
        group.release();

        let timed_out = status.is_none();
        if timed_out {
            info!(
                "Program timed out after {}ms (limit {}ms)",
                duration_ms, limits.time_ms
            );
        }

        Ok(ExecutionResult {
            output_truncated: stdout.truncated || stderr.truncated,
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            exit_code: status.and_then(|s| s.code()),
            signal: status.and_then(|s| s.signal()),
            timed_out,
            duration_ms,
        })
    }
}

/// Read a stream to EOF, keeping at most `limit` bytes and discarding the rest
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> io::Result<CapturedStream> {
    let mut captured = CapturedStream::default();
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&buf[..n.min(room)]);
    }

    Ok(captured)
}

async fn join_capture(
    task: Option<JoinHandle<io::Result<CapturedStream>>>,
) -> Result<CapturedStream, RunnerError> {
    let Some(mut task) = task else {
        return Ok(CapturedStream::default());
    };

    match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut task).await {
        Ok(Ok(captured)) => Ok(captured?),
        Ok(Err(e)) => Err(RunnerError::Io(io::Error::other(e))),
        Err(_) => {
            // A process that left the group still holds the pipe open.
            task.abort();
            warn!("Output pipe still open after process group teardown; discarding output");
            Ok(CapturedStream {
                bytes: Vec::new(),
                truncated: true,
            })
        }
    }
}

#[async_trait]
impl Runner for SandboxedRunner {
    async fn run(
        &self,
        program: PreparedProgram,
        limits: &RunLimits,
    ) -> Result<ExecutionResult, RunnerError> {
        self.execute(program, limits).await
    }

    fn is_isolated(&self) -> bool {
        self.isolated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::{LanguageConfig, LanguageRegistry};
    use crate::normalizer::Normalizer;
    use std::path::Path;
    use uuid::Uuid;

    fn shell_normalizer() -> Normalizer {
        let mut languages = LanguageRegistry::default();
        languages.insert("sh", LanguageConfig::new("main.sh", "sh main.sh"));
        languages.insert("missing", LanguageConfig::new("main.x", "dojo-no-such-interpreter main.x"));
        Normalizer::new(languages)
    }

    async fn runner() -> SandboxedRunner {
        SandboxedRunner::new(SandboxConfig::default()).await.unwrap()
    }

    fn prepare(source: &str, stdin: &str) -> PreparedProgram {
        shell_normalizer()
            .prepare(Uuid::new_v4(), source, stdin, "sh")
            .unwrap()
    }

    /// Live processes whose command line mentions `marker` (zombies have none)
    fn processes_with_marker(marker: &str) -> usize {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return 0;
        };
        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().bytes().all(|b| b.is_ascii_digit()))
            .filter(|entry| {
                std::fs::read(entry.path().join("cmdline"))
                    .map(|cmdline| String::from_utf8_lossy(&cmdline).contains(marker))
                    .unwrap_or(false)
            })
            .count()
    }

    async fn wait_until_gone(marker: &str) -> bool {
        for _ in 0..40 {
            if processes_with_marker(marker) == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// A background shell that prints "up" and then sleeps, tagged for lookup in /proc
    fn sleeper(marker: &str) -> String {
        format!("sh -c 'echo up; sleep 30; : {}'", marker)
    }

    #[tokio::test]
    async fn test_captures_stdout_stderr_and_exit_code() {
        let program = prepare("echo out; echo err >&2; exit 3", "");
        let result = runner().await.execute(program, &RunLimits::default()).await.unwrap();

        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.signal, None);
        assert!(!result.timed_out);
        assert!(!result.output_truncated);
    }

    #[tokio::test]
    async fn test_stdin_is_delivered_on_standard_input() {
        let program = prepare("read -r name; echo \"Hi $name\"", "Ada \"O'Brien\"\n");
        let result = runner().await.execute(program, &RunLimits::default()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.stdout, "Hi Ada \"O'Brien\"\n");
    }

    #[tokio::test]
    async fn test_program_that_ignores_stdin_still_finishes() {
        let input = "x".repeat(1024 * 1024);
        let program = prepare("echo done", &input);
        let result = runner().await.execute(program, &RunLimits::default()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.stdout, "done\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_process_tree() {
        let marker = Uuid::new_v4().simple().to_string();
        let program = prepare(&format!("{} &\nwhile :; do :; done", sleeper(&marker)), "");
        let dir = program.work_dir().to_path_buf();
        let limits = RunLimits::new(500, 0);

        let started = std::time::Instant::now();
        let result = runner().await.execute(program, &limits).await.unwrap();
        let elapsed = started.elapsed();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(!result.is_success());
        assert!(elapsed < Duration::from_millis(1500), "overshoot: {:?}", elapsed);
        assert!(!dir.exists());

        assert_eq!(result.stdout, "up\n");
        assert!(wait_until_gone(&marker).await, "background process survived");
    }

    #[tokio::test]
    async fn test_background_children_do_not_outlive_normal_exit() {
        let marker = Uuid::new_v4().simple().to_string();
        let program = prepare(&format!("{} &\nsleep 0.3", sleeper(&marker)), "");
        let result = runner().await.execute(program, &RunLimits::default()).await.unwrap();

        assert!(result.is_success());
        assert!(result.duration_ms < 5000);
        assert_eq!(result.stdout, "up\n");
        assert!(wait_until_gone(&marker).await);
    }

    #[tokio::test]
    async fn test_detached_descendant_dies_with_the_run() {
        let runner = runner().await;
        if !runner.is_isolated() {
            eprintln!("namespaces unavailable, skipping");
            return;
        }

        let marker = Uuid::new_v4().simple().to_string();
        let source = format!(
            "command -v setsid >/dev/null || exit 42\nsetsid {} &\nsleep 0.3",
            sleeper(&marker)
        );
        let result = runner.execute(prepare(&source, ""), &RunLimits::default()).await.unwrap();
        if result.exit_code == Some(42) {
            eprintln!("setsid not installed, skipping");
            return;
        }

        assert!(result.is_success(), "{:?}", result);
        assert!(!result.timed_out);
        assert_eq!(result.stdout, "up\n");
        assert!(wait_until_gone(&marker).await, "session leader escaped the run");
    }

    #[tokio::test]
    async fn test_writes_outside_work_dir_fail() {
        let runner = runner().await;
        if !runner.is_isolated() {
            eprintln!("namespaces unavailable, skipping");
            return;
        }

        let work_root = tempfile::tempdir().unwrap();
        let sibling = work_root.path().join("other-submission.py");
        std::fs::write(&sibling, "print('mine')\n").unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let target = elsewhere.path().join("notes.txt");
        std::fs::write(&target, "original\n").unwrap();

        let source = format!(
            "echo pwned > ../other-submission.py\n\
             echo pwned > '{}'\n\
             cat ../other-submission.py\n\
             echo kept > note.txt && cat note.txt",
            target.display()
        );
        let program = shell_normalizer()
            .with_work_root(work_root.path())
            .prepare(Uuid::new_v4(), &source, "", "sh")
            .unwrap();
        let result = runner.execute(program, &RunLimits::default()).await.unwrap();

        // Own directory is writable; the sibling is neither visible nor writable.
        assert_eq!(result.stdout, "kept\n");
        assert_eq!(std::fs::read_to_string(&sibling).unwrap(), "print('mine')\n");
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "original\n");
        assert!(!result.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let program = prepare("i=0; while [ $i -lt 2000 ]; do echo 0123456789; i=$((i+1)); done", "");
        let limits = RunLimits::default().with_max_output_bytes(100);
        let result = runner().await.execute(program, &limits).await.unwrap();

        assert!(result.is_success());
        assert!(result.output_truncated);
        assert_eq!(result.stdout.len(), 100);
    }

    #[tokio::test]
    async fn test_directory_removed_after_crash() {
        let program = prepare("kill -9 $$", "");
        let dir = program.work_dir().to_path_buf();
        let result = runner().await.execute(program, &RunLimits::default()).await.unwrap();

        assert_eq!(result.exit_code, None);
        assert_eq!(result.signal, Some(9));
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_runner_error() {
        let program = shell_normalizer()
            .prepare(Uuid::new_v4(), "anything", "", "missing")
            .unwrap();
        let dir = program.work_dir().to_path_buf();
        let err = runner().await.execute(program, &RunLimits::default()).await.unwrap_err();

        assert!(matches!(err, RunnerError::InterpreterMissing(name) if name == "dojo-no-such-interpreter"));
        assert!(!Path::new(&dir).exists());
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        let program = prepare("echo \"$PATH\"; echo \"$HOME\"; echo \"[$CARGO_MANIFEST_DIR]\"", "");
        let dir = program.work_dir().to_path_buf();
        let result = runner().await.execute(program, &RunLimits::default()).await.unwrap();

        let lines: Vec<&str> = result.stdout.lines().collect();
        assert_eq!(lines, vec![SANDBOX_PATH, dir.to_str().unwrap(), "[]"]);
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_independent() {
        let runner = std::sync::Arc::new(runner().await);
        let mut handles = Vec::new();
        for i in 0..8 {
            let runner = runner.clone();
            handles.push(tokio::spawn(async move {
                let program = prepare(&format!("read x; echo \"{} $x\"", i), &format!("in{}\n", i));
                runner.execute(program, &RunLimits::default()).await.unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap();
            assert_eq!(result.stdout, format!("{} in{}\n", i, i));
        }
    }
}
