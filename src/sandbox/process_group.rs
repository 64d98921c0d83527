//! Process group ownership for a running submission

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Owns the process group of one child and SIGKILLs it on [`kill`](Self::kill) or drop.
///
/// The child must have made itself a group leader before exec (see
/// [`harden_child`](super::harden_child)), so the group id equals its pid.
#[derive(Debug)]
pub struct ProcessGroupGuard {
    pgid: Option<Pid>,
}

impl ProcessGroupGuard {
    pub fn new(leader_pid: Option<u32>) -> Self {
        Self {
            pgid: leader_pid.and_then(|pid| i32::try_from(pid).ok()).map(Pid::from_raw),
        }
    }

    /// Kill every process left in the group.
    ///
    /// Returns true if at least one process received the signal.
    pub fn kill(&mut self) -> bool {
        let Some(pgid) = self.pgid else {
            return false;
        };

        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => {
                debug!("Killed process group {}", pgid);
                true
            }
            Err(Errno::ESRCH) => false,
            Err(e) => {
                warn!("Failed to kill process group {}: {}", pgid, e);
                false
            }
        }
    }

    /// Kill the group and stop tracking it
    pub fn release(mut self) -> bool {
        let killed = self.kill();
        self.pgid = None;
        killed
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{harden_child, ChildLimits};
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::process::Command;

    fn limits() -> ChildLimits {
        ChildLimits {
            address_space_bytes: None,
            cpu_secs: 30,
            file_size_bytes: 1024 * 1024,
            processes: 64,
            open_files: 64,
        }
    }

    #[test]
    fn test_guard_without_pid_is_noop() {
        let mut guard = ProcessGroupGuard::new(None);
        assert!(!guard.kill());
    }

    #[tokio::test]
    async fn test_kill_terminates_group() {
        let limits = limits();
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "sleep 30 & sleep 30; wait"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);
        unsafe {
            cmd.pre_exec(move || harden_child(&limits, None));
        }
        let mut child = cmd.spawn().unwrap();

        let mut guard = ProcessGroupGuard::new(child.id());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(guard.kill());

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child survived group kill")
            .unwrap();
        assert!(!status.success());
        guard.release();
    }
}
