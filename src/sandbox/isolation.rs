//! Child hardening applied between fork and exec
//!
//! Everything in [`harden_child`] runs in the forked child, so it sticks to raw
//! syscalls: no locks, no logging, no allocation after the fork. Paths and id
//! maps are prepared in the parent as a [`NamespacePlan`].
//!
//! With namespaces, the spawned process never execs. It unshares user, mount,
//! pid and network namespaces, seals the filesystem, then forks twice:
//!
//! ```text
//! spawned child (host pid ns)   relays the program's exit status as its own
//!   └─ init (pid 1)             reaps orphans; its exit kills the namespace
//!        └─ program             returns from the hook and execs the interpreter
//! ```
//!
//! A descendant that calls `setsid()` leaves the process group but not the pid
//! namespace, so it dies with init.

use std::ffi::{CStr, CString, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use anyhow::Result;
use nix::errno::Errno;
use nix::libc;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::prctl;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{raise, signal, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::sys::statvfs::{statvfs, FsFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, fork, getgid, getuid, mkdir, setpgid, ForkResult, Pid};
use tokio::process::Command;
use tracing::{debug, info};

/// Cached namespace sandbox availability
static NAMESPACES_AVAILABLE: OnceLock<bool> = OnceLock::new();

/// `None` for the optional string arguments of mount(2)
const NONE: Option<&'static str> = None;

/// Id seen inside the namespace when the server itself runs as root
const UNPRIVILEGED_ID: u32 = 65534;

/// Status record sent from init to the spawned child: [kind, value]
const STATUS_EXITED: u8 = 0;
const STATUS_SIGNALED: u8 = 1;

/// Exit code when the namespace could not be set up after the first fork
const SETUP_FAILED: i32 = 127;

/// Highest descriptor closed by hand when close_range(2) is missing
const FALLBACK_FD_CEILING: libc::c_uint = 4096;

/// Resource ceilings for one child process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildLimits {
    /// RLIMIT_AS in bytes (None = inherit)
    pub address_space_bytes: Option<u64>,
    /// RLIMIT_CPU soft limit in seconds; the hard limit is one second above
    pub cpu_secs: u64,
    /// RLIMIT_FSIZE in bytes
    pub file_size_bytes: u64,
    /// RLIMIT_NPROC
    pub processes: u64,
    /// RLIMIT_NOFILE
    pub open_files: u64,
}

/// Everything a namespaced child needs, built in the parent before the fork
#[derive(Debug, Clone)]
pub struct NamespacePlan {
    /// Submission directory; stays writable
    work_dir: CString,
    /// Its parent; covered by an empty read-only tmpfs so siblings are invisible
    work_root: CString,
    /// Host mount points remounted read-only
    read_only: Vec<CString>,
    uid_map: String,
    gid_map: String,
}

impl NamespacePlan {
    /// Plan for a child whose working directory is `work_dir`
    pub fn for_work_dir(work_dir: &Path) -> io::Result<Self> {
        let work_dir = work_dir.canonicalize()?;
        let work_root = work_dir
            .parent()
            .filter(|parent| *parent != Path::new("/"))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} cannot be a submission directory", work_dir.display()),
                )
            })?;

        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
        let read_only = mount_points(&mountinfo)
            .iter()
            .map(|path| to_cstring(path))
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            work_root: to_cstring(work_root)?,
            work_dir: to_cstring(&work_dir)?,
            read_only,
            uid_map: id_map(getuid().as_raw()),
            gid_map: id_map(getgid().as_raw()),
        })
    }

    pub fn work_dir(&self) -> &CStr {
        &self.work_dir
    }

    pub fn read_only_mounts(&self) -> &[CString] {
        &self.read_only
    }
}

/// Single-id map; root outside becomes an unprivileged id inside so exec drops
/// the namespace capabilities
fn id_map(outside: u32) -> String {
    let inside = if outside == 0 { UNPRIVILEGED_ID } else { outside };
    format!("{} {} 1", inside, outside)
}

fn to_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Mount points listed in mountinfo, minus the kernel's /proc and /sys trees
fn mount_points(mountinfo: &str) -> Vec<PathBuf> {
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(unescape_mount_path)
        .filter(|path| !path.starts_with("/proc") && !path.starts_with("/sys"))
        .collect()
}

/// Undo mountinfo's octal escapes (`\040` for a space, and so on)
fn unescape_mount_path(raw: &str) -> PathBuf {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let escaped = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(byte) = escaped {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(OsString::from_vec(out))
}

/// Lower a limit, never raising it above the inherited hard limit
fn lower_limit(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let (_, current_hard) = getrlimit(resource).map_err(io::Error::from)?;
    let current_hard = current_hard as u64;
    let hard = hard.min(current_hard);
    let soft = soft.min(hard);
    setrlimit(resource, soft as _, hard as _).map_err(io::Error::from)
}

fn apply_limits(limits: &ChildLimits) -> io::Result<()> {
    lower_limit(Resource::RLIMIT_CORE, 0, 0)?;
    lower_limit(Resource::RLIMIT_CPU, limits.cpu_secs, limits.cpu_secs + 1)?;
    lower_limit(
        Resource::RLIMIT_FSIZE,
        limits.file_size_bytes,
        limits.file_size_bytes,
    )?;
    lower_limit(Resource::RLIMIT_NOFILE, limits.open_files, limits.open_files)?;
    lower_limit(Resource::RLIMIT_NPROC, limits.processes, limits.processes)?;
    if let Some(bytes) = limits.address_space_bytes {
        lower_limit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    Ok(())
}

/// Pre-exec hook for untrusted children.
///
/// Order: own process group first (so teardown can reach everything the child
/// spawns), then namespaces and the sealed filesystem, then rlimits in the
/// process that actually execs. With a plan, the current directory must be
/// the submission directory when the hook runs.
pub fn harden_child(limits: &ChildLimits, namespaces: Option<&NamespacePlan>) -> io::Result<()> {
    setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(io::Error::from)?;

    if let Some(plan) = namespaces {
        enter_namespaces(plan)?;
        mount_proc()?;
    }

    apply_limits(limits)
}

/// Returns only in the program process; the two processes above it never do
fn enter_namespaces(plan: &NamespacePlan) -> io::Result<()> {
    unshare(
        CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNET,
    )
    .map_err(io::Error::from)?;
    write_id_maps(plan)?;
    seal_filesystem(plan).map_err(io::Error::from)?;

    // The runtime's SIGCHLD handler must not run in these copies.
    // SAFETY: resetting a disposition to the default is async-signal-safe.
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) }.map_err(io::Error::from)?;

    let pipe = StatusPipe::new()?;
    // SAFETY: the child only issues raw syscalls before exec or _exit.
    match unsafe { fork() }.map_err(io::Error::from)? {
        ForkResult::Parent { child } => relay_status(child, pipe),
        ForkResult::Child => {}
    }

    // Now pid 1 of the new namespace.
    let _ = prctl::set_pdeathsig(Signal::SIGKILL);
    // SAFETY: as above.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => run_init(child, pipe),
        Ok(ForkResult::Child) => Ok(()),
        Err(_) => exit_now(SETUP_FAILED),
    }
}

fn write_id_maps(plan: &NamespacePlan) -> io::Result<()> {
    std::fs::write("/proc/self/setgroups", "deny")?;
    std::fs::write("/proc/self/gid_map", &plan.gid_map)?;
    std::fs::write("/proc/self/uid_map", &plan.uid_map)
}

/// Hide sibling submissions, bind the submission directory back writable and
/// remount every other mount read-only.
fn seal_filesystem(plan: &NamespacePlan) -> nix::Result<()> {
    mount(NONE, "/", NONE, MsFlags::MS_REC | MsFlags::MS_PRIVATE, NONE)?;

    let overlay = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    mount(
        Some("tmpfs"),
        plan.work_root.as_c_str(),
        Some("tmpfs"),
        overlay,
        Some("mode=0755,size=16k"),
    )?;
    mkdir(plan.work_dir.as_c_str(), Mode::S_IRWXU)?;
    // "." is still the real submission directory underneath the overlay.
    mount(
        Some("."),
        plan.work_dir.as_c_str(),
        NONE,
        MsFlags::MS_BIND,
        NONE,
    )?;

    for path in &plan.read_only {
        match remount_read_only(path) {
            // Unreachable from here, so unreachable for the program too.
            Ok(()) | Err(Errno::ENOENT) | Err(Errno::EACCES) => {}
            Err(e) => return Err(e),
        }
    }
    mount(
        NONE,
        plan.work_root.as_c_str(),
        NONE,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY | overlay,
        NONE,
    )?;

    chdir(plan.work_dir.as_c_str())
}

/// Bind-remount read-only, restating the flags the kernel locks in a user namespace
fn remount_read_only(path: &CStr) -> nix::Result<()> {
    let current = statvfs(path)?.flags();
    let mut flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY;
    for (statfs_flag, mount_flag) in [
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ] {
        if current.contains(statfs_flag) {
            flags |= mount_flag;
        }
    }
    if !current.intersects(FsFlags::ST_NOATIME | FsFlags::ST_RELATIME) {
        flags |= MsFlags::MS_STRICTATIME;
    }
    mount(NONE, path, NONE, flags, NONE)
}

/// Give the program a /proc for its own pid namespace, or none at all
fn mount_proc() -> io::Result<()> {
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    if mount(Some("proc"), "/proc", Some("proc"), flags, NONE).is_ok() {
        return Ok(());
    }
    // Hosts that mask parts of /proc refuse a fresh instance.
    mount(
        Some("tmpfs"),
        "/proc",
        Some("tmpfs"),
        flags | MsFlags::MS_RDONLY,
        NONE,
    )
    .map_err(io::Error::from)
}

/// Pipe carrying the program's fate from init to the spawned child
#[derive(Debug, Clone, Copy)]
struct StatusPipe {
    read: RawFd,
    write: RawFd,
}

impl StatusPipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds has room for the two descriptors pipe2 writes.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read: fds[0],
            write: fds[1],
        })
    }
}

/// pid 1: reap everything until the program itself is done, report, then exit
fn run_init(program: Pid, pipe: StatusPipe) -> ! {
    close_all_except(pipe.write);

    let record = loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, code)) if pid == program => {
                break [STATUS_EXITED, code as u8];
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) if pid == program => {
                break [STATUS_SIGNALED, sig as i32 as u8];
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => break [STATUS_SIGNALED, Signal::SIGKILL as i32 as u8],
        }
    };

    // SAFETY: writes two bytes from a live stack buffer.
    unsafe {
        libc::write(pipe.write, record.as_ptr().cast(), record.len());
    }
    // Exiting as pid 1 takes every remaining process in the namespace with it.
    exit_now(0)
}

/// Spawned child: wait for init, then exit the way the program did
fn relay_status(init: Pid, pipe: StatusPipe) -> ! {
    close_all_except(pipe.read);

    let mut record = [0u8; 2];
    let mut filled = 0;
    while filled < record.len() {
        // SAFETY: reads into the unfilled tail of a live stack buffer.
        let n = unsafe {
            libc::read(
                pipe.read,
                record[filled..].as_mut_ptr().cast(),
                record.len() - filled,
            )
        };
        if n > 0 {
            filled += n as usize;
        } else if n < 0 && Errno::last() == Errno::EINTR {
            continue;
        } else {
            break;
        }
    }

    // init is gone once this returns, and so is everything it outlived.
    let init_status = loop {
        match waitpid(init, None) {
            Err(Errno::EINTR) => continue,
            other => break other,
        }
    };

    match (filled, record[0]) {
        (2, STATUS_EXITED) => exit_now(i32::from(record[1])),
        (2, STATUS_SIGNALED) => die_by_signal(i32::from(record[1])),
        _ => match init_status {
            Ok(WaitStatus::Signaled(_, sig, _)) => die_by_signal(sig as i32),
            Ok(WaitStatus::Exited(_, code)) => exit_now(code),
            _ => exit_now(SETUP_FAILED),
        },
    }
}

/// Close every descriptor but `keep`, the spawner's exec-error pipe included
fn close_all_except(keep: RawFd) {
    let keep = keep as libc::c_uint;
    if keep > 0 {
        close_range(0, keep - 1);
    }
    close_range(keep + 1, libc::c_uint::MAX);
}

fn close_range(first: libc::c_uint, last: libc::c_uint) {
    // SAFETY: close_range only closes descriptors of this process.
    let closed = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0 as libc::c_uint) };
    if closed != 0 {
        // Kernels before 5.9
        for fd in first..=last.min(FALLBACK_FD_CEILING) {
            // SAFETY: as above.
            unsafe {
                libc::close(fd as libc::c_int);
            }
        }
    }
}

fn die_by_signal(signo: i32) -> ! {
    if let Ok(sig) = Signal::try_from(signo) {
        // SAFETY: restoring the default disposition is async-signal-safe.
        let _ = unsafe { signal(sig, SigHandler::SigDfl) };
        let _ = raise(sig);
    }
    exit_now(128 + signo)
}

fn exit_now(code: i32) -> ! {
    // SAFETY: _exit skips atexit handlers copied from the parent.
    unsafe { libc::_exit(code) }
}

/// Limits for the availability check
const CHECK_LIMITS: ChildLimits = ChildLimits {
    address_space_bytes: None,
    cpu_secs: 5,
    file_size_bytes: 1024 * 1024,
    processes: 64,
    open_files: 64,
};

/// Run a trivial program through the full namespace sandbox
async fn check_namespaces() -> io::Result<()> {
    let dir = tempfile::Builder::new().prefix("dojo-check-").tempdir()?;
    let plan = NamespacePlan::for_work_dir(dir.path())?;

    let mut check = Command::new("/bin/sh");
    check
        .args(["-c", "echo ok > marker"])
        .current_dir(dir.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    // SAFETY: harden_child only issues raw syscalls.
    unsafe {
        check.pre_exec(move || harden_child(&CHECK_LIMITS, Some(&plan)));
    }

    let status = check.status().await?;
    if !status.success() {
        return Err(io::Error::other(format!("check exited with {}", status)));
    }
    // The write must land in the real directory through the bind mount.
    match std::fs::read_to_string(dir.path().join("marker"))?.trim() {
        "ok" => Ok(()),
        other => Err(io::Error::other(format!("unexpected check output {:?}", other))),
    }
}

/// Check whether user, mount, pid and network namespaces work on this host
pub async fn is_namespace_isolation_available() -> bool {
    if let Some(value) = NAMESPACES_AVAILABLE.get() {
        return *value;
    }

    let available = match check_namespaces().await {
        Ok(()) => true,
        Err(e) => {
            debug!("Namespace sandbox check failed: {}", e);
            false
        }
    };

    info!("Namespace isolation available: {}", available);
    let _ = NAMESPACES_AVAILABLE.set(available);
    available
}

/// Ensure namespace isolation is available; return an error otherwise
pub async fn ensure_namespace_isolation_available() -> Result<()> {
    if is_namespace_isolation_available().await {
        Ok(())
    } else {
        anyhow::bail!("Isolation is required but unprivileged user, mount and pid namespaces are not available. Enable kernel.unprivileged_userns_clone or run with DOJO_ISOLATION=best_effort.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_availability_is_cached() {
        let first = is_namespace_isolation_available().await;
        let second = is_namespace_isolation_available().await;
        assert_eq!(first, second);
        assert_eq!(NAMESPACES_AVAILABLE.get(), Some(&first));
    }

    #[tokio::test]
    async fn test_hardened_child_runs_in_own_group() {
        let mut cmd = Command::new("/bin/sh");
        // Prints "<pid> <pgid>"; both must match for a group leader.
        cmd.args(["-c", "echo $$ $(cut -d' ' -f5 /proc/$$/stat)"])
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        unsafe {
            cmd.pre_exec(move || harden_child(&CHECK_LIMITS, None));
        }

        let output = cmd.output().await.unwrap();
        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        let ids: Vec<&str> = stdout.split_whitespace().collect();
        assert_eq!(ids.len(), 2, "unexpected output: {:?}", stdout);
        assert_eq!(ids[0], ids[1]);
    }

    #[test]
    fn test_mount_points_skip_kernel_trees_and_unescape() {
        let mountinfo = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
23 22 0:21 / /proc rw,nosuid,nodev,noexec,relatime shared:12 - proc proc rw
24 23 0:22 / /proc/sys/fs/binfmt_misc rw,relatime shared:13 - autofs systemd-1 rw
25 22 0:23 / /sys rw,nosuid,nodev,noexec,relatime shared:7 - sysfs sysfs rw
26 22 0:24 / /tmp rw,nosuid,nodev shared:14 - tmpfs tmpfs rw
27 22 0:25 / /mnt/my\\040disk rw,relatime shared:15 - ext4 /dev/sdb1 rw
28 22 0:26 / /processes rw,relatime shared:16 - ext4 /dev/sdc1 rw
";
        assert_eq!(
            mount_points(mountinfo),
            vec![
                PathBuf::from("/"),
                PathBuf::from("/tmp"),
                PathBuf::from("/mnt/my disk"),
                PathBuf::from("/processes"),
            ]
        );
    }

    #[test]
    fn test_unescape_leaves_plain_backslashes() {
        assert_eq!(unescape_mount_path("/a\\b"), PathBuf::from("/a\\b"));
        assert_eq!(unescape_mount_path("/x\\134y"), PathBuf::from("/x\\y"));
        assert_eq!(unescape_mount_path("/tab\\011"), PathBuf::from("/tab\t"));
    }

    #[test]
    fn test_id_map_never_maps_root_to_root() {
        assert_eq!(id_map(1000), "1000 1000 1");
        assert_eq!(id_map(0), "65534 0 1");
    }

    #[test]
    fn test_plan_covers_parent_and_root() {
        let root = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir_in(root.path()).unwrap();
        let plan = NamespacePlan::for_work_dir(dir.path()).unwrap();

        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(plan.work_dir().to_bytes(), expected.as_os_str().as_bytes());
        assert!(plan.read_only_mounts().iter().any(|m| m.to_bytes() == b"/"));
        assert!(NamespacePlan::for_work_dir(Path::new("/")).is_err());
    }
}
