//! Process validation utilities for PID checking and verification.
//!
//! A pid alone does not identify a process: pids are recycled. Every check
//! here pairs the pid with the kernel's start time for it (field 22 of
//! `/proc/<pid>/stat`), which is what gets persisted as the `starttime`
//! marker.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use ocishim_shared::errors::{ShimError, ShimResult};

/// Fields of `/proc/<pid>/stat` the shim cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    /// Single-letter scheduler state (`R`, `S`, `Z`, ...).
    pub state: char,
    /// Start time in clock ticks since boot, kept as an opaque token.
    pub start_time: String,
}

impl ProcStat {
    pub fn is_zombie(&self) -> bool {
        self.state == 'Z' || self.state == 'X'
    }
}

/// Outcome of a non-blocking reap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reap {
    /// The process was our child and has been reaped with this exit code.
    Exited(u32),
    /// The process is our child and has not exited yet.
    Running,
    /// The process is not our child (reparented elsewhere or already reaped).
    NotChild,
}

fn to_pid(pid: u32) -> Option<Pid> {
    // 0 and negative values have broadcast meaning for kill(2) and waitpid(2).
    if pid == 0 || pid > i32::MAX as u32 {
        None
    } else {
        Some(Pid::from_raw(pid as i32))
    }
}

/// Check if a process with the given PID exists.
///
/// Uses a null signal to check existence.
///
/// # Returns
/// * `true` - Process exists
/// * `false` - Process does not exist or permission denied
pub fn is_process_alive(pid: u32) -> bool {
    matches!(probe(pid), Ok(true))
}

/// Probe a pid with a zero signal.
///
/// `Ok(false)` only for `ESRCH`; any other kernel error is surfaced so the
/// caller can tell "gone" apart from "not allowed to look".
pub fn probe(pid: u32) -> ShimResult<bool> {
    let Some(target) = to_pid(pid) else {
        return Ok(false);
    };
    match kill(target, None::<Signal>) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(ShimError::Internal(format!(
            "failed to probe pid {}: {}",
            pid, e
        ))),
    }
}

/// Read state and start time from `/proc/<pid>/stat`.
///
/// Returns `Ok(None)` when the entry does not exist (the process is gone).
pub fn read_proc_stat(pid: u32) -> io::Result<Option<ProcStat>> {
    let path = format!("/proc/{}/stat", pid);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        // ESRCH surfaces when the process exits while the file is being read.
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => return Ok(None),
        Err(e) => return Err(e),
    };
    parse_proc_stat(&content)
        .map(Some)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("malformed {}", path)))
}

fn parse_proc_stat(content: &str) -> Option<ProcStat> {
    // comm may contain spaces and parentheses; everything after the last ')'
    // is space separated starting at field 3.
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let state = fields.first()?.chars().next()?;
    let start_time = fields.get(19)?.to_string();
    Some(ProcStat { state, start_time })
}

/// Start time of a live, non-zombie process.
///
/// `Ok(None)` means the pid no longer names a running process.
pub fn live_start_time(pid: u32) -> ShimResult<Option<String>> {
    if !probe(pid)? {
        return Ok(None);
    }
    match read_proc_stat(pid) {
        Ok(Some(stat)) if !stat.is_zombie() => Ok(Some(stat.start_time)),
        Ok(_) => Ok(None),
        Err(e) => Err(ShimError::Internal(format!(
            "failed to get start time for pid {}: {}",
            pid, e
        ))),
    }
}

/// Verify that a pid still belongs to the process first seen with `start_time`.
///
/// This prevents PID reuse attacks where a PID is recycled for a different process.
pub fn is_same_process(pid: u32, start_time: &str) -> bool {
    matches!(live_start_time(pid), Ok(Some(current)) if current == start_time)
}

/// Send a signal to a pid.
pub fn send_signal(pid: u32, signal: Signal) -> Result<(), Errno> {
    let target = to_pid(pid).ok_or(Errno::ESRCH)?;
    kill(target, signal)
}

/// Reap a pid without blocking.
pub fn reap(pid: u32) -> Reap {
    let Some(target) = to_pid(pid) else {
        return Reap::NotChild;
    };
    match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Reap::Exited(code as u32),
        Ok(WaitStatus::Signaled(_, signal, _)) => Reap::Exited(128 + signal as u32),
        Ok(_) => Reap::Running,
        Err(Errno::ECHILD) => Reap::NotChild,
        Err(e) => {
            tracing::debug!(pid = pid, error = %e, "waitpid failed, treating as foreign process");
            Reap::NotChild
        }
    }
}

/// Open a pidfd for the process; it becomes readable once the process exits.
pub fn pidfd_open(pid: u32) -> io::Result<OwnedFd> {
    if to_pid(pid).is_none() {
        return Err(io::Error::from_raw_os_error(libc::ESRCH));
    }
    // SAFETY: pidfd_open takes a pid and flags and returns a new descriptor or -1.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the kernel just handed us ownership of this descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Whether this kernel (and seccomp profile) allows pidfd_open.
pub fn pidfd_supported() -> bool {
    pidfd_open(std::process::id()).is_ok()
}

/// Mark the current process as child subreaper so orphaned container
/// processes are re-parented to it and can be reaped with their exit codes.
pub fn set_child_subreaper() -> Result<(), Errno> {
    nix::sys::prctl::set_child_subreaper(true)
}
