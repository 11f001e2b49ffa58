//! One OS process tracked by the shim.

mod watcher;

pub use watcher::{ExitWatcher, PollingWatcher};

use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use ocishim_shared::errors::{ShimError, ShimResult};
use ocishim_shared::status::{ProcessStatus, UNKNOWN_EXIT_CODE};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::io::IoSet;
use crate::store::ProcessDir;
use crate::util::{self, Reap};

/// A process started by the runtime: identity, liveness, exit code, stdio.
///
/// The pid is fixed for the lifetime of the record. Liveness is re-checked
/// against the start time captured when the pid was first observed, so a
/// recycled pid reads as Stopped rather than as the original process.
pub struct ProcessRecord {
    id: String,
    pid: u32,
    /// Start time of the process this record describes. `None` when it was
    /// already gone when loaded.
    start_time: Option<String>,
    dir: ProcessDir,
    status: Mutex<ProcessStatus>,
    exit: watch::Sender<Option<u32>>,
    io: Mutex<Option<IoSet>>,
    watcher: Arc<dyn ExitWatcher>,
}

impl ProcessRecord {
    /// Build a record from its state directory.
    ///
    /// Reads the pid, probes it, and compares the live start time with the
    /// persisted marker (writing it on first observation). A record that is
    /// found Stopped is completed right away.
    pub fn load(
        id: &str,
        dir: ProcessDir,
        watcher: Arc<dyn ExitWatcher>,
    ) -> ShimResult<Self> {
        let pid = dir.read_pid()?;
        let saved = dir.read_start_time()?;

        let (status, start_time, reused) = match util::live_start_time(pid)? {
            None => (ProcessStatus::Stopped, saved, false),
            Some(live) => match saved {
                None => {
                    dir.write_start_time(&live)?;
                    (ProcessStatus::Running, Some(live), false)
                }
                Some(saved) if saved == live => (ProcessStatus::Running, Some(live), false),
                Some(saved) => {
                    tracing::debug!(
                        process_id = %id,
                        pid = pid,
                        "Pid now belongs to another process"
                    );
                    (ProcessStatus::Stopped, Some(saved), true)
                }
            },
        };

        let (exit, _) = watch::channel(None);
        let record = Self {
            id: id.to_string(),
            pid,
            start_time,
            dir,
            status: Mutex::new(status),
            exit,
            io: Mutex::new(None),
            watcher,
        };

        if !status.is_running() {
            // Never reap a recycled pid; it is somebody else's process now.
            let code = if reused {
                UNKNOWN_EXIT_CODE
            } else {
                record.reap_exit_code()
            };
            record.complete(code);
        }

        tracing::trace!(process_id = %id, pid = pid, status = %status, "Loaded process record");
        Ok(record)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn dir(&self) -> &ProcessDir {
        &self.dir
    }

    /// Current status, re-validated against the start time while Running.
    pub fn status(&self) -> ProcessStatus {
        let mut status = self.status.lock();
        if status.is_running() && !self.is_same_process() {
            *status = ProcessStatus::Stopped;
        }
        *status
    }

    /// Exit code, once the exit has been observed.
    pub fn exit_code(&self) -> Option<u32> {
        *self.exit.borrow()
    }

    /// Wait until the process has exited and return its exit code.
    ///
    /// The code is [`UNKNOWN_EXIT_CODE`] when the shim could not reap the
    /// process. Cancel by dropping the future.
    pub async fn wait(&self) -> ShimResult<u32> {
        self.watcher.wait(self).await
    }

    /// Send a signal.
    ///
    /// Reports `NotFound` when the process is already gone, including when
    /// the kernel answers `ESRCH`.
    pub fn signal(&self, signal: Signal) -> ShimResult<()> {
        if !self.status().is_running() {
            return Err(ShimError::NotFound("process not found".into()));
        }

        match util::send_signal(self.pid, signal) {
            Ok(()) => {
                tracing::debug!(process_id = %self.id, pid = self.pid, signal = %signal, "Signaled process");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                self.mark_stopped();
                Err(ShimError::NotFound("process not found".into()))
            }
            Err(e) => Err(ShimError::Internal(format!(
                "failed to send {} to pid {}: {}",
                signal, self.pid, e
            ))),
        }
    }

    /// Hand the record its stdio; released with [`release_io`](Self::release_io)
    /// or when the record is dropped.
    pub fn attach_io(&self, io: IoSet) {
        let previous = self.io.lock().replace(io);
        if let Some(mut previous) = previous {
            previous.close();
        }
    }

    /// Close the attached stdio. Later calls do nothing.
    pub fn release_io(&self) {
        let io = self.io.lock().take();
        if let Some(mut io) = io {
            io.close();
            tracing::trace!(process_id = %self.id, "Released process io");
        }
    }

    /// End the process's stdin (an EOF on its console with a terminal).
    pub fn close_stdin(&self) -> ShimResult<()> {
        match self.io.lock().as_mut() {
            Some(io) => io.close_stdin(),
            None => Err(self.no_io()),
        }
    }

    /// Resize the process's console.
    pub fn resize(&self, width: u16, height: u16) -> ShimResult<()> {
        match self.io.lock().as_ref() {
            Some(io) => io.resize(width, height),
            None => Err(self.no_io()),
        }
    }

    fn no_io(&self) -> ShimError {
        ShimError::InvalidState(format!("process {} has no stdio attached", self.id))
    }

    pub fn has_io(&self) -> bool {
        self.io.lock().is_some()
    }

    pub fn watcher(&self) -> &Arc<dyn ExitWatcher> {
        &self.watcher
    }

    // ========================================================================
    // Exit bookkeeping, driven by the watchers
    // ========================================================================

    /// Whether the pid still names the process this record was created for.
    pub(crate) fn is_same_process(&self) -> bool {
        match &self.start_time {
            Some(start_time) => util::is_same_process(self.pid, start_time),
            None => false,
        }
    }

    /// Whether the pid currently names a process (live or zombie) other
    /// than the one this record was created for.
    fn pid_reused(&self) -> bool {
        let Some(start_time) = &self.start_time else {
            return false;
        };
        matches!(
            util::read_proc_stat(self.pid),
            Ok(Some(stat)) if stat.start_time != *start_time
        )
    }

    pub(crate) fn mark_stopped(&self) {
        *self.status.lock() = ProcessStatus::Stopped;
    }

    /// Record the exit. Only the first completion counts.
    pub(crate) fn complete(&self, code: u32) -> bool {
        self.mark_stopped();
        let first = self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(code);
            true
        });
        if first {
            tracing::debug!(process_id = %self.id, pid = self.pid, exit_code = code, "Process exited");
        }
        first
    }

    /// Reap the pid if it is our exited child, unknown otherwise.
    ///
    /// A pid that now names another process is left alone: waiting on it
    /// would steal that process's exit status.
    pub(crate) fn reap_exit_code(&self) -> u32 {
        if self.pid_reused() {
            tracing::debug!(process_id = %self.id, pid = self.pid, "Pid reused, not reaping");
            return UNKNOWN_EXIT_CODE;
        }
        match util::reap(self.pid) {
            Reap::Exited(code) => code,
            Reap::Running | Reap::NotChild => UNKNOWN_EXIT_CODE,
        }
    }

    /// Resolve once `complete` has been called.
    pub(crate) async fn exited(&self) -> ShimResult<u32> {
        let mut rx = self.exit.subscribe();
        let code = *rx
            .wait_for(|code| code.is_some())
            .await
            .map_err(|e| ShimError::Internal(format!("exit channel closed: {}", e)))?;
        Ok(code.unwrap_or(UNKNOWN_EXIT_CODE))
    }
}

impl std::fmt::Debug for ProcessRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRecord")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("status", &*self.status.lock())
            .field("exit_code", &self.exit_code())
            .field("watcher", &self.watcher.name())
            .finish()
    }
}
