//! Notification-based exit monitor.
//!
//! One worker thread owns an epoll instance with one pidfd per watched
//! process. A pidfd becomes readable when its process exits; the worker then
//! reaps the pid (when it is our child) and completes the record, which wakes
//! every waiter at once. Token 0 is an eventfd used to stop the worker.
//!
//! Records are held weakly: a record nobody references any more is simply
//! reaped and forgotten when its process exits. Unwatching a record only
//! detaches it; the pidfd stays armed until the process is reaped.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use ocishim_shared::errors::{ShimError, ShimResult};
use ocishim_shared::status::UNKNOWN_EXIT_CODE;
use parking_lot::Mutex;

use crate::process::{ExitWatcher, PollingWatcher, ProcessRecord};
use crate::runtime::options::ExitMode;
use crate::util;

const SHUTDOWN_TOKEN: u64 = 0;
const EVENT_BATCH: usize = 64;

struct Entry {
    pid: u32,
    pidfd: OwnedFd,
    /// `None` once unwatched.
    record: Option<Weak<ProcessRecord>>,
}

struct Shared {
    epoll: Epoll,
    shutdown: EventFd,
    entries: Mutex<HashMap<u64, Entry>>,
    next_token: AtomicU64,
}

/// Exit watcher backed by pidfd + epoll.
pub struct ExitMonitor {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ExitMonitor {
    /// Create the epoll instance and start the worker thread.
    pub fn start() -> ShimResult<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| ShimError::Internal(format!("failed to create epoll: {}", e)))?;
        let shutdown = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(|e| ShimError::Internal(format!("failed to create eventfd: {}", e)))?;
        epoll
            .add(&shutdown, EpollEvent::new(EpollFlags::EPOLLIN, SHUTDOWN_TOKEN))
            .map_err(|e| ShimError::Internal(format!("failed to register eventfd: {}", e)))?;

        let shared = Arc::new(Shared {
            epoll,
            shutdown,
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(SHUTDOWN_TOKEN + 1),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("exit-monitor".into())
            .spawn(move || run(&worker_shared))
            .map_err(|e| ShimError::Internal(format!("failed to spawn exit monitor: {}", e)))?;

        tracing::debug!("Exit monitor started");
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Number of records currently watched.
    pub fn watched(&self) -> usize {
        self.shared
            .entries
            .lock()
            .values()
            .filter(|entry| entry.record.is_some())
            .count()
    }

    /// Number of armed pidfds, including unwatched processes not yet reaped.
    pub fn pending(&self) -> usize {
        self.shared.entries.lock().len()
    }

    /// Arm a pidfd for the record. `Ok(false)` when the process already
    /// exited and only needs reaping.
    fn register(&self, record: &Arc<ProcessRecord>) -> ShimResult<bool> {
        let pid = record.pid();
        let pidfd = match util::pidfd_open(pid) {
            Ok(pidfd) => pidfd,
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => return Ok(false),
            Err(e) => {
                return Err(ShimError::Internal(format!(
                    "pidfd_open({}) failed: {}",
                    pid, e
                )));
            }
        };

        if !record.is_same_process() {
            // Either it exited after load (a zombie until reaped) or the pid
            // now names another process.
            return match util::live_start_time(pid)? {
                None => Ok(false),
                Some(_) => Err(ShimError::NotFound(format!(
                    "pid {} now belongs to another process",
                    pid
                ))),
            };
        }

        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.shared.entries.lock();
        self.shared
            .epoll
            .add(&pidfd, EpollEvent::new(EpollFlags::EPOLLIN, token))
            .map_err(|e| ShimError::Internal(format!("epoll add for pid {} failed: {}", pid, e)))?;
        entries.insert(
            token,
            Entry {
                pid,
                pidfd,
                record: Some(Arc::downgrade(record)),
            },
        );
        Ok(true)
    }
}

impl Drop for ExitMonitor {
    fn drop(&mut self) {
        if let Err(e) = self.shared.shutdown.write(1) {
            tracing::warn!(error = %e, "Failed to signal exit monitor shutdown");
            return;
        }
        let Some(worker) = self.worker.take() else {
            return;
        };
        // The last record can be released on the worker itself.
        if worker.thread().id() == std::thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            tracing::warn!("Exit monitor thread panicked");
        }
    }
}

impl std::fmt::Debug for ExitMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitMonitor")
            .field("watched", &self.watched())
            .finish()
    }
}

#[async_trait]
impl ExitWatcher for ExitMonitor {
    fn watch(&self, record: &Arc<ProcessRecord>) {
        if record.exit_code().is_some() {
            return;
        }
        if !record.status().is_running() {
            record.complete(record.reap_exit_code());
            return;
        }

        match self.register(record) {
            Ok(true) => {
                tracing::trace!(process_id = %record.id(), pid = record.pid(), "Watching process");
            }
            Ok(false) => {
                record.complete(record.reap_exit_code());
            }
            Err(e) => {
                tracing::warn!(
                    process_id = %record.id(),
                    pid = record.pid(),
                    error = %e,
                    "Cannot watch process, marking it stopped"
                );
                record.complete(UNKNOWN_EXIT_CODE);
            }
        }
    }

    fn unwatch(&self, record: &ProcessRecord) {
        let target: *const ProcessRecord = record;
        let mut entries = self.shared.entries.lock();
        for entry in entries.values_mut() {
            let matches = entry
                .record
                .as_ref()
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), target));
            if matches {
                // The process still has to be reaped when it exits.
                entry.record = None;
                tracing::trace!(process_id = %record.id(), pid = entry.pid, "Stopped watching process");
            }
        }
    }

    async fn wait(&self, record: &ProcessRecord) -> ShimResult<u32> {
        record.exited().await
    }

    fn name(&self) -> &'static str {
        "notify"
    }
}

fn run(shared: &Shared) {
    let mut events = vec![EpollEvent::empty(); EVENT_BATCH];
    loop {
        let n = match shared.epoll.wait(&mut events, EpollTimeout::NONE) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::error!(error = %e, "Exit monitor wait failed, stopping");
                fail_all(shared);
                return;
            }
        };

        for event in &events[..n] {
            let token = event.data();
            if token == SHUTDOWN_TOKEN {
                tracing::debug!("Exit monitor stopped");
                return;
            }
            handle_exit(shared, token);
        }
    }
}

fn handle_exit(shared: &Shared, token: u64) {
    let Some(entry) = shared.entries.lock().remove(&token) else {
        return;
    };
    let _ = shared.epoll.delete(&entry.pidfd);

    let code = match util::reap(entry.pid) {
        util::Reap::Exited(code) => code,
        util::Reap::Running | util::Reap::NotChild => UNKNOWN_EXIT_CODE,
    };

    match entry.record.and_then(|weak| weak.upgrade()) {
        Some(record) => {
            record.complete(code);
        }
        None => {
            tracing::trace!(pid = entry.pid, exit_code = code, "Reaped process without a record");
        }
    }
}

fn fail_all(shared: &Shared) {
    let entries: Vec<Entry> = shared.entries.lock().drain().map(|(_, e)| e).collect();
    for entry in entries {
        if let Some(record) = entry.record.and_then(|weak| weak.upgrade()) {
            record.complete(UNKNOWN_EXIT_CODE);
        }
    }
}

/// Build the exit watcher for the configured mode.
pub fn exit_watcher(mode: ExitMode, poll_interval: Duration) -> ShimResult<Arc<dyn ExitWatcher>> {
    let use_monitor = match mode {
        ExitMode::Notify => true,
        ExitMode::Poll => false,
        ExitMode::Auto => {
            let supported = util::pidfd_supported();
            if !supported {
                tracing::info!("pidfd_open unavailable, falling back to polling exit watcher");
            }
            supported
        }
    };

    if use_monitor {
        Ok(Arc::new(ExitMonitor::start()?))
    } else {
        Ok(Arc::new(PollingWatcher::new(poll_interval)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use ocishim_shared::status::ProcessStatus;
    use std::path::Path;
    use std::process::Command;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        container: crate::store::ContainerDir,
        monitor: Arc<ExitMonitor>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let store = StateStore::open(tmp.path()).unwrap();
            let container = store
                .new_container_dir("c1", Path::new("/bundle"))
                .unwrap()
                .commit();
            Self {
                _tmp: tmp,
                container,
                monitor: Arc::new(ExitMonitor::start().unwrap()),
            }
        }

        fn record(&self, pid: u32) -> Arc<ProcessRecord> {
            let dir = self.container.new_process_dir(None).unwrap().commit();
            std::fs::write(dir.pid_file(), pid.to_string()).unwrap();
            let watcher: Arc<dyn ExitWatcher> = self.monitor.clone();
            Arc::new(ProcessRecord::load(dir.id(), dir.clone(), watcher).unwrap())
        }
    }

    #[tokio::test]
    async fn test_exit_code_delivered() {
        let fixture = Fixture::new();
        let child = Command::new("sh").args(["-c", "sleep 0.1; exit 5"]).spawn().unwrap();
        let record = fixture.record(child.id());
        fixture.monitor.watch(&record);

        let code = tokio::time::timeout(Duration::from_secs(10), record.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 5);
        assert_eq!(record.status(), ProcessStatus::Stopped);
        assert_eq!(fixture.monitor.watched(), 0);
    }

    #[tokio::test]
    async fn test_signal_death_code() {
        let fixture = Fixture::new();
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let record = fixture.record(child.id());
        fixture.monitor.watch(&record);

        record.signal(nix::sys::signal::Signal::SIGKILL).unwrap();
        let code = tokio::time::timeout(Duration::from_secs(10), record.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 128 + 9);
    }

    #[tokio::test]
    async fn test_many_exits_none_lost() {
        let fixture = Fixture::new();
        let records: Vec<_> = (0..16)
            .map(|i| {
                let script = format!("sleep 0.{}; exit {}", (i * 7) % 10, i);
                let child = Command::new("sh").args(["-c", &script]).spawn().unwrap();
                let record = fixture.record(child.id());
                fixture.monitor.watch(&record);
                record
            })
            .collect();

        let waits = records.iter().map(|r| r.wait());
        let codes = tokio::time::timeout(Duration::from_secs(20), futures::future::join_all(waits))
            .await
            .unwrap();
        for (i, code) in codes.into_iter().enumerate() {
            assert_eq!(code.unwrap(), i as u32);
        }
        assert!(records.iter().all(|r| r.status() == ProcessStatus::Stopped));
        assert_eq!(fixture.monitor.watched(), 0);
    }

    #[tokio::test]
    async fn test_unwatch_still_reaps() {
        let fixture = Fixture::new();
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let record = fixture.record(pid);
        fixture.monitor.watch(&record);
        assert_eq!(fixture.monitor.watched(), 1);

        fixture.monitor.unwatch(&record);
        assert_eq!(fixture.monitor.watched(), 0);
        assert_eq!(fixture.monitor.pending(), 1);

        record.signal(nix::sys::signal::Signal::SIGKILL).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while util::read_proc_stat(pid).unwrap().is_some() {
            assert!(std::time::Instant::now() < deadline, "pid {} never reaped", pid);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(fixture.monitor.pending(), 0);
        // Detached records are not completed by the monitor.
        assert_eq!(record.exit_code(), None);
    }

    #[test]
    fn test_watch_stopped_record_completes_immediately() {
        let fixture = Fixture::new();
        let record = fixture.record(std::process::id());
        std::fs::write(record.dir().path().join("starttime"), "1").unwrap();
        let reloaded = Arc::new(
            ProcessRecord::load(record.id(), record.dir().clone(), fixture.monitor.clone())
                .unwrap(),
        );

        fixture.monitor.watch(&reloaded);
        assert_eq!(reloaded.exit_code(), Some(UNKNOWN_EXIT_CODE));
        assert_eq!(fixture.monitor.watched(), 0);
    }

    #[test]
    fn test_drop_stops_worker() {
        let monitor = ExitMonitor::start().unwrap();
        drop(monitor);
    }
}
