//! End-to-end tests of the runtime driver.
//!
//! A fake runtime stands in for runc: `create` and `exec` spawn real
//! processes and write their pid files, so the state store, stdio setup,
//! liveness checks and exit watching all run for real.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::Signal;
use ocishim::oci::{CreateRequest, ExecRequest, OciRuntime, RuntimeState};
use ocishim::{
    ContainerStatus, CreateOptions, ExitMode, ProcessOptions, ProcessStatus, RuntimeDriver,
    ShimError, ShimOptions, ShimResult, StdioPaths,
};
use parking_lot::Mutex;
use tempfile::TempDir;

// ============================================================================
// Fake runtime
// ============================================================================

struct FakeContainer {
    pid: u32,
    status: String,
    bundle: PathBuf,
}

#[derive(Default)]
struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    calls: Mutex<Vec<String>>,
    /// Init command; `sleep 30` when empty.
    init_args: Mutex<Vec<String>>,
    fail_create: AtomicBool,
    fail_exec: AtomicBool,
    skip_pid_file: AtomicBool,
}

impl FakeRuntime {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn not_found(id: &str) -> ShimError {
        ShimError::NotFound(format!("container \"{}\" does not exist", id))
    }

    fn spawn(
        args: &[String],
        stdio: ocishim::RuntimeStdio,
        console: Option<&Path>,
    ) -> ShimResult<u32> {
        let mut command = Command::new(&args[0]);
        command.args(&args[1..]);
        match console {
            Some(console) => {
                let tty = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(console)?;
                command
                    .stdin(tty.try_clone()?)
                    .stdout(tty.try_clone()?)
                    .stderr(tty);
            }
            None => {
                command
                    .stdin(stdio.stdin)
                    .stdout(stdio.stdout)
                    .stderr(stdio.stderr);
            }
        }
        // Left unreaped on purpose: the exit watcher collects it.
        Ok(command.spawn()?.id())
    }
}

#[async_trait::async_trait]
impl OciRuntime for FakeRuntime {
    async fn create(&self, request: CreateRequest<'_>) -> ShimResult<()> {
        self.record(format!("create {}", request.id));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ShimError::Runtime("'fake create' failed with output: boom".into()));
        }

        let mut args = self.init_args.lock().clone();
        if args.is_empty() {
            args = vec!["sleep".to_string(), "30".to_string()];
        }
        let pid = Self::spawn(&args, request.stdio, request.console)?;
        if !self.skip_pid_file.load(Ordering::SeqCst) {
            std::fs::write(request.pid_file, pid.to_string())?;
        }
        self.containers.lock().insert(
            request.id.to_string(),
            FakeContainer {
                pid,
                status: "created".into(),
                bundle: request.bundle.to_path_buf(),
            },
        );
        Ok(())
    }

    async fn start(&self, id: &str) -> ShimResult<()> {
        self.record(format!("start {}", id));
        let mut containers = self.containers.lock();
        let container = containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.status = "running".into();
        Ok(())
    }

    async fn state(&self, id: &str) -> ShimResult<RuntimeState> {
        let containers = self.containers.lock();
        let container = containers.get(id).ok_or_else(|| Self::not_found(id))?;
        let alive = matches!(ocishim::util::live_start_time(container.pid), Ok(Some(_)));
        Ok(RuntimeState {
            id: id.to_string(),
            pid: container.pid,
            status: if alive {
                container.status.clone()
            } else {
                "stopped".into()
            },
            bundle: container.bundle.clone(),
            created: None,
        })
    }

    async fn pause(&self, id: &str) -> ShimResult<()> {
        let mut containers = self.containers.lock();
        let container = containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.status = "paused".into();
        Ok(())
    }

    async fn resume(&self, id: &str) -> ShimResult<()> {
        let mut containers = self.containers.lock();
        let container = containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.status = "running".into();
        Ok(())
    }

    async fn delete(&self, id: &str) -> ShimResult<()> {
        self.record(format!("delete {}", id));
        self.containers
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn kill(&self, id: &str, signal: Signal, all: bool) -> ShimResult<()> {
        self.record(format!("kill {} {} {}", id, signal as i32, all));
        let pid = self
            .containers
            .lock()
            .get(id)
            .map(|c| c.pid)
            .ok_or_else(|| Self::not_found(id))?;
        let _ = ocishim::util::send_signal(pid, signal);
        Ok(())
    }

    async fn exec(&self, request: ExecRequest<'_>) -> ShimResult<()> {
        self.record(format!("exec {}", request.id));
        if !self.containers.lock().contains_key(request.id) {
            return Err(Self::not_found(request.id));
        }
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(ShimError::Runtime("'fake exec' failed with output: boom".into()));
        }
        let args = request.process.args().clone().unwrap_or_default();
        let pid = Self::spawn(&args, request.stdio, request.console)?;
        if !self.skip_pid_file.load(Ordering::SeqCst) {
            std::fs::write(request.pid_file, pid.to_string())?;
        }
        Ok(())
    }

    async fn list(&self) -> ShimResult<Vec<RuntimeState>> {
        let ids: Vec<String> = self.containers.lock().keys().cloned().collect();
        let mut states = Vec::new();
        for id in ids {
            states.push(self.state(&id).await?);
        }
        Ok(states)
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    tmp: TempDir,
    runtime: Arc<FakeRuntime>,
    driver: RuntimeDriver,
}

impl Fixture {
    async fn new() -> Self {
        Self::with_exit_mode(ExitMode::Auto).await
    }

    async fn with_exit_mode(mode: ExitMode) -> Self {
        let tmp = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let mut options = options(tmp.path());
        options.exit_mode = mode;
        let driver = RuntimeDriver::open_with_runtime(options, runtime.clone())
            .await
            .unwrap();
        Self {
            tmp,
            runtime,
            driver,
        }
    }

    fn root(&self) -> PathBuf {
        self.tmp.path().join("root")
    }

    fn bundle(&self) -> PathBuf {
        let bundle = self.tmp.path().join("bundle");
        if !bundle.exists() {
            std::fs::create_dir_all(&bundle).unwrap();
            oci_spec::runtime::Spec::default()
                .save(bundle.join("config.json"))
                .unwrap();
        }
        bundle
    }

    /// An empty file under `io/` to use as a stdio endpoint.
    fn endpoint(&self, name: &str) -> PathBuf {
        let dir = self.io_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    fn io_dir(&self) -> PathBuf {
        self.tmp.path().join("io")
    }

    async fn reopen(&self) -> RuntimeDriver {
        RuntimeDriver::open_with_runtime(options(self.tmp.path()), self.runtime.clone())
            .await
            .unwrap()
    }
}

fn options(tmp: &Path) -> ShimOptions {
    let mut options = ShimOptions::with_root(tmp.join("root"));
    options.exit_mode = ExitMode::Auto;
    options.poll_interval_ms = 10;
    options.subreaper = false;
    options
}

fn process_spec(args: &[&str]) -> oci_spec::runtime::Process {
    let mut spec = oci_spec::runtime::Process::default();
    spec.set_args(Some(args.iter().map(|a| a.to_string()).collect()));
    spec
}

/// Targets of this process's descriptors that live under `prefix`.
fn open_fds_under(prefix: &Path) -> Vec<PathBuf> {
    std::fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| std::fs::read_link(entry.path()).ok())
        .filter(|target| target.starts_with(prefix))
        .collect()
}

/// Poll until `pid` has been reaped by the shim.
async fn assert_reaped(pid: u32) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while ocishim::util::read_proc_stat(pid).unwrap().is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "pid {} left unreaped: {:?}",
            pid,
            ocishim::util::read_proc_stat(pid)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_with_timeout(
    driver: &RuntimeDriver,
    container: &ocishim::Container,
    process_id: &str,
) -> u32 {
    tokio::time::timeout(
        Duration::from_secs(10),
        driver.wait_process(container, process_id),
    )
    .await
    .expect("process did not exit in time")
    .unwrap()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_create_start_signal_delete() {
    let fixture = Fixture::new().await;
    let driver = &fixture.driver;

    let container = driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap();
    assert!(fixture.root().join("c1").is_dir());
    assert!(fixture.root().join("c1/processes/init/pid").is_file());
    assert!(fixture.root().join("c1/processes/init/starttime").is_file());

    let init = container.get_process("init").unwrap();
    assert!(ocishim::util::is_process_alive(init.pid()));
    assert_eq!(driver.status(&container).await.unwrap(), ContainerStatus::Created);

    driver.start(&container).await.unwrap();
    assert_eq!(driver.status(&container).await.unwrap(), ContainerStatus::Running);

    driver
        .signal_process(&container, "init", Signal::SIGTERM)
        .unwrap();
    let code = wait_with_timeout(driver, &container, "init").await;
    assert_eq!(code, 128 + Signal::SIGTERM as u32);
    assert_eq!(init.status(), ProcessStatus::Stopped);
    assert_eq!(init.exit_code(), Some(143));

    driver.delete(&container).await.unwrap();
    assert!(!fixture.root().join("c1").exists());
    assert!(!init.has_io());

    let listed = driver.list().await.unwrap();
    assert!(listed.iter().all(|c| c.id() != "c1"));
}

#[tokio::test]
async fn test_stdio_reaches_process() {
    let fixture = Fixture::new().await;
    let out = fixture.tmp.path().join("c1.out");
    std::fs::write(&out, b"").unwrap();

    let container = fixture
        .driver
        .create(
            "c1",
            &fixture.bundle(),
            CreateOptions {
                stdio: StdioPaths {
                    stdout: Some(out.clone()),
                    ..Default::default()
                },
                terminal: false,
            },
        )
        .await
        .unwrap();

    let exec = fixture
        .driver
        .start_process(&container, {
            let mut options = ProcessOptions::new(process_spec(&["echo", "hello from exec"]));
            options.stdio.stdout = Some(out.clone());
            options
        })
        .await
        .unwrap();
    assert_eq!(wait_with_timeout(&fixture.driver, &container, exec.id()).await, 0);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello from exec\n");

    fixture.driver.kill(&container, Signal::SIGKILL, false).await.unwrap();
    wait_with_timeout(&fixture.driver, &container, "init").await;
    fixture.driver.delete(&container).await.unwrap();
}

#[tokio::test]
async fn test_polling_watcher_driver() {
    let tmp = TempDir::new().unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let mut options = options(tmp.path());
    options.exit_mode = ExitMode::Poll;
    let driver = RuntimeDriver::open_with_runtime(options, runtime).await.unwrap();
    assert_eq!(driver.watcher().name(), "poll");

    let bundle = tmp.path().join("bundle");
    std::fs::create_dir_all(&bundle).unwrap();
    oci_spec::runtime::Spec::default()
        .save(bundle.join("config.json"))
        .unwrap();

    let container = driver
        .create("c1", &bundle, CreateOptions::default())
        .await
        .unwrap();
    let exec = driver
        .start_process(&container, ProcessOptions::new(process_spec(&["sh", "-c", "exit 4"])))
        .await
        .unwrap();
    assert_eq!(wait_with_timeout(&driver, &container, exec.id()).await, 4);

    driver.signal_process(&container, "init", Signal::SIGKILL).unwrap();
    assert_eq!(wait_with_timeout(&driver, &container, "init").await, 137);
    driver.delete(&container).await.unwrap();
}

#[tokio::test]
async fn test_pause_resume_pass_through() {
    let fixture = Fixture::new().await;
    let driver = &fixture.driver;
    let container = driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap();
    driver.start(&container).await.unwrap();

    driver.pause(&container).await.unwrap();
    assert_eq!(driver.status(&container).await.unwrap(), ContainerStatus::Paused);
    driver.resume(&container).await.unwrap();
    assert_eq!(driver.status(&container).await.unwrap(), ContainerStatus::Running);

    driver.kill(&container, Signal::SIGKILL, true).await.unwrap();
    assert_eq!(wait_with_timeout(driver, &container, "init").await, 128 + 9);
    assert_eq!(driver.status(&container).await.unwrap(), ContainerStatus::Stopped);
    driver.delete(&container).await.unwrap();
}

#[tokio::test]
async fn test_delete_requires_stopped_init() {
    let fixture = Fixture::new().await;
    let driver = &fixture.driver;
    let container = driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap();

    let err = driver.delete(&container).await.unwrap_err();
    assert!(matches!(err, ShimError::InvalidState(_)));
    assert!(fixture.root().join("c1").is_dir());

    driver.signal_process(&container, "init", Signal::SIGKILL).unwrap();
    wait_with_timeout(driver, &container, "init").await;
    driver.delete(&container).await.unwrap();
}

#[tokio::test]
async fn test_delete_tolerates_runtime_not_found() {
    let fixture = Fixture::new().await;
    let driver = &fixture.driver;
    let container = driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap();
    driver.signal_process(&container, "init", Signal::SIGKILL).unwrap();
    wait_with_timeout(driver, &container, "init").await;

    fixture.runtime.delete("c1").await.unwrap();
    driver.delete(&container).await.unwrap();
    assert!(!fixture.root().join("c1").exists());
}

// ============================================================================
// Create failures and validation
// ============================================================================

#[tokio::test]
async fn test_runtime_failure_leaves_nothing() {
    let fixture = Fixture::new().await;
    fixture.runtime.fail_create.store(true, Ordering::SeqCst);

    let err = fixture
        .driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ShimError::Runtime(_)));
    assert!(!fixture.root().join("c1").exists());
    // Nothing was accepted, so nothing is rolled back in the runtime.
    assert_eq!(fixture.runtime.calls(), vec!["create c1"]);
}

#[tokio::test]
async fn test_missing_pid_file_rolls_back_runtime() {
    let fixture = Fixture::new().await;
    fixture.runtime.skip_pid_file.store(true, Ordering::SeqCst);

    let err = fixture
        .driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(!fixture.root().join("c1").exists());
    assert_eq!(
        fixture.runtime.calls(),
        vec!["create c1", "kill c1 9 false", "delete c1"]
    );

    // The id is free again.
    fixture.runtime.skip_pid_file.store(false, Ordering::SeqCst);
    let container = fixture
        .driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap();
    fixture
        .driver
        .signal_process(&container, "init", Signal::SIGKILL)
        .unwrap();
}

#[tokio::test]
async fn test_stdio_failure_leaves_nothing() {
    let fixture = Fixture::new().await;
    let options = CreateOptions {
        stdio: StdioPaths {
            stdout: Some(fixture.tmp.path().join("does-not-exist")),
            ..Default::default()
        },
        terminal: false,
    };

    let err = fixture
        .driver
        .create("c1", &fixture.bundle(), options)
        .await
        .unwrap_err();
    assert!(matches!(err, ShimError::Io(_)));
    assert!(!fixture.root().join("c1").exists());
    assert!(fixture.runtime.calls().is_empty());
}

#[tokio::test]
async fn test_existing_directory_untouched() {
    let fixture = Fixture::new().await;
    let stale = fixture.root().join("c1");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("keep"), "data").unwrap();

    let err = fixture
        .driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ShimError::AlreadyExists(_)));
    assert_eq!(std::fs::read_to_string(stale.join("keep")).unwrap(), "data");
}

#[tokio::test]
async fn test_duplicate_create_rejected() {
    let fixture = Fixture::new().await;
    let container = fixture
        .driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap();

    let err = fixture
        .driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ShimError::AlreadyExists(_)));
    assert!(fixture.root().join("c1/processes/init").is_dir());

    fixture
        .driver
        .signal_process(&container, "init", Signal::SIGKILL)
        .unwrap();
}

#[tokio::test]
async fn test_invalid_arguments() {
    let fixture = Fixture::new().await;
    let bundle = fixture.bundle();

    for id in ["", "..", "a/b"] {
        let err = fixture
            .driver
            .create(id, &bundle, CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ShimError::InvalidArgument(_)), "id {:?}", id);
    }

    let err = fixture
        .driver
        .create("c1", Path::new("relative/bundle"), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ShimError::InvalidArgument(_)));

    let err = fixture
        .driver
        .create("c1", fixture.tmp.path(), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ShimError::InvalidArgument(_)));
    assert!(fixture.runtime.calls().is_empty());
}

#[test]
fn test_empty_root_is_fatal() {
    let err = RuntimeDriver::new(ShimOptions::with_root("")).unwrap_err();
    assert!(matches!(err, ShimError::Config(_)));
}

// ============================================================================
// Exec'd processes
// ============================================================================

#[tokio::test]
async fn test_exec_lifecycle() {
    let fixture = Fixture::new().await;
    let driver = &fixture.driver;
    let container = driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap();
    driver.start(&container).await.unwrap();

    let first = driver
        .start_process(&container, ProcessOptions::new(process_spec(&["sleep", "30"])))
        .await
        .unwrap();
    let second = driver
        .start_process(&container, ProcessOptions::new(process_spec(&["sleep", "30"])))
        .await
        .unwrap();
    assert_eq!(first.id(), "1");
    assert_eq!(second.id(), "2");
    assert_eq!(first.status(), ProcessStatus::Running);
    assert!(fixture.root().join("c1/processes/2/pid").is_file());

    let mut named = ProcessOptions::new(process_spec(&["sleep", "30"]));
    named.id = Some("init".into());
    let err = driver.start_process(&container, named).await.unwrap_err();
    assert!(matches!(err, ShimError::InvalidArgument(_)));

    let mut named = ProcessOptions::new(process_spec(&["sleep", "30"]));
    named.id = Some("1".into());
    let err = driver.start_process(&container, named).await.unwrap_err();
    assert!(matches!(err, ShimError::AlreadyExists(_)));

    driver
        .signal_process(&container, "1", Signal::SIGTERM)
        .unwrap();
    assert_eq!(wait_with_timeout(driver, &container, "1").await, 143);
    let err = driver
        .signal_process(&container, "1", Signal::SIGTERM)
        .unwrap_err();
    assert!(err.is_not_found());

    driver.delete_process(&container, "1").await.unwrap();
    driver.delete_process(&container, "1").await.unwrap();
    assert!(!fixture.root().join("c1/processes/1").exists());
    assert!(container.get_process("1").unwrap_err().is_not_found());
    assert!(driver.delete_process(&container, "init").await.is_err());

    assert!(
        driver
            .signal_process(&container, "nope", Signal::SIGTERM)
            .unwrap_err()
            .is_not_found()
    );

    driver.kill(&container, Signal::SIGKILL, true).await.unwrap();
    second.signal(Signal::SIGKILL).unwrap();
    wait_with_timeout(driver, &container, "init").await;
    wait_with_timeout(driver, &container, "2").await;
    driver.delete(&container).await.unwrap();
    assert!(!second.has_io());
}

#[tokio::test]
async fn test_many_exits_resolve_once_each() {
    let fixture = Fixture::new().await;
    let driver = &fixture.driver;
    let container = driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap();

    let mut records = Vec::new();
    for i in 0..12u32 {
        let script = format!("sleep 0.{}; exit {}", (i * 3) % 10, i);
        let record = driver
            .start_process(
                &container,
                ProcessOptions::new(process_spec(&["sh", "-c", &script])),
            )
            .await
            .unwrap();
        records.push((i, record));
    }

    let waits = records
        .iter()
        .map(|(_, record)| driver.wait_process(&container, record.id()));
    let codes = tokio::time::timeout(Duration::from_secs(20), futures::future::join_all(waits))
        .await
        .unwrap();

    for ((expected, record), code) in records.iter().zip(codes) {
        assert_eq!(code.unwrap(), *expected);
        assert_eq!(record.status(), ProcessStatus::Stopped);
        assert_eq!(record.exit_code(), Some(*expected));
    }

    driver.signal_process(&container, "init", Signal::SIGKILL).unwrap();
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_recovery_from_disk() {
    let fixture = Fixture::new().await;
    let (init_pid, exec_pid) = {
        let container = fixture
            .driver
            .create("c1", &fixture.bundle(), CreateOptions::default())
            .await
            .unwrap();
        fixture.driver.start(&container).await.unwrap();
        let exec = fixture
            .driver
            .start_process(&container, ProcessOptions::new(process_spec(&["sleep", "30"])))
            .await
            .unwrap();
        (container.init().unwrap().pid(), exec.pid())
    };

    let driver = fixture.reopen().await;
    let container = driver.load("c1").await.unwrap();
    assert_eq!(container.bundle(), fixture.bundle());

    let init = container.get_process("init").unwrap();
    let exec = container.get_process("1").unwrap();
    assert_eq!(init.pid(), init_pid);
    assert_eq!(exec.pid(), exec_pid);
    assert_eq!(init.status(), ProcessStatus::Running);
    assert_eq!(exec.status(), ProcessStatus::Running);

    let listed = driver.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(Arc::ptr_eq(&listed[0], &container));

    exec.signal(Signal::SIGKILL).unwrap();
    tokio::time::timeout(Duration::from_secs(10), exec.wait())
        .await
        .unwrap()
        .unwrap();
    init.signal(Signal::SIGKILL).unwrap();
    tokio::time::timeout(Duration::from_secs(10), init.wait())
        .await
        .unwrap()
        .unwrap();
    driver.delete(&container).await.unwrap();
}

#[tokio::test]
async fn test_recovery_detects_pid_reuse() {
    let fixture = Fixture::new().await;
    let init_pid = {
        let container = fixture
            .driver
            .create("c1", &fixture.bundle(), CreateOptions::default())
            .await
            .unwrap();
        container.init().unwrap().pid()
    };
    std::fs::write(fixture.root().join("c1/processes/init/starttime"), "1").unwrap();

    let driver = fixture.reopen().await;
    let container = driver.load("c1").await.unwrap();
    let init = container.get_process("init").unwrap();
    assert_eq!(init.status(), ProcessStatus::Stopped);
    assert!(
        init.signal(Signal::SIGTERM)
            .unwrap_err()
            .is_not_found()
    );

    ocishim::util::send_signal(init_pid, Signal::SIGKILL).unwrap();
}

#[tokio::test]
async fn test_recovery_skips_vanished_processes() {
    let fixture = Fixture::new().await;
    {
        let container = fixture
            .driver
            .create("c1", &fixture.bundle(), CreateOptions::default())
            .await
            .unwrap();
        let exec = fixture
            .driver
            .start_process(&container, ProcessOptions::new(process_spec(&["true"])))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), exec.wait())
            .await
            .unwrap()
            .unwrap();
    }
    std::fs::remove_file(fixture.root().join("c1/processes/1/pid")).unwrap();
    // State for a container the runtime never heard of.
    std::fs::create_dir_all(fixture.root().join("ghost/processes")).unwrap();
    std::fs::write(fixture.root().join("ghost/bundle"), "/nowhere").unwrap();

    let driver = fixture.reopen().await;
    let container = driver.load("c1").await.unwrap();
    assert!(container.get_process("1").unwrap_err().is_not_found());
    assert!(container.get_process("init").is_ok());

    let ids: Vec<_> = driver
        .list()
        .await
        .unwrap()
        .iter()
        .map(|c| c.id().to_string())
        .collect();
    assert_eq!(ids, vec!["c1"]);
    assert!(driver.load("ghost").await.unwrap_err().is_not_found());

    driver
        .signal_process(&container, "init", Signal::SIGKILL)
        .unwrap();
}

#[tokio::test]
async fn test_load_unknown_container() {
    let fixture = Fixture::new().await;
    let err = fixture.driver.load("missing").await.unwrap_err();
    assert!(err.is_not_found());
}

// ============================================================================
// Reserved ids
// ============================================================================

#[tokio::test]
async fn test_reserved_ids_rejected() {
    let fixture = Fixture::new().await;
    let runtime_state = fixture.root().join("runc/other/state.json");
    std::fs::create_dir_all(runtime_state.parent().unwrap()).unwrap();
    std::fs::write(&runtime_state, "{}").unwrap();

    for id in ["runc", "logs"] {
        let err = fixture
            .driver
            .create(id, &fixture.bundle(), CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ShimError::InvalidArgument(_)), "id {:?}", id);
    }
    assert!(fixture.runtime.calls().is_empty());
    assert!(runtime_state.is_file());
}

// ============================================================================
// Descriptor hygiene
// ============================================================================

fn file_stdio(fixture: &Fixture) -> StdioPaths {
    StdioPaths {
        stdin: Some(fixture.endpoint("in")),
        stdout: Some(fixture.endpoint("out")),
        stderr: Some(fixture.endpoint("err")),
    }
}

#[tokio::test]
async fn test_failed_create_closes_stdio() {
    let fixture = Fixture::new().await;
    let stdio = file_stdio(&fixture);

    fixture.runtime.fail_create.store(true, Ordering::SeqCst);
    let options = CreateOptions {
        stdio: stdio.clone(),
        terminal: false,
    };
    fixture
        .driver
        .create("c1", &fixture.bundle(), options)
        .await
        .unwrap_err();
    assert_eq!(open_fds_under(&fixture.io_dir()), Vec::<PathBuf>::new());

    // Failing after the runtime accepted the create.
    fixture.runtime.fail_create.store(false, Ordering::SeqCst);
    fixture.runtime.skip_pid_file.store(true, Ordering::SeqCst);
    let options = CreateOptions {
        stdio,
        terminal: false,
    };
    fixture
        .driver
        .create("c1", &fixture.bundle(), options)
        .await
        .unwrap_err();
    assert_eq!(open_fds_under(&fixture.io_dir()), Vec::<PathBuf>::new());
    assert!(!fixture.root().join("c1").exists());
}

#[tokio::test]
async fn test_delete_closes_stdio() {
    let fixture = Fixture::new().await;
    let driver = &fixture.driver;
    let container = driver
        .create(
            "c1",
            &fixture.bundle(),
            CreateOptions {
                stdio: file_stdio(&fixture),
                terminal: false,
            },
        )
        .await
        .unwrap();
    assert!(!open_fds_under(&fixture.io_dir()).is_empty());

    driver.signal_process(&container, "init", Signal::SIGKILL).unwrap();
    wait_with_timeout(driver, &container, "init").await;
    driver.delete(&container).await.unwrap();
    assert_eq!(open_fds_under(&fixture.io_dir()), Vec::<PathBuf>::new());
}

#[tokio::test]
async fn test_start_process_failure_rolls_back() {
    let fixture = Fixture::new().await;
    let driver = &fixture.driver;
    let container = driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap();

    let exec_options = || {
        let mut options = ProcessOptions::new(process_spec(&["true"]));
        options.stdio = file_stdio(&fixture);
        options
    };

    fixture.runtime.fail_exec.store(true, Ordering::SeqCst);
    let err = driver
        .start_process(&container, exec_options())
        .await
        .unwrap_err();
    assert!(matches!(err, ShimError::Runtime(_)));
    assert!(!fixture.root().join("c1/processes/1").exists());
    assert_eq!(open_fds_under(&fixture.io_dir()), Vec::<PathBuf>::new());

    fixture.runtime.fail_exec.store(false, Ordering::SeqCst);
    fixture.runtime.skip_pid_file.store(true, Ordering::SeqCst);
    let err = driver
        .start_process(&container, exec_options())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(!fixture.root().join("c1/processes/1").exists());
    assert_eq!(open_fds_under(&fixture.io_dir()), Vec::<PathBuf>::new());
    assert!(container.get_process("1").unwrap_err().is_not_found());

    // The rolled back id is free again.
    fixture.runtime.skip_pid_file.store(false, Ordering::SeqCst);
    let exec = driver
        .start_process(&container, exec_options())
        .await
        .unwrap();
    assert_eq!(exec.id(), "1");
    assert_eq!(wait_with_timeout(driver, &container, "1").await, 0);

    driver.signal_process(&container, "init", Signal::SIGKILL).unwrap();
}

// ============================================================================
// Consoles and stdin
// ============================================================================

#[tokio::test]
async fn test_terminal_processes() {
    let fixture = Fixture::new().await;
    let driver = &fixture.driver;
    *fixture.runtime.init_args.lock() = vec![
        "sh".to_string(),
        "-c".to_string(),
        "echo on-tty; exec sleep 30".to_string(),
    ];
    let out = fixture.endpoint("out");
    // The test harness itself may be attached to a terminal.
    let pts = Path::new("/dev/pts");
    let baseline = open_fds_under(pts);

    let container = driver
        .create(
            "c1",
            &fixture.bundle(),
            CreateOptions {
                stdio: StdioPaths {
                    stdout: Some(out.clone()),
                    ..Default::default()
                },
                terminal: true,
            },
        )
        .await
        .unwrap();

    // Output travels slave -> master -> stdout endpoint.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !std::fs::read_to_string(&out).unwrap().contains("on-tty") {
        assert!(tokio::time::Instant::now() < deadline, "no console output");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    driver.resize_process(&container, "init", 100, 30).unwrap();
    assert!(open_fds_under(pts).len() > baseline.len());

    // A terminal exec sees end of file once its stdin is closed.
    let mut options = ProcessOptions::new(process_spec(&["cat"]));
    options.terminal = true;
    let cat = driver.start_process(&container, options).await.unwrap();
    driver.close_stdin(&container, cat.id()).await.unwrap();
    assert_eq!(wait_with_timeout(driver, &container, cat.id()).await, 0);

    // Resizing needs a console.
    let plain = driver
        .start_process(&container, ProcessOptions::new(process_spec(&["true"])))
        .await
        .unwrap();
    let err = driver
        .resize_process(&container, plain.id(), 80, 24)
        .unwrap_err();
    assert!(matches!(err, ShimError::InvalidState(_)));
    wait_with_timeout(driver, &container, plain.id()).await;

    driver.signal_process(&container, "init", Signal::SIGKILL).unwrap();
    wait_with_timeout(driver, &container, "init").await;
    driver.delete(&container).await.unwrap();
    assert_eq!(open_fds_under(&fixture.io_dir()), Vec::<PathBuf>::new());
    assert_eq!(open_fds_under(pts), baseline);
}

#[tokio::test]
async fn test_close_stdin_ends_input() {
    let fixture = Fixture::new().await;
    let driver = &fixture.driver;
    let container = driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap();

    let fifo = fixture.io_dir().join("stdin");
    std::fs::create_dir_all(fixture.io_dir()).unwrap();
    nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::S_IRWXU).unwrap();
    // Keeps the fifo from reporting end of file on its own.
    let mut writer = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&fifo)
        .unwrap();
    let out = fixture.endpoint("out");

    let mut options = ProcessOptions::new(process_spec(&["cat"]));
    options.stdio = StdioPaths {
        stdin: Some(fifo),
        stdout: Some(out.clone()),
        stderr: None,
    };
    let cat = driver.start_process(&container, options).await.unwrap();

    std::io::Write::write_all(&mut writer, b"line\n").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while std::fs::read_to_string(&out).unwrap() != "line\n" {
        assert!(tokio::time::Instant::now() < deadline, "stdin not forwarded");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(cat.status(), ProcessStatus::Running);

    driver.close_stdin(&container, cat.id()).await.unwrap();
    driver.close_stdin(&container, cat.id()).await.unwrap();
    assert_eq!(wait_with_timeout(driver, &container, cat.id()).await, 0);

    driver.signal_process(&container, "init", Signal::SIGKILL).unwrap();
}

// ============================================================================
// Reaping
// ============================================================================

async fn deleted_process_is_reaped(mode: ExitMode) {
    let fixture = Fixture::with_exit_mode(mode).await;
    let driver = &fixture.driver;
    let container = driver
        .create("c1", &fixture.bundle(), CreateOptions::default())
        .await
        .unwrap();
    let exec = driver
        .start_process(&container, ProcessOptions::new(process_spec(&["sleep", "30"])))
        .await
        .unwrap();
    let pid = exec.pid();

    driver.delete_process(&container, exec.id()).await.unwrap();
    ocishim::util::send_signal(pid, Signal::SIGKILL).unwrap();
    assert_reaped(pid).await;

    driver.signal_process(&container, "init", Signal::SIGKILL).unwrap();
}

#[tokio::test]
async fn test_deleted_process_is_reaped_notify() {
    deleted_process_is_reaped(ExitMode::Auto).await;
}

#[tokio::test]
async fn test_deleted_process_is_reaped_poll() {
    deleted_process_is_reaped(ExitMode::Poll).await;
}
