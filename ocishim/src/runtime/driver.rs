use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::signal::Signal;
use ocishim_shared::errors::{ShimError, ShimResult};
use ocishim_shared::status::ContainerStatus;

use crate::container::Container;
use crate::io::IoSet;
use crate::monitor::exit_watcher;
use crate::oci::{CreateRequest, ExecRequest, OciRuntime, RuncClient};
use crate::process::{ExitWatcher, ProcessRecord};
use crate::runtime::constants::INIT_PROCESS_ID;
use crate::runtime::guard::CleanupGuard;
use crate::runtime::options::{CreateOptions, ProcessOptions, ShimOptions, StdioPaths};
use crate::runtime::registry::Registry;
use crate::runtime::types::{validate_bundle, validate_id};
use crate::store::{ContainerDir, ProcessDir, StateStore};
use crate::util;

/// Execution core façade.
///
/// Owns the state store, the exit watcher, the container registry and the
/// low-level runtime client. Multi-step operations either complete or leave
/// nothing behind: directory allocations and stdio are scoped values, and a
/// container the runtime accepted is killed and deleted again if a later
/// step fails.
///
/// **Locking Strategy**:
/// - The registry and the exit monitor each guard their map with one mutex,
///   held for the mutation only, never across an `.await`
/// - Operations on the same container are serialized by the caller
pub struct RuntimeDriver {
    options: ShimOptions,
    store: StateStore,
    runtime: Arc<dyn OciRuntime>,
    watcher: Arc<dyn ExitWatcher>,
    registry: Registry,
}

impl std::fmt::Debug for RuntimeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeDriver")
            .field("root", &self.options.root)
            .field("watcher", &self.watcher.name())
            .field("registry", &self.registry)
            .finish()
    }
}

impl RuntimeDriver {
    /// Create a driver invoking the configured runtime binary.
    pub fn new(options: ShimOptions) -> ShimResult<Self> {
        options.sanitize()?;
        let runtime = Arc::new(RuncClient::new(&options.runtime, options.runtime_root()));
        Self::with_runtime(options, runtime)
    }

    /// Create a driver on top of any [`OciRuntime`].
    pub fn with_runtime(options: ShimOptions, runtime: Arc<dyn OciRuntime>) -> ShimResult<Self> {
        // Validate Early: nothing touches the filesystem before this.
        options.sanitize()?;

        let store = StateStore::open(&options.root)?;

        if options.subreaper
            && let Err(e) = util::set_child_subreaper()
        {
            tracing::warn!(error = %e, "Failed to become child subreaper, exit codes of orphaned processes will be unknown");
        }

        let watcher = exit_watcher(options.exit_mode, options.poll_interval())?;

        tracing::debug!(
            root = %options.root.display(),
            watcher = watcher.name(),
            "Initialized runtime driver"
        );

        Ok(Self {
            options,
            store,
            runtime,
            watcher,
            registry: Registry::new(),
        })
    }

    /// [`new`](Self::new) followed by [`recover`](Self::recover).
    pub async fn open(options: ShimOptions) -> ShimResult<Self> {
        let driver = Self::new(options)?;
        driver.recover().await?;
        Ok(driver)
    }

    /// [`with_runtime`](Self::with_runtime) followed by [`recover`](Self::recover).
    pub async fn open_with_runtime(
        options: ShimOptions,
        runtime: Arc<dyn OciRuntime>,
    ) -> ShimResult<Self> {
        let driver = Self::with_runtime(options, runtime)?;
        driver.recover().await?;
        Ok(driver)
    }

    /// Rebuild the registry from disk and the runtime's view.
    ///
    /// Container directories the runtime no longer knows are reported, not
    /// removed.
    pub async fn recover(&self) -> ShimResult<()> {
        let containers = self.list().await?;
        for dir in self.store.list_container_dirs()? {
            if !containers.iter().any(|c| c.id() == dir.id()) {
                tracing::warn!(
                    container_id = %dir.id(),
                    path = %dir.path().display(),
                    "Found state for a container unknown to the runtime"
                );
            }
        }
        tracing::info!(containers = containers.len(), "Recovered containers");
        Ok(())
    }

    pub fn options(&self) -> &ShimOptions {
        &self.options
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub fn runtime(&self) -> &Arc<dyn OciRuntime> {
        &self.runtime
    }

    pub fn watcher(&self) -> &Arc<dyn ExitWatcher> {
        &self.watcher
    }

    // ========================================================================
    // CONTAINER LIFECYCLE
    // ========================================================================

    /// Create a container from an OCI bundle.
    ///
    /// Allocates the state directory, opens stdio (and a console with
    /// `terminal`), runs the runtime's `create` and tracks the init process.
    pub async fn create(
        &self,
        id: &str,
        bundle: &Path,
        options: CreateOptions,
    ) -> ShimResult<Arc<Container>> {
        tracing::debug!(container_id = %id, bundle = %bundle.display(), terminal = options.terminal, "RuntimeDriver::create called");

        validate_id("container", id)?;
        self.options.check_container_id(id)?;
        validate_bundle(bundle)?;
        if self.registry.contains(id) {
            return Err(ShimError::AlreadyExists(format!(
                "container {} already exists",
                id
            )));
        }

        let container_dir = self.store.new_container_dir(id, bundle)?;

        let (mut io, console) = open_io(options.stdio, options.terminal).await?;

        let init_dir = container_dir.new_process_dir(Some(INIT_PROCESS_ID))?;
        let pid_file = init_dir.pid_file();

        self.runtime
            .create(CreateRequest {
                id,
                bundle,
                pid_file: &pid_file,
                console: console.as_deref(),
                stdio: io.runtime_stdio()?,
            })
            .await?;

        let guard = CleanupGuard::new(self.runtime.clone(), id);

        let container = Arc::new(Container::new(
            id,
            bundle.to_path_buf(),
            (*container_dir).clone(),
        ));
        let result = self.track_init(&container, &init_dir, io);
        if let Err(e) = result {
            guard.rollback().await;
            return Err(e);
        }

        guard.disarm();
        init_dir.commit();
        container_dir.commit();

        tracing::info!(container_id = %id, "Created container");
        Ok(container)
    }

    fn track_init(
        &self,
        container: &Arc<Container>,
        init_dir: &ProcessDir,
        io: IoSet,
    ) -> ShimResult<()> {
        let record = Arc::new(ProcessRecord::load(
            INIT_PROCESS_ID,
            init_dir.clone(),
            self.watcher.clone(),
        )?);
        record.attach_io(io);
        container.add_process(record.clone(), true)?;
        self.registry.insert(container.clone())?;
        self.watcher.watch(&record);
        Ok(())
    }

    /// Run the container's user process.
    pub async fn start(&self, container: &Container) -> ShimResult<()> {
        tracing::debug!(container_id = %container.id(), "RuntimeDriver::start called");
        self.runtime.start(container.id()).await
    }

    pub async fn pause(&self, container: &Container) -> ShimResult<()> {
        tracing::debug!(container_id = %container.id(), "RuntimeDriver::pause called");
        self.runtime.pause(container.id()).await
    }

    pub async fn resume(&self, container: &Container) -> ShimResult<()> {
        tracing::debug!(container_id = %container.id(), "RuntimeDriver::resume called");
        self.runtime.resume(container.id()).await
    }

    /// Signal the container through the runtime (`all` reaches every process).
    pub async fn kill(&self, container: &Container, signal: Signal, all: bool) -> ShimResult<()> {
        tracing::debug!(container_id = %container.id(), signal = %signal, all = all, "RuntimeDriver::kill called");
        self.runtime.kill(container.id(), signal, all).await
    }

    /// Status as reported by the runtime.
    pub async fn status(&self, container: &Container) -> ShimResult<ContainerStatus> {
        container.status(self.runtime.as_ref()).await
    }

    /// Delete a container whose init process has stopped.
    ///
    /// Removes it from the runtime, releases every process's stdio, deletes
    /// the state directory and forgets the container.
    pub async fn delete(&self, container: &Container) -> ShimResult<()> {
        let id = container.id();
        tracing::debug!(container_id = %id, "RuntimeDriver::delete called");

        if let Some(init) = container.init()
            && init.status().is_running()
        {
            return Err(ShimError::InvalidState(format!(
                "cannot delete container {}: init process {} is still running",
                id,
                init.pid()
            )));
        }

        match self.runtime.delete(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(container_id = %id, "Runtime already forgot container");
            }
            Err(e) => return Err(e),
        }

        self.store.delete_container_dir(container.dir())?;

        let records = container.drain_processes();
        for record in &records {
            record.watcher().unwatch(record);
        }
        self.registry.remove(id);
        release_io(records).await?;

        tracing::info!(container_id = %id, "Deleted container");
        Ok(())
    }

    // ========================================================================
    // PROCESS OPERATIONS
    // ========================================================================

    /// Start an extra process inside a container.
    pub async fn start_process(
        &self,
        container: &Container,
        options: ProcessOptions,
    ) -> ShimResult<Arc<ProcessRecord>> {
        tracing::debug!(
            container_id = %container.id(),
            process_id = ?options.id,
            terminal = options.terminal,
            "RuntimeDriver::start_process called"
        );

        if let Some(process_id) = options.id.as_deref() {
            if process_id == INIT_PROCESS_ID {
                return Err(ShimError::InvalidArgument(
                    "process id \"init\" is reserved".into(),
                ));
            }
            validate_id("process", process_id)?;
            if container.has_process(process_id) {
                return Err(ShimError::AlreadyExists(format!(
                    "process {} already exists in container {}",
                    process_id,
                    container.id()
                )));
            }
        }

        let process_dir = container.dir().new_process_dir(options.id.as_deref())?;

        let (mut io, console) = open_io(options.stdio.clone(), options.terminal).await?;

        let mut spec = options.spec.clone();
        spec.set_terminal(Some(options.terminal));
        let cwd: Option<PathBuf> = Some(spec.cwd().clone()).filter(|c| !c.as_os_str().is_empty());
        let pid_file = process_dir.pid_file();

        self.runtime
            .exec(ExecRequest {
                id: container.id(),
                process: &spec,
                pid_file: &pid_file,
                console: console.as_deref(),
                cwd: cwd.as_deref(),
                detach: true,
                stdio: io.runtime_stdio()?,
            })
            .await?;

        let record = Arc::new(ProcessRecord::load(
            process_dir.id(),
            (*process_dir).clone(),
            self.watcher.clone(),
        )?);
        record.attach_io(io);
        if let Err(e) = container.add_process(record.clone(), false) {
            // Nothing will ever track this process; do not leave it running.
            if let Err(kill_err) = record.signal(Signal::SIGKILL) {
                tracing::warn!(
                    container_id = %container.id(),
                    pid = record.pid(),
                    error = %kill_err,
                    "Failed to kill untracked process"
                );
            }
            // Detached right away; the watcher still reaps it.
            self.watcher.watch(&record);
            self.watcher.unwatch(&record);
            release_io(vec![record]).await?;
            return Err(e);
        }
        self.watcher.watch(&record);

        let process_dir = process_dir.commit();
        tracing::info!(
            container_id = %container.id(),
            process_id = %process_dir.id(),
            pid = record.pid(),
            "Started process"
        );
        Ok(record)
    }

    /// Send a signal to one process of a container.
    pub fn signal_process(
        &self,
        container: &Container,
        process_id: &str,
        signal: Signal,
    ) -> ShimResult<()> {
        tracing::debug!(container_id = %container.id(), process_id = %process_id, signal = %signal, "RuntimeDriver::signal_process called");
        container.get_process(process_id)?.signal(signal)
    }

    /// Wait for one process of a container to exit.
    pub async fn wait_process(&self, container: &Container, process_id: &str) -> ShimResult<u32> {
        tracing::debug!(container_id = %container.id(), process_id = %process_id, "RuntimeDriver::wait_process called");
        let record = container.get_process(process_id)?;
        record.wait().await
    }

    /// End a process's stdin.
    pub async fn close_stdin(&self, container: &Container, process_id: &str) -> ShimResult<()> {
        tracing::debug!(container_id = %container.id(), process_id = %process_id, "RuntimeDriver::close_stdin called");
        let record = container.get_process(process_id)?;
        // Stopping the stdin copier joins its thread.
        tokio::task::spawn_blocking(move || record.close_stdin())
            .await
            .map_err(|e| ShimError::Internal(format!("close stdin task failed: {}", e)))?
    }

    /// Resize the console of a process started with a terminal.
    pub fn resize_process(
        &self,
        container: &Container,
        process_id: &str,
        width: u16,
        height: u16,
    ) -> ShimResult<()> {
        tracing::debug!(container_id = %container.id(), process_id = %process_id, width, height, "RuntimeDriver::resize_process called");
        container.get_process(process_id)?.resize(width, height)
    }

    /// Forget an exec'd process and delete its state. Repeating it is a no-op.
    ///
    /// A process still running is not signaled; it is reaped once it exits.
    pub async fn delete_process(&self, container: &Container, process_id: &str) -> ShimResult<()> {
        tracing::debug!(container_id = %container.id(), process_id = %process_id, "RuntimeDriver::delete_process called");

        if process_id == INIT_PROCESS_ID {
            return Err(ShimError::InvalidArgument(
                "the init process is deleted with its container".into(),
            ));
        }
        validate_id("process", process_id)?;

        if let Some(record) = container.remove_process(process_id) {
            record.watcher().unwatch(&record);
            release_io(vec![record]).await?;
        }
        container.dir().delete_process_dir(process_id)
    }

    // ========================================================================
    // DISCOVERY
    // ========================================================================

    /// Every container known to both the runtime and this root.
    pub async fn list(&self) -> ShimResult<Vec<Arc<Container>>> {
        let states = self.runtime.list().await?;
        let mut containers = Vec::with_capacity(states.len());
        for state in states {
            if let Some(container) = self.materialize(&state.id)? {
                containers.push(container);
            }
        }
        Ok(containers)
    }

    /// Load one container by id.
    pub async fn load(&self, id: &str) -> ShimResult<Arc<Container>> {
        tracing::debug!(container_id = %id, "RuntimeDriver::load called");
        validate_id("container", id)?;

        // Fails with NotFound when the runtime does not know the id.
        self.runtime.state(id).await?;

        self.materialize(id)?.ok_or_else(|| {
            ShimError::NotFound(format!(
                "container {} has no state under {}",
                id,
                self.store.root().display()
            ))
        })
    }

    /// Cached container, or one rebuilt from its state directory.
    fn materialize(&self, id: &str) -> ShimResult<Option<Arc<Container>>> {
        if let Some(container) = self.registry.get(id) {
            return Ok(Some(container));
        }
        let Some(dir) = self.store.container_dir(id) else {
            tracing::debug!(container_id = %id, "Skipping container without state under this root");
            return Ok(None);
        };

        let rebuilt = Arc::new(self.rebuild(id, dir)?);
        let container = self.registry.insert_or_get(rebuilt.clone());
        if Arc::ptr_eq(&container, &rebuilt) {
            for record in container.processes() {
                self.watcher.watch(&record);
            }
        }
        Ok(Some(container))
    }

    fn rebuild(&self, id: &str, dir: ContainerDir) -> ShimResult<Container> {
        let bundle = dir.bundle()?;
        let container = Container::new(id, bundle, dir.clone());

        for process_dir in dir.list_process_dirs()? {
            let record = match ProcessRecord::load(
                process_dir.id(),
                process_dir.clone(),
                self.watcher.clone(),
            ) {
                Ok(record) => record,
                // The pid file is gone: the process died in between.
                Err(e) if e.is_not_found() => {
                    tracing::debug!(
                        container_id = %id,
                        process_id = %process_dir.id(),
                        "Skipping process without pid file"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            let is_init = process_dir.id() == INIT_PROCESS_ID;
            container.add_process(Arc::new(record), is_init)?;
        }

        tracing::debug!(container_id = %id, "Rebuilt container from state directory");
        Ok(container)
    }
}

/// Open stdio and, with `terminal`, a console. Runs on the blocking pool:
/// opening a fifo waits for its peer.
async fn open_io(stdio: StdioPaths, terminal: bool) -> ShimResult<(IoSet, Option<PathBuf>)> {
    tokio::task::spawn_blocking(move || -> ShimResult<(IoSet, Option<PathBuf>)> {
        let mut io = IoSet::open(&stdio)?;
        let console = if terminal {
            Some(io.attach_console()?.to_path_buf())
        } else {
            None
        };
        Ok((io, console))
    })
    .await
    .map_err(|e| ShimError::Internal(format!("stdio open task failed: {}", e)))?
}

/// Close the records' stdio on the blocking pool; it joins copy threads.
async fn release_io(records: Vec<Arc<ProcessRecord>>) -> ShimResult<()> {
    tokio::task::spawn_blocking(move || {
        for record in records {
            record.release_io();
        }
    })
    .await
    .map_err(|e| ShimError::Internal(format!("stdio release task failed: {}", e)))
}
