//! Configuration for a runtime driver and the per-call option types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ocishim_shared::errors::{ShimError, ShimResult};
use serde::{Deserialize, Serialize};

use crate::runtime::constants::{
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_ROOT, DEFAULT_RUNTIME_BINARY, ROOT_ENV, RUNTIME_ENV,
    filenames,
};

/// How process exits are observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitMode {
    /// Use pidfd notifications when the kernel supports them, polling otherwise.
    #[default]
    Auto,
    /// Always use the epoll-based exit monitor.
    Notify,
    /// Always poll liveness on demand.
    Poll,
}

/// Log format passed to the low-level runtime (`--log-format`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeLogFormat {
    Text,
    Json,
}

impl RuntimeLogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeLogFormat::Text => "text",
            RuntimeLogFormat::Json => "json",
        }
    }
}

/// How to invoke the low-level runtime binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Binary name or path (`runc`, `crun`, ...).
    pub binary: PathBuf,
    /// State root for the runtime; defaults to `<root>/runc`.
    pub root: Option<PathBuf>,
    /// Extra global arguments inserted before the verb.
    pub args: Vec<String>,
    pub debug: bool,
    /// Runtime log file (`--log`).
    pub log: Option<PathBuf>,
    pub log_format: Option<RuntimeLogFormat>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let binary = std::env::var_os(RUNTIME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_BINARY));
        Self {
            binary,
            root: None,
            args: Vec::new(),
            debug: false,
            log: None,
            log_format: None,
        }
    }
}

/// Logging configuration for binaries embedding the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for daily-rolling log files; stderr only when unset.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

/// Options for a [`RuntimeDriver`](crate::RuntimeDriver).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimOptions {
    /// Runtime root holding one directory per container.
    pub root: PathBuf,
    pub runtime: RuntimeOptions,
    pub exit_mode: ExitMode,
    /// Poll period for [`ExitMode::Poll`].
    pub poll_interval_ms: u64,
    /// Become child subreaper so orphaned container processes can be reaped.
    pub subreaper: bool,
    pub logging: LoggingOptions,
}

impl Default for ShimOptions {
    fn default() -> Self {
        let root = std::env::var_os(ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
        Self {
            root,
            runtime: RuntimeOptions::default(),
            exit_mode: ExitMode::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            subreaper: true,
            logging: LoggingOptions::default(),
        }
    }
}

impl ShimOptions {
    /// Options rooted at `root`, everything else default.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> ShimResult<Self> {
        let data = std::fs::read(path).map_err(|e| {
            ShimError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&data)
            .map_err(|e| ShimError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Validate options before any side effect.
    pub fn sanitize(&self) -> ShimResult<()> {
        if self.root.as_os_str().is_empty() {
            return Err(ShimError::Config(
                "runtime root cannot be an empty string".into(),
            ));
        }
        if !self.root.is_absolute() {
            return Err(ShimError::Config(format!(
                "runtime root must be an absolute path, got: {}",
                self.root.display()
            )));
        }
        if self.runtime.binary.as_os_str().is_empty() {
            return Err(ShimError::Config("runtime binary cannot be empty".into()));
        }
        if self.exit_mode == ExitMode::Poll && self.poll_interval_ms == 0 {
            return Err(ShimError::Config(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// State root handed to the low-level runtime.
    pub fn runtime_root(&self) -> PathBuf {
        self.runtime
            .root
            .clone()
            .unwrap_or_else(|| self.root.join(filenames::RUNTIME_ROOT))
    }

    /// Paths that may live under `root` without being container state.
    pub fn reserved_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.runtime_root(), self.root.join(filenames::LOGS)];
        if let Some(dir) = &self.logging.dir {
            paths.push(dir.clone());
        }
        paths
    }

    /// Reject a container id whose state directory would hold one of the
    /// [`reserved_paths`](Self::reserved_paths). Deleting such a container
    /// would wipe the runtime's state for every other container.
    pub fn check_container_id(&self, id: &str) -> ShimResult<()> {
        let dir = self.root.join(id);
        match self.reserved_paths().into_iter().find(|p| p.starts_with(&dir)) {
            Some(path) => Err(ShimError::InvalidArgument(format!(
                "container id {:?} is reserved: {} is not container state",
                id,
                path.display()
            ))),
            None => Ok(()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Standard stream paths for a new process. `None` means `/dev/null`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StdioPaths {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// Options for creating a container.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub stdio: StdioPaths,
    /// Attach the init process to a pseudo-terminal.
    pub terminal: bool,
}

/// Options for starting an extra process inside a container.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Explicit process id; a sequential one is generated when unset.
    pub id: Option<String>,
    pub spec: oci_spec::runtime::Process,
    pub stdio: StdioPaths,
    pub terminal: bool,
}

impl ProcessOptions {
    pub fn new(spec: oci_spec::runtime::Process) -> Self {
        Self {
            id: None,
            spec,
            stdio: StdioPaths::default(),
            terminal: false,
        }
    }
}
