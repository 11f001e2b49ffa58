//! Names and defaults used by the on-disk layout and the runtime client.

/// File and directory names inside a runtime root.
pub mod filenames {
    /// Bundle marker inside a container directory.
    pub const BUNDLE: &str = "bundle";
    /// Directory holding one sub-directory per process.
    pub const PROCESSES: &str = "processes";
    /// Pid file written by the low-level runtime.
    pub const PID: &str = "pid";
    /// Start-time marker written on first observation of a pid.
    pub const START_TIME: &str = "starttime";
    /// Default state root handed to the low-level runtime (`--root`).
    pub const RUNTIME_ROOT: &str = "runc";
    /// Log directory used by the debug binary.
    pub const LOGS: &str = "logs";
}

/// Fixed id of the container entry process.
pub const INIT_PROCESS_ID: &str = "init";

/// Environment variable overriding the default runtime root.
pub const ROOT_ENV: &str = "OCISHIM_ROOT";

/// Environment variable overriding the runtime binary.
pub const RUNTIME_ENV: &str = "OCISHIM_RUNTIME";

pub const DEFAULT_ROOT: &str = "/run/ocishim";

pub const DEFAULT_RUNTIME_BINARY: &str = "runc";

/// Poll period for the liveness-polling exit watcher.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
