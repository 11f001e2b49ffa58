//! Execution core of an OCI container shim.
//!
//! Turns OCI bundles into running, observable processes on top of a
//! runc-compatible runtime binary, and keeps enough state on disk to pick
//! everything up again after the shim itself restarts.
//!
//! - [`RuntimeDriver`]: create/start/pause/resume/delete containers, exec,
//!   signal, wait for and delete extra processes, list and load
//! - [`StateStore`]: per-container and per-process state directories
//! - [`IoSet`]: stdio endpoints and the optional console bridge
//! - [`ProcessRecord`]: pid, start-time based liveness, exit code
//! - [`ExitMonitor`]: pidfd/epoll exit notifications for every process

pub mod container;
pub mod io;
mod logging;
pub mod monitor;
pub mod oci;
pub mod process;
pub mod runtime;
pub mod store;
pub mod util;

pub use container::Container;
pub use io::{IoSet, RuntimeStdio};
pub use logging::{LogGuard, init_logging};
pub use monitor::{ExitMonitor, exit_watcher};
pub use oci::{OciRuntime, RuncClient, RuntimeState};
pub use process::{ExitWatcher, PollingWatcher, ProcessRecord};
pub use runtime::{
    CreateOptions, ExitMode, LoggingOptions, ProcessOptions, RuntimeDriver, RuntimeOptions,
    ShimOptions, StdioPaths,
};
pub use store::{Allocated, ContainerDir, ProcessDir, StateStore};

pub use ocishim_shared::{ContainerStatus, ProcessStatus, ShimError, ShimResult, UNKNOWN_EXIT_CODE};
