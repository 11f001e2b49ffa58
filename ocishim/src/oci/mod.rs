//! Low-level OCI runtime interface.
//!
//! The driver never runs the sandbox itself. It asks an [`OciRuntime`] to
//! create, start, signal and delete containers and to exec extra processes;
//! [`RuncClient`] is the production implementation invoking a runc-compatible
//! binary.

mod runc;

pub use runc::RuncClient;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use ocishim_shared::errors::ShimResult;
use serde::{Deserialize, Serialize};

use crate::io::RuntimeStdio;

/// State of one container as reported by the runtime (`state`, `list`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub id: String,
    #[serde(default)]
    pub pid: u32,
    pub status: String,
    #[serde(alias = "bundlePath", default)]
    pub bundle: PathBuf,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

/// Arguments of `create`.
#[derive(Debug)]
pub struct CreateRequest<'a> {
    pub id: &'a str,
    pub bundle: &'a Path,
    pub pid_file: &'a Path,
    pub console: Option<&'a Path>,
    pub stdio: RuntimeStdio,
}

/// Arguments of `exec`.
#[derive(Debug)]
pub struct ExecRequest<'a> {
    pub id: &'a str,
    pub process: &'a oci_spec::runtime::Process,
    pub pid_file: &'a Path,
    pub console: Option<&'a Path>,
    pub cwd: Option<&'a Path>,
    pub detach: bool,
    pub stdio: RuntimeStdio,
}

/// Operations consumed from the low-level runtime.
///
/// Implementations report an unknown container id as `NotFound` and any
/// other failure as `Runtime`.
#[async_trait::async_trait]
pub trait OciRuntime: Send + Sync {
    /// Create a container from a bundle; the runtime writes the init pid
    /// to `pid_file`.
    async fn create(&self, request: CreateRequest<'_>) -> ShimResult<()>;

    /// Run the user process of a created container.
    async fn start(&self, id: &str) -> ShimResult<()>;

    async fn state(&self, id: &str) -> ShimResult<RuntimeState>;

    async fn pause(&self, id: &str) -> ShimResult<()>;

    async fn resume(&self, id: &str) -> ShimResult<()>;

    async fn delete(&self, id: &str) -> ShimResult<()>;

    /// Signal the init process, or every process of the container with `all`.
    async fn kill(&self, id: &str, signal: Signal, all: bool) -> ShimResult<()>;

    /// Start an extra process inside a running container.
    async fn exec(&self, request: ExecRequest<'_>) -> ShimResult<()>;

    async fn list(&self) -> ShimResult<Vec<RuntimeState>>;
}
