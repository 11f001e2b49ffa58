//! Container and process status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Exit code reported when the real one cannot be known (the process was not
/// reapable by this shim, or it could not be watched at all).
pub const UNKNOWN_EXIT_CODE: u32 = 255;

/// Container-level status as reported by the low-level runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Unknown,
}

impl ContainerStatus {
    /// Map a runtime status string onto the model.
    ///
    /// `creating` is folded into `Created` and `pausing` into `Paused`;
    /// anything unrecognized becomes `Unknown`.
    pub fn from_runtime(status: &str) -> Self {
        match status {
            "creating" | "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "pausing" | "paused" => ContainerStatus::Paused,
            "stopped" => ContainerStatus::Stopped,
            _ => ContainerStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness of a single tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Stopped,
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Running => f.write_str("running"),
            ProcessStatus::Stopped => f.write_str("stopped"),
        }
    }
}
