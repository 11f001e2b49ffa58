//! RAII cleanup of a container the runtime has already accepted.

use std::sync::Arc;

use nix::sys::signal::Signal;

use crate::oci::OciRuntime;

/// Kills and deletes a runtime container unless disarmed.
///
/// The error path awaits [`rollback`](CleanupGuard::rollback) so the cleanup
/// finishes before the error is returned. If the owning future is dropped
/// instead, `Drop` spawns the same cleanup on the current tokio runtime.
pub(crate) struct CleanupGuard {
    runtime: Arc<dyn OciRuntime>,
    container_id: String,
    armed: bool,
}

impl CleanupGuard {
    pub(crate) fn new(runtime: Arc<dyn OciRuntime>, container_id: &str) -> Self {
        Self {
            runtime,
            container_id: container_id.to_string(),
            armed: true,
        }
    }

    /// Disarm the guard (call on success).
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }

    /// Run the cleanup now. Failures are logged, never returned.
    pub(crate) async fn rollback(mut self) {
        tracing::warn!(container_id = %self.container_id, "Container creation failed, cleaning up");
        cleanup(self.runtime.as_ref(), &self.container_id).await;
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        tracing::warn!(
            container_id = %self.container_id,
            "Container creation cancelled, cleaning up in background"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let runtime = self.runtime.clone();
                let container_id = std::mem::take(&mut self.container_id);
                handle.spawn(async move {
                    cleanup(runtime.as_ref(), &container_id).await;
                });
            }
            Err(e) => {
                tracing::warn!(
                    container_id = %self.container_id,
                    error = %e,
                    "No async runtime available, container left behind"
                );
            }
        }
    }
}

async fn cleanup(runtime: &dyn OciRuntime, container_id: &str) {
    if let Err(e) = runtime.kill(container_id, Signal::SIGKILL, false).await {
        tracing::warn!(container_id = %container_id, error = %e, "Failed to kill container during cleanup");
    }
    if let Err(e) = runtime.delete(container_id).await {
        tracing::warn!(container_id = %container_id, error = %e, "Failed to delete container during cleanup");
    }
}
