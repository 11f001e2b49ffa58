//! Scoped ownership of a freshly allocated state directory.

use std::ops::Deref;
use std::path::PathBuf;

/// A directory created by the store that is removed again unless committed.
///
/// Multi-step operations hold the guard while the rest of the work runs; any
/// early return drops it and the directory disappears with it. Calling
/// [`commit`](Allocated::commit) hands the value over and disarms the guard.
#[must_use = "dropping an uncommitted allocation removes its directory"]
pub struct Allocated<T: Clone> {
    value: T,
    path: PathBuf,
    armed: bool,
}

impl<T: Clone> Allocated<T> {
    pub(crate) fn new(value: T, path: PathBuf) -> Self {
        Self {
            value,
            path,
            armed: true,
        }
    }

    /// Keep the directory and return the allocated value.
    pub fn commit(mut self) -> T {
        self.armed = false;
        self.value.clone()
    }
}

impl<T: Clone> Deref for Allocated<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Clone> Drop for Allocated<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        tracing::debug!(path = %self.path.display(), "Rolling back state directory");

        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove state directory during rollback"
                );
            }
        }
    }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for Allocated<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocated")
            .field("value", &self.value)
            .field("armed", &self.armed)
            .finish()
    }
}
