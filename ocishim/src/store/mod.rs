//! Durable on-disk index of containers and their processes.
//!
//! Layout under one runtime root:
//!
//! ```text
//! <root>/<container-id>/bundle
//! <root>/<container-id>/processes/<process-id>/pid
//! <root>/<container-id>/processes/<process-id>/starttime
//! ```
//!
//! The tree is the only source of truth across shim restarts. Nothing here
//! locks; callers serialize operations on the same container id.

mod guard;

pub use guard::Allocated;

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use ocishim_shared::errors::{ShimError, ShimResult};

use crate::runtime::constants::{INIT_PROCESS_ID, filenames};

/// Attempts at claiming the next sequential process id before giving up.
const MAX_ALLOCATION_ATTEMPTS: usize = 16;

/// Handle on one runtime root.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open a store, creating the root directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> ShimResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| storage_error("create root", &root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate the directory for a new container and record its bundle.
    ///
    /// Fails with `AlreadyExists` if the id is already present on disk; the
    /// existing directory is left untouched.
    pub fn new_container_dir(
        &self,
        id: &str,
        bundle: &Path,
    ) -> ShimResult<Allocated<ContainerDir>> {
        let path = self.root.join(id);
        create_exclusive(&path, "container", id)?;

        let allocated = Allocated::new(
            ContainerDir {
                id: id.to_string(),
                path: path.clone(),
            },
            path.clone(),
        );

        let processes = path.join(filenames::PROCESSES);
        fs::create_dir(&processes).map_err(|e| storage_error("create", &processes, e))?;

        let marker = path.join(filenames::BUNDLE);
        fs::write(&marker, bundle.as_os_str().as_encoded_bytes())
            .map_err(|e| storage_error("write", &marker, e))?;

        tracing::trace!(container_id = %id, path = %path.display(), "Allocated container directory");
        Ok(allocated)
    }

    /// Look up an existing container directory.
    pub fn container_dir(&self, id: &str) -> Option<ContainerDir> {
        let path = self.root.join(id);
        if path.join(filenames::BUNDLE).is_file() {
            Some(ContainerDir {
                id: id.to_string(),
                path,
            })
        } else {
            None
        }
    }

    /// Every container directory under the root.
    ///
    /// Entries without a bundle marker (the runtime's own state root, stray
    /// files, half-written allocations) are not containers and are skipped.
    pub fn list_container_dirs(&self) -> ShimResult<Vec<ContainerDir>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_error("read", &self.root, e)),
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| storage_error("read", &self.root, e))?;
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(dir) = self.container_dir(&id) {
                dirs.push(dir);
            }
        }
        dirs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(dirs)
    }

    /// Remove a container sub-tree. Absent directories are not an error.
    pub fn delete_container_dir(&self, dir: &ContainerDir) -> ShimResult<()> {
        remove_tree(&dir.path)
    }
}

/// State directory of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDir {
    id: String,
    path: PathBuf,
}

impl ContainerDir {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn processes_path(&self) -> PathBuf {
        self.path.join(filenames::PROCESSES)
    }

    /// Bundle path recorded at allocation.
    pub fn bundle(&self) -> ShimResult<PathBuf> {
        let marker = self.path.join(filenames::BUNDLE);
        let raw = fs::read_to_string(&marker).map_err(|e| storage_error("read", &marker, e))?;
        Ok(PathBuf::from(raw.trim_end_matches('\n')))
    }

    /// Allocate a process directory.
    ///
    /// With `id == None` the next sequential id is chosen: one more than the
    /// largest numeric id on disk, so ids are never reused while present.
    pub fn new_process_dir(&self, id: Option<&str>) -> ShimResult<Allocated<ProcessDir>> {
        if let Some(id) = id {
            let dir = self.process_dir(id);
            create_exclusive(&dir.path, "process", id)?;
            let path = dir.path.clone();
            return Ok(Allocated::new(dir, path));
        }

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let next = self.max_sequential_id()? + 1;
            let dir = self.process_dir(&next.to_string());
            match fs::create_dir(&dir.path) {
                Ok(()) => {
                    let path = dir.path.clone();
                    return Ok(Allocated::new(dir, path));
                }
                // Lost a race with a concurrent allocation; re-scan.
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(storage_error("create", &dir.path, e)),
            }
        }

        Err(ShimError::Storage(format!(
            "could not allocate a process id in {}",
            self.path.display()
        )))
    }

    fn max_sequential_id(&self) -> ShimResult<u64> {
        Ok(self
            .process_ids()?
            .iter()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .unwrap_or(0))
    }

    fn process_ids(&self) -> ShimResult<Vec<String>> {
        let processes = self.processes_path();
        let entries = match fs::read_dir(&processes) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_error("read", &processes, e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| storage_error("read", &processes, e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir && let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        Ok(ids)
    }

    /// Handle on a process directory, whether or not it exists yet.
    pub fn process_dir(&self, id: &str) -> ProcessDir {
        ProcessDir {
            id: id.to_string(),
            path: self.processes_path().join(id),
        }
    }

    /// Every process directory of this container, `init` first.
    pub fn list_process_dirs(&self) -> ShimResult<Vec<ProcessDir>> {
        let mut ids = self.process_ids()?;
        ids.sort_by(|a, b| {
            (a != INIT_PROCESS_ID)
                .cmp(&(b != INIT_PROCESS_ID))
                .then_with(|| a.cmp(b))
        });
        Ok(ids.iter().map(|id| self.process_dir(id)).collect())
    }

    /// Remove one process directory. Absent directories are not an error.
    pub fn delete_process_dir(&self, id: &str) -> ShimResult<()> {
        remove_tree(&self.process_dir(id).path)
    }
}

/// State directory of one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDir {
    id: String,
    path: PathBuf,
}

impl ProcessDir {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the runtime is told to write the pid.
    pub fn pid_file(&self) -> PathBuf {
        self.path.join(filenames::PID)
    }

    /// Read the pid written by the runtime.
    ///
    /// `NotFound` when the file is missing; `Runtime` when its content is not
    /// a decimal pid.
    pub fn read_pid(&self) -> ShimResult<u32> {
        let file = self.pid_file();
        let raw = match fs::read_to_string(&file) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ShimError::NotFound(format!(
                    "pid file {} does not exist",
                    file.display()
                )));
            }
            Err(e) => return Err(storage_error("read", &file, e)),
        };
        match raw.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(pid),
            _ => Err(ShimError::Runtime(format!(
                "bad pid file {}: {:?}",
                file.display(),
                raw
            ))),
        }
    }

    /// Persisted start-time marker, if one has been written.
    pub fn read_start_time(&self) -> ShimResult<Option<String>> {
        let file = self.path.join(filenames::START_TIME);
        match fs::read_to_string(&file) {
            Ok(raw) => Ok(Some(raw.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("read", &file, e)),
        }
    }

    pub fn write_start_time(&self, start_time: &str) -> ShimResult<()> {
        let file = self.path.join(filenames::START_TIME);
        fs::write(&file, start_time).map_err(|e| storage_error("write", &file, e))
    }
}

fn create_exclusive(path: &Path, kind: &str, id: &str) -> ShimResult<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(ShimError::AlreadyExists(format!(
            "{} {} already exists",
            kind, id
        ))),
        Err(e) => Err(storage_error("create", path, e)),
    }
}

fn remove_tree(path: &Path) -> ShimResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(storage_error("remove", path, e)),
    }
}

fn storage_error(action: &str, path: &Path, e: io::Error) -> ShimError {
    ShimError::Storage(format!("failed to {} {}: {}", action, path.display(), e))
}
