//! A container: its init process, its exec'd processes, and its state dir.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ocishim_shared::errors::{ShimError, ShimResult};
use ocishim_shared::status::ContainerStatus;
use parking_lot::Mutex;

use crate::oci::OciRuntime;
use crate::process::ProcessRecord;
use crate::runtime::constants::INIT_PROCESS_ID;
use crate::store::ContainerDir;

#[derive(Default)]
struct ProcessTable {
    init: Option<Arc<ProcessRecord>>,
    execs: HashMap<String, Arc<ProcessRecord>>,
}

/// Aggregate of one init process and any number of exec'd processes.
///
/// Status is not stored: every [`status`](Container::status) call asks the
/// runtime.
pub struct Container {
    id: String,
    bundle: PathBuf,
    dir: ContainerDir,
    processes: Mutex<ProcessTable>,
}

impl Container {
    pub(crate) fn new(id: &str, bundle: PathBuf, dir: ContainerDir) -> Self {
        Self {
            id: id.to_string(),
            bundle,
            dir,
            processes: Mutex::new(ProcessTable::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bundle(&self) -> &Path {
        &self.bundle
    }

    pub fn dir(&self) -> &ContainerDir {
        &self.dir
    }

    /// Add a process. `is_init` places it in the init slot.
    ///
    /// Fails with `AlreadyExists` if the slot or exec id is taken.
    pub fn add_process(&self, record: Arc<ProcessRecord>, is_init: bool) -> ShimResult<()> {
        let mut table = self.processes.lock();
        if is_init {
            if table.init.is_some() {
                return Err(ShimError::AlreadyExists(format!(
                    "container {} already has an init process",
                    self.id
                )));
            }
            table.init = Some(record);
            return Ok(());
        }

        if record.id() == INIT_PROCESS_ID || table.execs.contains_key(record.id()) {
            return Err(ShimError::AlreadyExists(format!(
                "process {} already exists in container {}",
                record.id(),
                self.id
            )));
        }
        table.execs.insert(record.id().to_string(), record);
        Ok(())
    }

    /// Look up a process by id (`"init"` for the init process).
    pub fn get_process(&self, id: &str) -> ShimResult<Arc<ProcessRecord>> {
        let table = self.processes.lock();
        let record = if id == INIT_PROCESS_ID {
            table.init.clone()
        } else {
            table.execs.get(id).cloned()
        };
        record.ok_or_else(|| {
            ShimError::NotFound(format!("process {} not found in container {}", id, self.id))
        })
    }

    pub fn has_process(&self, id: &str) -> bool {
        self.get_process(id).is_ok()
    }

    pub fn init(&self) -> Option<Arc<ProcessRecord>> {
        self.processes.lock().init.clone()
    }

    /// Remove an exec'd process. The init process is never removed here.
    pub fn remove_process(&self, id: &str) -> Option<Arc<ProcessRecord>> {
        if id == INIT_PROCESS_ID {
            return None;
        }
        self.processes.lock().execs.remove(id)
    }

    /// Every process, init first.
    pub fn processes(&self) -> Vec<Arc<ProcessRecord>> {
        let table = self.processes.lock();
        let mut execs: Vec<_> = table.execs.values().cloned().collect();
        execs.sort_by(|a, b| a.id().cmp(b.id()));
        table.init.iter().cloned().chain(execs).collect()
    }

    /// Take every process out of the container.
    pub(crate) fn drain_processes(&self) -> Vec<Arc<ProcessRecord>> {
        let mut table = self.processes.lock();
        let mut drained: Vec<_> = table.init.take().into_iter().collect();
        drained.extend(table.execs.drain().map(|(_, record)| record));
        drained
    }

    /// Status as reported by the runtime. A container the runtime no longer
    /// knows is Stopped.
    pub async fn status(&self, runtime: &dyn OciRuntime) -> ShimResult<ContainerStatus> {
        match runtime.state(&self.id).await {
            Ok(state) => Ok(ContainerStatus::from_runtime(&state.status)),
            Err(e) if e.is_not_found() => Ok(ContainerStatus::Stopped),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.processes.lock();
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("bundle", &self.bundle)
            .field("init", &table.init.as_ref().map(|p| p.pid()))
            .field("execs", &table.execs.len())
            .finish()
    }
}
