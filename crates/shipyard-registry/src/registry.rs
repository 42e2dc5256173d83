use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::record::{AgentState, RegistryEntry};
use crate::store::{JsonlStore, RecordStore};

pub const REGISTRY_DIR: &str = ".shipyard";
pub const REGISTRY_FILE: &str = "containers.jsonl";

/// How many recent rows `find` looks through.
pub const FIND_WINDOW: usize = 200;

/// Append-only lifecycle log of agents started from this host.
///
/// Mutations read the whole file and write it back, so two processes racing
/// on `mark_stopped` can lose one of the updates.
#[derive(Clone, Debug)]
pub struct Registry<S = JsonlStore<RegistryEntry>> {
    store: S,
    path: PathBuf,
}

impl Registry {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            store: JsonlStore::new(path.clone()),
            path,
        }
    }

    /// Registry kept under the tool's install root.
    pub fn at_root(root: impl AsRef<Path>) -> Self {
        Self::open(root.as_ref().join(REGISTRY_DIR).join(REGISTRY_FILE))
    }
}

impl<S: RecordStore<RegistryEntry>> Registry<S> {
    pub fn with_store(store: S, path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, state: &AgentState) -> Result<RegistryEntry, RegistryError> {
        let entry = RegistryEntry::new(state.clone(), Utc::now());
        self.store.append(&entry)?;
        info!(
            container_name = %state.container_name(),
            kind = state.kind().as_str(),
            base_url = %state.base_url(),
            "registered agent"
        );
        Ok(entry)
    }

    /// Stamp `stoppedAt` on the newest running row for `container_name`, or on
    /// the newest running row of any name when `None`. Returns whether a row
    /// changed.
    pub fn mark_stopped(&self, container_name: Option<&str>) -> Result<bool, RegistryError> {
        let updated = self.store.find_and_update(
            |entry| {
                entry.stopped_at.is_none()
                    && container_name.map_or(true, |name| entry.container_name() == name)
            },
            |entry| entry.stopped_at = Some(Utc::now()),
        )?;
        match &updated {
            Some(entry) => info!(container_name = %entry.container_name(), "marked agent stopped"),
            None => debug!(container_name = ?container_name, "no running registry row to stop"),
        }
        Ok(updated.is_some())
    }

    /// Drop `stoppedAt` from the newest stopped row for `container_name`.
    pub fn clear_stopped(&self, container_name: &str) -> Result<bool, RegistryError> {
        let updated = self.store.find_and_update(
            |entry| entry.stopped_at.is_some() && entry.container_name() == container_name,
            |entry| entry.stopped_at = None,
        )?;
        if updated.is_some() {
            info!(%container_name, "cleared stopped mark");
        }
        Ok(updated.is_some())
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<RegistryEntry>, RegistryError> {
        self.store.scan_recent(limit)
    }

    pub fn find(&self, container_name: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        Ok(self
            .store
            .scan_recent(FIND_WINDOW)?
            .into_iter()
            .rev()
            .find(|entry| entry.container_name() == container_name))
    }
}
