//! Durable per-station processing state.
//!
//! The whole store is rewritten after every [`StateStore::record`] using a
//! temporary file in the target directory followed by an atomic rename, so a
//! reader never observes a truncated file.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tempfile::Builder;

use crate::domain::{ProcessingState, StationStatus, WorkItem};
use crate::error::InventoryError;

pub const DEFAULT_STATE_FILE: &str = "process_state.json";
const STATE_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    items: BTreeMap<String, ProcessingState>,
}

#[derive(Debug)]
pub struct StateStore {
    path: Utf8PathBuf,
    items: BTreeMap<String, ProcessingState>,
}

impl StateStore {
    /// Reads the store at `path`. A missing file yields an empty store.
    pub fn load(path: impl Into<Utf8PathBuf>) -> Result<Self, InventoryError> {
        let path = path.into();
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path, "no state file found, starting fresh");
                return Ok(Self {
                    path,
                    items: BTreeMap::new(),
                });
            }
            Err(err) => {
                return Err(InventoryError::StateCorrupt {
                    path: path.into_std_path_buf(),
                    message: err.to_string(),
                });
            }
        };

        let file: StateFile =
            serde_json::from_str(&content).map_err(|err| InventoryError::StateCorrupt {
                path: path.clone().into_std_path_buf(),
                message: err.to_string(),
            })?;
        if file.version != STATE_VERSION {
            return Err(InventoryError::StateCorrupt {
                path: path.into_std_path_buf(),
                message: format!("unsupported state version {}", file.version),
            });
        }
        for (key, state) in &file.items {
            if WorkItem::from_key(key).is_err() {
                return Err(InventoryError::StateCorrupt {
                    path: path.into_std_path_buf(),
                    message: format!("invalid item key {key}"),
                });
            }
            if state.is_completed() && state.output_path.as_deref().unwrap_or("").is_empty() {
                return Err(InventoryError::StateCorrupt {
                    path: path.into_std_path_buf(),
                    message: format!("completed item {key} has no output path"),
                });
            }
        }

        tracing::info!(path = %path, items = file.items.len(), "loaded state file");
        Ok(Self {
            path,
            items: file.items,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, item: &WorkItem) -> Option<&ProcessingState> {
        self.items.get(&item.key())
    }

    pub fn status(&self, item: &WorkItem) -> StationStatus {
        self.get(item).map(|state| state.status).unwrap_or_default()
    }

    pub fn is_completed(&self, item: &WorkItem) -> bool {
        self.get(item).is_some_and(ProcessingState::is_completed)
    }

    /// Upserts `state` for `item` and flushes the store to disk.
    ///
    /// `attempts` is carried over from the previous entry and incremented;
    /// `updated_at` is stamped with the current time.
    pub fn record(
        &mut self,
        item: &WorkItem,
        mut state: ProcessingState,
    ) -> Result<(), InventoryError> {
        let key = item.key();
        state.attempts = self.items.get(&key).map_or(0, |prev| prev.attempts) + 1;
        state.updated_at = Some(chrono::Utc::now().to_rfc3339());
        self.items.insert(key, state);
        self.flush()
    }

    pub fn flush(&self) -> Result<(), InventoryError> {
        let write_err = |message: String| InventoryError::StateWrite {
            path: self.path.clone().into_std_path_buf(),
            message,
        };

        let file = StateFileRef {
            version: STATE_VERSION,
            items: &self.items,
        };
        let mut content =
            serde_json::to_vec_pretty(&file).map_err(|err| write_err(err.to_string()))?;
        content.push(b'\n');

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        fs::create_dir_all(parent.as_std_path()).map_err(|err| write_err(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".process_state")
            .suffix(".tmp")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| write_err(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| write_err(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| write_err(err.to_string()))?;
        temp.persist(self.path.as_std_path())
            .map_err(|err| write_err(err.to_string()))?;
        #[cfg(unix)]
        fs::File::open(parent.as_std_path())
            .and_then(|dir| dir.sync_all())
            .map_err(|err| write_err(err.to_string()))?;
        Ok(())
    }

    pub fn entries(&self) -> impl Iterator<Item = (WorkItem, &ProcessingState)> {
        self.items
            .iter()
            .filter_map(|(key, state)| WorkItem::from_key(key).ok().map(|item| (item, state)))
    }

    pub fn failed(&self) -> Vec<(WorkItem, &ProcessingState)> {
        self.entries()
            .filter(|(_, state)| state.status == StationStatus::Failed)
            .collect()
    }
}

#[derive(Serialize)]
struct StateFileRef<'a> {
    version: u32,
    items: &'a BTreeMap<String, ProcessingState>,
}
