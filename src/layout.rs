use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use crate::domain::{NetworkCode, WorkItem};
use crate::error::InventoryError;

pub const CONVERTED_PREFIX: &str = "seiscomp_";

/// Deterministic placement of fetched, converted and merged files under one
/// output directory.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: Utf8PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn station_dir(&self, item: &WorkItem) -> Utf8PathBuf {
        self.root
            .join(item.network.as_str())
            .join(item.station.as_str())
    }

    pub fn raw_path(&self, item: &WorkItem) -> Utf8PathBuf {
        self.station_dir(item).join(format!("{item}.xml"))
    }

    pub fn converted_path(&self, item: &WorkItem) -> Utf8PathBuf {
        converted_path_for(&self.raw_path(item))
    }

    pub fn merged_path(&self, network: &NetworkCode) -> Utf8PathBuf {
        self.root.join(format!("{network}.xml"))
    }

    pub fn ensure_root(&self) -> Result<(), InventoryError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| InventoryError::Filesystem(format!("create {}: {err}", self.root)))
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), InventoryError> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| InventoryError::Filesystem(format!("create {parent}: {err}")))?;
        let mut temp = Builder::new()
            .prefix(".station-inventory")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| InventoryError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| InventoryError::Filesystem(format!("write {path}: {err}")))?;
        temp.persist(path.as_std_path())
            .map_err(|err| InventoryError::Filesystem(format!("persist {path}: {err}")))?;
        Ok(())
    }
}

/// Converted files sit next to their input with a `seiscomp_` prefix.
pub fn converted_path_for(input: &Utf8Path) -> Utf8PathBuf {
    let name = input.file_name().unwrap_or("station.xml");
    input.with_file_name(format!("{CONVERTED_PREFIX}{name}"))
}
