use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum InventoryError {
    #[error("invalid network code: {0}")]
    InvalidNetworkCode(String),

    #[error("invalid station code: {0}")]
    InvalidStationCode(String),

    #[error("failed to parse station catalog {path}: {message}")]
    #[diagnostic(help("the catalog must be a SeisComP configuration XML with station parameter sets"))]
    CatalogParse { path: PathBuf, message: String },

    #[error("state file {path} is corrupt: {message}")]
    #[diagnostic(help("fix or remove the state file; it is never discarded automatically"))]
    StateCorrupt { path: PathBuf, message: String },

    #[error("failed to write state file {path}: {message}")]
    StateWrite { path: PathBuf, message: String },

    #[error("failed to read tools config at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse tools config: {0}")]
    ConfigParse(String),

    #[error("FDSN request failed: {0}")]
    Fetch(String),

    #[error("FDSN service returned status {status}: {message}")]
    FetchStatus { status: u16, message: String },

    #[error("no data available for {0}")]
    NoData(String),

    #[error("conversion failed: {0}")]
    Convert(String),

    #[error("merge failed: {0}")]
    Merge(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
