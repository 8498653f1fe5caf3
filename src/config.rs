use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::NetworkCode;
use crate::error::InventoryError;
use crate::fdsn::{FdsnSource, default_sources};

pub const DEFAULT_START_TIME: &str = "2010-01-01T00:00:00";
pub const DEFAULT_SOURCE: &str = "https://service.iris.edu";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_NEW_STATION_NETWORKS: [&str; 12] = [
    "2O", "3B", "AF", "AU", "IU", "II", "G", "GE", "IA", "JP", "IC", "IO",
];

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub fdsnxml2inv: Option<PathBuf>,
    #[serde(default)]
    pub scxmlmerge: Option<PathBuf>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub default_source: Option<String>,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub check_new_stations: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceEntry {
    pub url: String,
    #[serde(default)]
    pub networks: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub fdsnxml2inv: Option<PathBuf>,
    pub scxmlmerge: Option<PathBuf>,
    pub start_time: String,
    pub timeout: Duration,
    pub default_source: String,
    pub sources: Vec<FdsnSource>,
    pub check_new_stations: Vec<NetworkCode>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Without a path the built-in defaults are used.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, InventoryError> {
        let Some(path) = path else {
            return Self::resolve_config(ToolsConfig::default());
        };
        let config_path = PathBuf::from(path);
        let content = fs::read_to_string(&config_path)
            .map_err(|_| InventoryError::ConfigRead(config_path.clone()))?;
        let config: ToolsConfig = serde_json::from_str(&content)
            .map_err(|err| InventoryError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: ToolsConfig) -> Result<ResolvedConfig, InventoryError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(InventoryError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let start_time = config
            .start_time
            .unwrap_or_else(|| DEFAULT_START_TIME.to_string());
        chrono::NaiveDateTime::parse_from_str(&start_time, "%Y-%m-%dT%H:%M:%S")
            .map_err(|err| InventoryError::ConfigParse(format!("start_time {start_time}: {err}")))?;

        let mut sources = config
            .sources
            .into_iter()
            .map(|entry| {
                let networks = entry
                    .networks
                    .iter()
                    .map(|code| code.parse())
                    .collect::<Result<Vec<NetworkCode>, InventoryError>>()?;
                Ok(FdsnSource {
                    base_url: entry.url.trim_end_matches('/').to_string(),
                    networks,
                })
            })
            .collect::<Result<Vec<_>, InventoryError>>()?;
        sources.extend(default_sources());

        let check_new_stations = match config.check_new_stations {
            Some(codes) => codes
                .iter()
                .map(|code| code.parse())
                .collect::<Result<Vec<NetworkCode>, InventoryError>>()?,
            None => DEFAULT_NEW_STATION_NETWORKS
                .iter()
                .map(|code| code.parse())
                .collect::<Result<Vec<NetworkCode>, InventoryError>>()?,
        };

        Ok(ResolvedConfig {
            schema_version,
            fdsnxml2inv: config.fdsnxml2inv,
            scxmlmerge: config.scxmlmerge,
            start_time,
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            default_source: config
                .default_source
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            sources,
            check_new_stations,
        })
    }
}
