use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::InventoryError;

const MAX_CODE_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkCode(String);

impl NetworkCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NetworkCode {
    type Err = InventoryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !is_valid_code(normalized) {
            return Err(InventoryError::InvalidNetworkCode(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StationCode(String);

impl StationCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StationCode {
    type Err = InventoryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !is_valid_code(normalized) {
            return Err(InventoryError::InvalidStationCode(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

fn is_valid_code(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_CODE_LEN
        && value.chars().all(|ch| ch.is_ascii_alphanumeric())
}

/// One unit of pipeline work: a single station of a single network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkItem {
    pub network: NetworkCode,
    pub station: StationCode,
}

impl WorkItem {
    pub fn new(network: NetworkCode, station: StationCode) -> Self {
        Self { network, station }
    }

    /// Stable string key used by the state file, e.g. `AU.ARMA`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.network, self.station)
    }

    pub fn from_key(key: &str) -> Result<Self, InventoryError> {
        let (network, station) = key
            .split_once('.')
            .ok_or_else(|| InventoryError::InvalidStationCode(key.to_string()))?;
        Ok(Self {
            network: network.parse()?,
            station: station.parse()?,
        })
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.network, self.station)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for StationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationStatus::Pending => write!(f, "pending"),
            StationStatus::Completed => write!(f, "completed"),
            StationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Durable record of the last attempt for one [`WorkItem`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessingState {
    pub status: StationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl ProcessingState {
    pub fn completed(output_path: String, raw_path: String, content_hash: String) -> Self {
        Self {
            status: StationStatus::Completed,
            output_path: Some(output_path),
            raw_path: Some(raw_path),
            content_hash: Some(content_hash),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StationStatus::Failed,
            last_attempt_error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Keeps the raw file location of a failed attempt so it can be inspected.
    pub fn with_raw_path(mut self, raw_path: String) -> Self {
        self.raw_path = Some(raw_path);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == StationStatus::Completed
    }
}
