//! SeisComP configuration XML catalog.
//!
//! Only `parameterSet` elements whose `publicID` names a station binding
//! (`ParameterSet/trunk/Station/<NET>/<STA>/...`) are of interest. Everything
//! else in the document is ignored.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::domain::{NetworkCode, StationCode};
use crate::error::InventoryError;

const STATION_PREFIX: &str = "ParameterSet/trunk/Station/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub network: NetworkCode,
    pub station: StationCode,
    pub public_id: String,
    pub detec_stream: Option<String>,
    pub detec_locid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStations {
    pub network: NetworkCode,
    pub stations: Vec<StationCode>,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let content = fs::read_to_string(path).map_err(|err| InventoryError::CatalogParse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::parse(&content, path)
    }

    /// Parses catalog XML; `origin` is only used for error reporting.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, InventoryError> {
        let sets = station_parameter_sets(content).map_err(|message| {
            InventoryError::CatalogParse {
                path: origin.to_path_buf(),
                message,
            }
        })?;

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for set in sets {
            let Some((network, station)) = split_station_id(&set.public_id) else {
                tracing::warn!(public_id = %set.public_id, "skipping malformed station entry");
                continue;
            };
            let codes = network
                .parse::<NetworkCode>()
                .and_then(|net| station.parse::<StationCode>().map(|sta| (net, sta)));
            let (network, station) = match codes {
                Ok(codes) => codes,
                Err(err) => {
                    tracing::warn!(public_id = %set.public_id, "skipping station entry: {err}");
                    continue;
                }
            };
            if !seen.insert((network.clone(), station.clone())) {
                tracing::debug!(public_id = %set.public_id, "duplicate station entry ignored");
                continue;
            }
            entries.push(CatalogEntry {
                network,
                station,
                detec_stream: set.parameter("detecStream"),
                detec_locid: set.parameter("detecLocid").unwrap_or_default(),
                public_id: set.public_id,
            });
        }

        if entries.is_empty() {
            return Err(InventoryError::CatalogParse {
                path: origin.to_path_buf(),
                message: "no station entries found".to_string(),
            });
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Networks in order of first appearance, each with its stations in
    /// catalog order.
    pub fn networks(&self) -> Vec<NetworkStations> {
        let mut out: Vec<NetworkStations> = Vec::new();
        for entry in &self.entries {
            match out.iter_mut().find(|group| group.network == entry.network) {
                Some(group) => group.stations.push(entry.station.clone()),
                None => out.push(NetworkStations {
                    network: entry.network.clone(),
                    stations: vec![entry.station.clone()],
                }),
            }
        }
        out
    }

    pub fn select(&self, filter: Option<&[NetworkCode]>) -> Vec<NetworkStations> {
        let networks = self.networks();
        let Some(filter) = filter else {
            return networks;
        };
        for code in filter {
            if !networks.iter().any(|group| &group.network == code) {
                tracing::warn!(network = %code, "network not present in catalog");
            }
        }
        networks
            .into_iter()
            .filter(|group| filter.contains(&group.network))
            .collect()
    }
}

/// SeisComP configuration document
#[derive(Debug, Deserialize)]
struct SeiscompDocument {
    #[serde(rename = "Config", default)]
    configs: Vec<ConfigSection>,
}

#[derive(Debug, Deserialize)]
struct ConfigSection {
    #[serde(rename = "parameterSet", default)]
    parameter_sets: Vec<ParameterSet>,
}

#[derive(Debug, Deserialize)]
struct ParameterSet {
    #[serde(rename = "@publicID", default)]
    public_id: String,
    #[serde(rename = "parameter", default)]
    parameters: Vec<Parameter>,
}

#[derive(Debug, Deserialize)]
struct Parameter {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: Option<String>,
}

impl ParameterSet {
    fn parameter(&self, name: &str) -> Option<String> {
        self.parameters
            .iter()
            .find(|parameter| parameter.name == name)
            .and_then(|parameter| parameter.value.clone())
            .filter(|value| !value.is_empty())
    }
}

fn station_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^ParameterSet/trunk/Station/([^/]+)/([^/]+)(?:/|$)").expect("valid regex")
    })
}

fn split_station_id(public_id: &str) -> Option<(&str, &str)> {
    let caps = station_id_regex().captures(public_id)?;
    let network = caps.get(1)?.as_str();
    let station = caps.get(2)?.as_str();
    Some((network, station))
}

fn station_parameter_sets(content: &str) -> Result<Vec<ParameterSet>, String> {
    let document: SeiscompDocument =
        quick_xml::de::from_str(content).map_err(|err| err.to_string())?;
    Ok(document
        .configs
        .into_iter()
        .flat_map(|config| config.parameter_sets)
        .filter(|set| set.public_id.starts_with(STATION_PREFIX))
        .collect())
}
