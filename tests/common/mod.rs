#![allow(dead_code)]

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use station_inventory::catalog::Catalog;
use station_inventory::domain::{NetworkCode, StationCode};
use station_inventory::error::InventoryError;
use station_inventory::fdsn::FdsnClient;
use station_inventory::layout::{OutputLayout, converted_path_for};
use station_inventory::output::JsonOutput;
use station_inventory::pipeline::{Pipeline, PipelineOptions};
use station_inventory::tools::{Converter, Merger};

pub type MockPipeline = Pipeline<MockFdsn, MockConverter, MockMerger>;

pub fn catalog(networks: &[(&str, &[&str])]) -> Catalog {
    let mut xml = String::from(
        "<seiscomp xmlns=\"http://geofon.gfz-potsdam.de/ns/seiscomp3-schema/0.12\"><Config>\n",
    );
    for (network, stations) in networks {
        for station in *stations {
            xml.push_str(&format!(
                "<parameterSet publicID=\"ParameterSet/trunk/Station/{network}/{station}/default\">\
                 <parameter publicID=\"p\"><name>detecStream</name><value>BH</value></parameter>\
                 </parameterSet>\n"
            ));
        }
    }
    xml.push_str("</Config></seiscomp>\n");
    Catalog::parse(&xml, Path::new("config.xml")).unwrap()
}

pub fn networks(codes: &[&str]) -> Vec<NetworkCode> {
    codes.iter().map(|code| code.parse().unwrap()).collect()
}

/// Shared view on what the collaborators were asked to do.
#[derive(Clone, Default)]
pub struct Recorder {
    pub fetches: Arc<Mutex<Vec<String>>>,
    pub converts: Arc<Mutex<Vec<String>>>,
    pub merges: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    pub failing_fetch: Arc<Mutex<HashSet<String>>>,
    pub failing_convert: Arc<Mutex<HashSet<String>>>,
    pub failing_merge: Arc<Mutex<HashSet<String>>>,
    pub listed: Arc<Mutex<BTreeSet<String>>>,
}

impl Recorder {
    pub fn fail_fetch(&self, key: &str) {
        self.failing_fetch.lock().unwrap().insert(key.to_string());
    }

    pub fn heal_fetch(&self, key: &str) {
        self.failing_fetch.lock().unwrap().remove(key);
    }

    pub fn fail_convert(&self, key: &str) {
        self.failing_convert.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_merge(&self, network: &str) {
        self.failing_merge.lock().unwrap().insert(network.to_string());
    }

    pub fn list_stations(&self, stations: &[&str]) {
        let mut listed = self.listed.lock().unwrap();
        listed.extend(stations.iter().map(|s| s.to_string()));
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn converts(&self) -> Vec<String> {
        self.converts.lock().unwrap().clone()
    }

    pub fn merges(&self) -> Vec<(String, Vec<String>)> {
        self.merges.lock().unwrap().clone()
    }

    pub fn reset_calls(&self) {
        self.fetches.lock().unwrap().clear();
        self.converts.lock().unwrap().clear();
        self.merges.lock().unwrap().clear();
    }
}

pub struct MockFdsn {
    recorder: Recorder,
}

impl FdsnClient for MockFdsn {
    fn fetch_station_metadata(
        &self,
        network: &NetworkCode,
        station: &StationCode,
    ) -> Result<Vec<u8>, InventoryError> {
        let key = format!("{network}.{station}");
        self.recorder.fetches.lock().unwrap().push(key.clone());
        if self.recorder.failing_fetch.lock().unwrap().contains(&key) {
            return Err(InventoryError::FetchStatus {
                status: 503,
                message: format!("service unavailable for {key}"),
            });
        }
        Ok(format!("<Station code=\"{station}\" network=\"{network}\"/>").into_bytes())
    }

    fn list_network_stations(
        &self,
        _network: &NetworkCode,
    ) -> Result<BTreeSet<String>, InventoryError> {
        Ok(self.recorder.listed.lock().unwrap().clone())
    }
}

pub struct MockConverter {
    recorder: Recorder,
}

impl Converter for MockConverter {
    fn convert(&self, input: &Utf8Path) -> Result<Utf8PathBuf, InventoryError> {
        let key = input
            .file_stem()
            .map(|stem| stem.to_string())
            .unwrap_or_default();
        self.recorder.converts.lock().unwrap().push(key.clone());
        if self.recorder.failing_convert.lock().unwrap().contains(&key) {
            return Err(InventoryError::Convert(format!("cannot convert {key}")));
        }
        let output = converted_path_for(input);
        fs::copy(input.as_std_path(), output.as_std_path())
            .map_err(|err| InventoryError::Convert(err.to_string()))?;
        Ok(output)
    }
}

pub struct MockMerger {
    recorder: Recorder,
    layout: OutputLayout,
}

impl Merger for MockMerger {
    fn merge(
        &self,
        network: &NetworkCode,
        inputs: &[Utf8PathBuf],
    ) -> Result<Utf8PathBuf, InventoryError> {
        let names = inputs
            .iter()
            .map(|path| path.file_name().unwrap_or_default().to_string())
            .collect();
        self.recorder
            .merges
            .lock()
            .unwrap()
            .push((network.to_string(), names));
        if self
            .recorder
            .failing_merge
            .lock()
            .unwrap()
            .contains(network.as_str())
        {
            return Err(InventoryError::Merge(format!("scxmlmerge crashed for {network}")));
        }
        let mut merged = Vec::new();
        for input in inputs {
            merged.extend(
                fs::read(input.as_std_path())
                    .map_err(|err| InventoryError::Merge(err.to_string()))?,
            );
        }
        let output = self.layout.merged_path(network);
        OutputLayout::write_bytes_atomic(&output, &merged)?;
        Ok(output)
    }
}

pub struct Harness {
    pub temp: tempfile::TempDir,
    pub layout: OutputLayout,
    pub state_path: Utf8PathBuf,
    pub recorder: Recorder,
}

impl Harness {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        Self {
            layout: OutputLayout::new(root.join("inventory")),
            state_path: root.join("process_state.json"),
            recorder: Recorder::default(),
            temp,
        }
    }

    pub fn pipeline(&self) -> MockPipeline {
        self.pipeline_with(PipelineOptions::default())
    }

    pub fn pipeline_with(&self, options: PipelineOptions) -> MockPipeline {
        Pipeline::new(
            self.layout.clone(),
            MockFdsn {
                recorder: self.recorder.clone(),
            },
            MockConverter {
                recorder: self.recorder.clone(),
            },
            MockMerger {
                recorder: self.recorder.clone(),
                layout: self.layout.clone(),
            },
        )
        .with_options(options)
    }

    pub fn sink(&self) -> JsonOutput {
        JsonOutput
    }
}
