//! Resumable station pipeline.
//!
//! Every selected station is dispatched exactly once per run (skip, success or
//! failure) and its outcome is written through to the [`StateStore`] before
//! the next station starts. A network is merged only after all of its
//! stations were dispatched.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::catalog::{Catalog, NetworkStations};
use crate::domain::{NetworkCode, ProcessingState, StationCode, WorkItem};
use crate::error::InventoryError;
use crate::fdsn::FdsnClient;
use crate::layout::OutputLayout;
use crate::state::StateStore;
use crate::tools::{Converter, Merger};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Reprocess completed stations whose converted file disappeared.
    pub verify_outputs: bool,
    pub detect_new_stations: bool,
    pub include_new_stations: bool,
    /// Networks eligible for new-station detection; `None` means every
    /// selected network.
    pub new_station_networks: Option<Vec<NetworkCode>>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            verify_outputs: true,
            detect_new_stations: false,
            include_new_stations: false,
            new_station_networks: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationOutcome {
    Skipped,
    Completed { changed: bool },
    Failed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPhase {
    NotStarted,
    StationsInProgress,
    Merged,
    MergeSkipped,
    MergeFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { path: Utf8PathBuf, stations: usize },
    Skipped,
    Failed { error: String },
}

impl MergeOutcome {
    pub fn phase(&self) -> NetworkPhase {
        match self {
            MergeOutcome::Merged { .. } => NetworkPhase::Merged,
            MergeOutcome::Skipped => NetworkPhase::MergeSkipped,
            MergeOutcome::Failed { .. } => NetworkPhase::MergeFailed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StationCounts {
    pub completed: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl StationCounts {
    fn add(&mut self, outcome: &StationOutcome) {
        match outcome {
            StationOutcome::Skipped => self.skipped += 1,
            StationOutcome::Completed { changed } => {
                self.completed += 1;
                if *changed {
                    self.updated += 1;
                } else {
                    self.unchanged += 1;
                }
            }
            StationOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkReport {
    pub network: String,
    pub phase: NetworkPhase,
    pub stations: StationCounts,
    pub merged_path: Option<String>,
    pub merged_stations: usize,
    pub error: Option<String>,
    pub new_stations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedStation {
    pub station: String,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub stations: StationCounts,
    pub networks: Vec<NetworkReport>,
    pub failed_stations: Vec<FailedStation>,
}

impl RunSummary {
    pub fn networks_in_phase(&self, phase: NetworkPhase) -> usize {
        self.networks
            .iter()
            .filter(|report| report.phase == phase)
            .count()
    }

    pub fn network(&self, code: &str) -> Option<&NetworkReport> {
        self.networks.iter().find(|report| report.network == code)
    }
}

pub struct Pipeline<F: FdsnClient, C: Converter, M: Merger> {
    layout: OutputLayout,
    fetcher: F,
    converter: C,
    merger: M,
    options: PipelineOptions,
}

impl<F: FdsnClient, C: Converter, M: Merger> Pipeline<F, C, M> {
    pub fn new(layout: OutputLayout, fetcher: F, converter: C, merger: M) -> Self {
        Self {
            layout,
            fetcher,
            converter,
            merger,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Processes every selected network in catalog order.
    ///
    /// Only state-store failures (and an unusable output directory) abort the
    /// run; station and network failures end up in the summary.
    pub fn run(
        &self,
        catalog: &Catalog,
        filter: Option<&[NetworkCode]>,
        store: &mut StateStore,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, InventoryError> {
        self.layout.ensure_root()?;
        let selected = catalog.select(filter);
        let mut summary = RunSummary::default();

        for group in &selected {
            let report = self.run_network(group, store, sink)?;
            summary.stations.completed += report.stations.completed;
            summary.stations.updated += report.stations.updated;
            summary.stations.unchanged += report.stations.unchanged;
            summary.stations.skipped += report.stations.skipped;
            summary.stations.failed += report.stations.failed;
            summary.networks.push(report);
        }

        summary.failed_stations = store
            .failed()
            .into_iter()
            .filter(|(item, _)| selected.iter().any(|group| group.network == item.network))
            .map(|(item, state)| FailedStation {
                station: item.key(),
                error: state.last_attempt_error.clone().unwrap_or_default(),
                attempts: state.attempts,
            })
            .collect();

        tracing::info!(
            completed = summary.stations.completed,
            skipped = summary.stations.skipped,
            failed = summary.stations.failed,
            networks = summary.networks.len(),
            "run finished"
        );
        Ok(summary)
    }

    fn run_network(
        &self,
        group: &NetworkStations,
        store: &mut StateStore,
        sink: &dyn ProgressSink,
    ) -> Result<NetworkReport, InventoryError> {
        let network = &group.network;
        let mut phase = NetworkPhase::NotStarted;
        tracing::debug!(network = %network, ?phase, "network selected");

        phase = NetworkPhase::StationsInProgress;
        tracing::info!(network = %network, stations = group.stations.len(), ?phase, "processing network");
        sink.event(ProgressEvent {
            message: format!("phase=Stations; network {network}"),
            elapsed: None,
        });

        let mut counts = StationCounts::default();
        let mut dispatched = group.stations.clone();
        for station in &group.stations {
            let item = WorkItem::new(network.clone(), station.clone());
            let outcome = self.process_station(&item, store, sink)?;
            counts.add(&outcome);
        }

        let mut new_stations = Vec::new();
        if self.detects_new_stations(network) {
            new_stations = self.detect_new_stations(network, &group.stations, sink);
            if self.options.include_new_stations {
                for code in &new_stations {
                    let station = match code.parse::<StationCode>() {
                        Ok(station) => station,
                        Err(err) => {
                            tracing::warn!(network = %network, "skipping new station: {err}");
                            continue;
                        }
                    };
                    let item = WorkItem::new(network.clone(), station.clone());
                    let outcome = self.process_station(&item, store, sink)?;
                    counts.add(&outcome);
                    dispatched.push(station);
                }
            }
        }

        let merge = self.merge_network(network, &dispatched, store, sink);
        phase = merge.phase();
        tracing::debug!(network = %network, ?phase, "network finished");

        let (merged_path, merged_stations, error) = match merge {
            MergeOutcome::Merged { path, stations } => (Some(path.to_string()), stations, None),
            MergeOutcome::Skipped => (None, 0, None),
            MergeOutcome::Failed { error } => (None, 0, Some(error)),
        };
        Ok(NetworkReport {
            network: network.to_string(),
            phase,
            stations: counts,
            merged_path,
            merged_stations,
            error,
            new_stations,
        })
    }

    /// Drives one station through fetch, raw write and conversion.
    ///
    /// Returns `Err` only when the state store cannot be written.
    pub fn process_station(
        &self,
        item: &WorkItem,
        store: &mut StateStore,
        sink: &dyn ProgressSink,
    ) -> Result<StationOutcome, InventoryError> {
        if let Some(state) = store.get(item).filter(|state| state.is_completed()) {
            if !self.options.verify_outputs || output_exists(state) {
                tracing::debug!(station = %item, "already completed, skipping");
                sink.event(ProgressEvent {
                    message: format!("phase=Skip; {item} already completed"),
                    elapsed: None,
                });
                return Ok(StationOutcome::Skipped);
            }
            tracing::warn!(
                station = %item,
                output = state.output_path.as_deref().unwrap_or_default(),
                "completed station is missing its output, reprocessing"
            );
        }
        let previous_hash = store.get(item).and_then(|state| state.content_hash.clone());

        sink.event(ProgressEvent {
            message: format!("phase=Fetch; {item}"),
            elapsed: None,
        });
        let start = Instant::now();
        let bytes = match self
            .fetcher
            .fetch_station_metadata(&item.network, &item.station)
        {
            Ok(bytes) => bytes,
            Err(err) => {
                return self.fail(item, store, sink, err, None, previous_hash);
            }
        };
        sink.event(ProgressEvent {
            message: format!("fdsn.response bytes={}", bytes.len()),
            elapsed: Some(start.elapsed()),
        });

        let raw_path = self.layout.raw_path(item);
        if let Err(err) = OutputLayout::write_bytes_atomic(&raw_path, &bytes) {
            return self.fail(item, store, sink, err, None, previous_hash);
        }
        let hash = content_hash(&bytes);

        sink.event(ProgressEvent {
            message: format!("phase=Convert; {item}"),
            elapsed: None,
        });
        let output = match self.converter.convert(&raw_path) {
            Ok(output) => output,
            Err(err) => {
                return self.fail(item, store, sink, err, Some(raw_path), previous_hash);
            }
        };

        let changed = previous_hash.as_deref() != Some(hash.as_str());
        store.record(
            item,
            ProcessingState::completed(output.to_string(), raw_path.to_string(), hash),
        )?;
        if changed {
            tracing::info!(station = %item, output = %output, "station inventory updated");
        } else {
            tracing::info!(station = %item, "no changes in station inventory");
        }
        Ok(StationOutcome::Completed { changed })
    }

    fn fail(
        &self,
        item: &WorkItem,
        store: &mut StateStore,
        sink: &dyn ProgressSink,
        err: InventoryError,
        raw_path: Option<Utf8PathBuf>,
        previous_hash: Option<String>,
    ) -> Result<StationOutcome, InventoryError> {
        let error = err.to_string();
        tracing::warn!(station = %item, "station failed: {error}");
        sink.event(ProgressEvent {
            message: format!("phase=Failed; {item}: {error}"),
            elapsed: None,
        });
        let mut state = ProcessingState::failed(error.clone());
        if let Some(raw_path) = raw_path {
            state = state.with_raw_path(raw_path.to_string());
        }
        state.content_hash = previous_hash;
        store.record(item, state)?;
        Ok(StationOutcome::Failed { error })
    }

    /// Merges the converted files of `stations` that are recorded completed.
    pub fn merge_network(
        &self,
        network: &NetworkCode,
        stations: &[StationCode],
        store: &StateStore,
        sink: &dyn ProgressSink,
    ) -> MergeOutcome {
        let inputs: Vec<Utf8PathBuf> = stations
            .iter()
            .filter_map(|station| {
                let item = WorkItem::new(network.clone(), station.clone());
                let state = store.get(&item).filter(|state| state.is_completed())?;
                if self.options.verify_outputs && !output_exists(state) {
                    tracing::warn!(station = %item, "converted file missing, left out of merge");
                    return None;
                }
                state.output_path.as_deref().map(Utf8PathBuf::from)
            })
            .collect();

        if inputs.is_empty() {
            tracing::warn!(network = %network, "no converted stations, skipping merge");
            sink.event(ProgressEvent {
                message: format!("phase=Merge; {network} skipped, no converted stations"),
                elapsed: None,
            });
            return MergeOutcome::Skipped;
        }

        sink.event(ProgressEvent {
            message: format!("phase=Merge; {network} ({} stations)", inputs.len()),
            elapsed: None,
        });
        match self.merger.merge(network, &inputs) {
            Ok(path) => {
                tracing::info!(network = %network, path = %path, stations = inputs.len(), "network merged");
                MergeOutcome::Merged {
                    path,
                    stations: inputs.len(),
                }
            }
            Err(err) => {
                tracing::warn!(network = %network, "merge failed: {err}");
                MergeOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    fn detects_new_stations(&self, network: &NetworkCode) -> bool {
        if !self.options.detect_new_stations {
            return false;
        }
        match &self.options.new_station_networks {
            Some(networks) => networks.contains(network),
            None => true,
        }
    }

    /// Stations the data center lists for `network` that the catalog lacks.
    fn detect_new_stations(
        &self,
        network: &NetworkCode,
        known: &[StationCode],
        sink: &dyn ProgressSink,
    ) -> Vec<String> {
        sink.event(ProgressEvent {
            message: format!("phase=Detect; listing stations of {network}"),
            elapsed: None,
        });
        let listed = match self.fetcher.list_network_stations(network) {
            Ok(listed) => listed,
            Err(err) => {
                tracing::warn!(network = %network, "failed to list network stations: {err}");
                return Vec::new();
            }
        };
        let known: BTreeSet<&str> = known.iter().map(StationCode::as_str).collect();
        let new_stations: Vec<String> = listed
            .into_iter()
            .filter(|code| !known.contains(code.as_str()))
            .collect();
        if !new_stations.is_empty() {
            tracing::info!(
                network = %network,
                stations = %new_stations.join(", "),
                "new stations detected"
            );
        }
        new_stations
    }
}

fn output_exists(state: &ProcessingState) -> bool {
    state
        .output_path
        .as_deref()
        .is_some_and(|path| !path.is_empty() && std::path::Path::new(path).is_file())
}

fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
