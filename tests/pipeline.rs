mod common;

use std::fs;

use assert_matches::assert_matches;

use station_inventory::domain::{ProcessingState, StationStatus, WorkItem};
use station_inventory::error::InventoryError;
use station_inventory::pipeline::{NetworkPhase, PipelineOptions, StationOutcome};
use station_inventory::state::StateStore;

use common::{Harness, catalog, networks};

fn item(key: &str) -> WorkItem {
    WorkItem::from_key(key).unwrap()
}

#[test]
fn failed_station_is_recorded_and_retried_alone() {
    let harness = Harness::new();
    let catalog = catalog(&[("AU", &["ARMA", "QIS"])]);
    harness.recorder.fail_fetch("AU.QIS");

    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    let summary = harness
        .pipeline()
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();

    assert_eq!(summary.stations.completed, 1);
    assert_eq!(summary.stations.failed, 1);
    assert_eq!(summary.failed_stations.len(), 1);
    assert_eq!(summary.failed_stations[0].station, "AU.QIS");
    assert!(summary.failed_stations[0].error.contains("503"));

    let reloaded = StateStore::load(harness.state_path.clone()).unwrap();
    let arma = reloaded.get(&item("AU.ARMA")).unwrap();
    assert_eq!(arma.status, StationStatus::Completed);
    let arma_output = arma.output_path.clone().unwrap();
    assert!(arma_output.ends_with("seiscomp_AU.ARMA.xml"));
    let qis = reloaded.get(&item("AU.QIS")).unwrap();
    assert_eq!(qis.status, StationStatus::Failed);
    assert!(qis.last_attempt_error.as_deref().unwrap().contains("service unavailable"));

    let merged = harness
        .layout
        .merged_path(&"AU".parse().unwrap());
    let content = fs::read_to_string(merged.as_std_path()).unwrap();
    assert!(content.contains("ARMA"));
    assert!(!content.contains("QIS"));
    assert_eq!(
        harness.recorder.merges(),
        vec![("AU".to_string(), vec!["seiscomp_AU.ARMA.xml".to_string()])]
    );

    harness.recorder.reset_calls();
    harness.recorder.heal_fetch("AU.QIS");
    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    let summary = harness
        .pipeline()
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();
    assert_eq!(harness.recorder.fetches(), vec!["AU.QIS".to_string()]);
    assert_eq!(summary.stations.skipped, 1);
    assert_eq!(summary.stations.completed, 1);
    assert!(summary.failed_stations.is_empty());
    assert_eq!(store.get(&item("AU.QIS")).unwrap().attempts, 2);
}

#[test]
fn second_run_does_no_work() {
    let harness = Harness::new();
    let catalog = catalog(&[("AU", &["ARMA", "QIS"]), ("IU", &["ANMO"])]);

    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    harness
        .pipeline()
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();
    assert_eq!(harness.recorder.fetches().len(), 3);
    let first_state = fs::read_to_string(harness.state_path.as_std_path()).unwrap();

    harness.recorder.reset_calls();
    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    let summary = harness
        .pipeline()
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();

    assert!(harness.recorder.fetches().is_empty());
    assert!(harness.recorder.converts().is_empty());
    assert_eq!(summary.stations.skipped, 3);
    assert_eq!(summary.networks_in_phase(NetworkPhase::Merged), 2);
    let second_state = fs::read_to_string(harness.state_path.as_std_path()).unwrap();
    assert_eq!(first_state, second_state);
}

#[test]
fn interrupted_run_resumes_without_refetching() {
    let harness = Harness::new();
    let catalog = catalog(&[("AU", &["ARMA", "QIS"]), ("IU", &["ANMO"])]);

    {
        // Only the first station gets through before the process dies.
        let mut store = StateStore::load(harness.state_path.clone()).unwrap();
        let outcome = harness
            .pipeline()
            .process_station(&item("AU.ARMA"), &mut store, &harness.sink())
            .unwrap();
        assert_eq!(outcome, StationOutcome::Completed { changed: true });
    }

    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    assert!(store.is_completed(&item("AU.ARMA")));
    harness
        .pipeline()
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();

    assert_eq!(
        harness.recorder.fetches(),
        vec![
            "AU.ARMA".to_string(),
            "AU.QIS".to_string(),
            "IU.ANMO".to_string()
        ]
    );
    let reloaded = StateStore::load(harness.state_path.clone()).unwrap();
    for key in ["AU.ARMA", "AU.QIS", "IU.ANMO"] {
        let state = reloaded.get(&item(key)).unwrap();
        assert_eq!(state.status, StationStatus::Completed, "{key}");
        assert_eq!(state.attempts, 1, "{key}");
    }
}

#[test]
fn failing_station_does_not_block_network_or_later_networks() {
    let harness = Harness::new();
    let catalog = catalog(&[("AU", &["ARMA", "QIS", "CTA"]), ("IU", &["ANMO"])]);
    harness.recorder.fail_fetch("AU.QIS");

    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    let summary = harness
        .pipeline()
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();

    let au = summary.network("AU").unwrap();
    assert_eq!(au.phase, NetworkPhase::Merged);
    assert_eq!(au.merged_stations, 2);
    assert_eq!(
        harness.recorder.merges()[0].1,
        vec![
            "seiscomp_AU.ARMA.xml".to_string(),
            "seiscomp_AU.CTA.xml".to_string()
        ]
    );
    assert_eq!(summary.network("IU").unwrap().phase, NetworkPhase::Merged);
}

#[test]
fn network_without_usable_stations_skips_merge() {
    let harness = Harness::new();
    let catalog = catalog(&[("AU", &["ARMA", "QIS"]), ("GE", &["APE"])]);
    harness.recorder.fail_fetch("AU.ARMA");
    harness.recorder.fail_fetch("AU.QIS");

    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    let summary = harness
        .pipeline()
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();

    assert_eq!(summary.network("AU").unwrap().phase, NetworkPhase::MergeSkipped);
    assert_eq!(summary.network("GE").unwrap().phase, NetworkPhase::Merged);
    let merged: Vec<_> = harness
        .recorder
        .merges()
        .into_iter()
        .map(|(network, _)| network)
        .collect();
    assert_eq!(merged, vec!["GE".to_string()]);
    assert!(!harness.layout.merged_path(&"AU".parse().unwrap()).exists());
}

fn recorded_item(path: &camino::Utf8Path, key: &str) -> serde_json::Value {
    let content = fs::read_to_string(path.as_std_path()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&content).unwrap();
    value["items"][key].clone()
}

#[test]
fn network_filter_limits_work() {
    let harness = Harness::new();
    let catalog = catalog(&[("AU", &["ARMA"]), ("IU", &["ANMO", "COLA"]), ("GE", &["APE"])]);
    let filter = networks(&["IU"]);

    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    store
        .record(
            &item("AU.ARMA"),
            ProcessingState::completed(
                "missing/seiscomp_AU.ARMA.xml".to_string(),
                "missing/AU.ARMA.xml".to_string(),
                "abc".to_string(),
            ),
        )
        .unwrap();
    store
        .record(&item("GE.APE"), ProcessingState::failed("timeout"))
        .unwrap();
    let arma_before = recorded_item(&harness.state_path, "AU.ARMA");
    let ape_before = recorded_item(&harness.state_path, "GE.APE");

    let summary = harness
        .pipeline()
        .run(&catalog, Some(&filter), &mut store, &harness.sink())
        .unwrap();

    assert_eq!(
        harness.recorder.fetches(),
        vec!["IU.ANMO".to_string(), "IU.COLA".to_string()]
    );
    assert_eq!(summary.networks.len(), 1);
    assert!(summary.failed_stations.is_empty());
    let keys: Vec<String> = store.entries().map(|(item, _)| item.key()).collect();
    assert_eq!(
        keys,
        vec![
            "AU.ARMA".to_string(),
            "GE.APE".to_string(),
            "IU.ANMO".to_string(),
            "IU.COLA".to_string()
        ]
    );
    assert_eq!(recorded_item(&harness.state_path, "AU.ARMA"), arma_before);
    assert_eq!(recorded_item(&harness.state_path, "GE.APE"), ape_before);
    assert_eq!(harness.recorder.merges().len(), 1);
}

#[test]
fn conversion_failure_keeps_raw_file() {
    let harness = Harness::new();
    let catalog = catalog(&[("AU", &["ARMA"])]);
    harness.recorder.fail_convert("AU.ARMA");

    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    let summary = harness
        .pipeline()
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();

    assert_eq!(summary.stations.failed, 1);
    let state = store.get(&item("AU.ARMA")).unwrap();
    assert_eq!(state.status, StationStatus::Failed);
    let raw = harness.layout.raw_path(&item("AU.ARMA"));
    assert_eq!(state.raw_path.as_deref(), Some(raw.as_str()));
    assert!(raw.exists());
    assert_eq!(summary.network("AU").unwrap().phase, NetworkPhase::MergeSkipped);
}

#[test]
fn merge_failure_is_reported_and_run_continues() {
    let harness = Harness::new();
    let catalog = catalog(&[("AU", &["ARMA"]), ("IU", &["ANMO"])]);
    harness.recorder.fail_merge("AU");

    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    let summary = harness
        .pipeline()
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();

    let au = summary.network("AU").unwrap();
    assert_eq!(au.phase, NetworkPhase::MergeFailed);
    assert!(au.error.as_deref().unwrap().contains("scxmlmerge crashed"));
    assert_eq!(summary.network("IU").unwrap().phase, NetworkPhase::Merged);
    assert_eq!(summary.networks_in_phase(NetworkPhase::MergeFailed), 1);
}

#[test]
fn completed_station_with_missing_output_is_reprocessed() {
    let harness = Harness::new();
    let catalog = catalog(&[("AU", &["ARMA", "QIS"])]);

    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    harness
        .pipeline()
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();
    let converted = harness.layout.converted_path(&item("AU.QIS"));
    fs::remove_file(converted.as_std_path()).unwrap();

    harness.recorder.reset_calls();
    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    let summary = harness
        .pipeline()
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();

    assert_eq!(harness.recorder.fetches(), vec!["AU.QIS".to_string()]);
    assert_eq!(summary.stations.skipped, 1);
    assert_eq!(summary.stations.unchanged, 1);
    assert!(converted.exists());
}

#[test]
fn trusting_state_file_skips_missing_outputs() {
    let harness = Harness::new();
    let catalog = catalog(&[("AU", &["ARMA"])]);

    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    harness
        .pipeline()
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();
    let converted = harness.layout.converted_path(&item("AU.ARMA"));
    fs::remove_file(converted.as_std_path()).unwrap();

    harness.recorder.reset_calls();
    let options = PipelineOptions {
        verify_outputs: false,
        ..PipelineOptions::default()
    };
    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    let summary = harness
        .pipeline_with(options)
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();

    assert!(harness.recorder.fetches().is_empty());
    assert_eq!(summary.stations.skipped, 1);
}

#[test]
fn new_stations_are_reported_and_optionally_processed() {
    let harness = Harness::new();
    let catalog = catalog(&[("AU", &["ARMA"])]);
    harness.recorder.list_stations(&["ARMA", "QIS", "bad/code"]);

    let report_only = PipelineOptions {
        detect_new_stations: true,
        ..PipelineOptions::default()
    };
    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    let summary = harness
        .pipeline_with(report_only)
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();
    assert_eq!(
        summary.network("AU").unwrap().new_stations,
        vec!["QIS".to_string(), "bad/code".to_string()]
    );
    assert_eq!(harness.recorder.fetches(), vec!["AU.ARMA".to_string()]);

    harness.recorder.reset_calls();
    let include = PipelineOptions {
        detect_new_stations: true,
        include_new_stations: true,
        ..PipelineOptions::default()
    };
    let summary = harness
        .pipeline_with(include)
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();
    assert_eq!(harness.recorder.fetches(), vec!["AU.QIS".to_string()]);
    assert_eq!(summary.network("AU").unwrap().merged_stations, 2);
    assert!(store.is_completed(&item("AU.QIS")));
}

#[test]
fn detection_respects_network_list() {
    let harness = Harness::new();
    let catalog = catalog(&[("AU", &["ARMA"]), ("GE", &["APE"])]);
    harness.recorder.list_stations(&["NEW"]);

    let options = PipelineOptions {
        detect_new_stations: true,
        new_station_networks: Some(networks(&["GE"])),
        ..PipelineOptions::default()
    };
    let mut store = StateStore::load(harness.state_path.clone()).unwrap();
    let summary = harness
        .pipeline_with(options)
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap();

    assert!(summary.network("AU").unwrap().new_stations.is_empty());
    assert_eq!(
        summary.network("GE").unwrap().new_stations,
        vec!["NEW".to_string()]
    );
}

#[test]
fn unwritable_state_file_aborts_run() {
    let harness = Harness::new();
    let catalog = catalog(&[("AU", &["ARMA"])]);
    let state_dir = harness.temp.path().join("state");
    let state_path = camino::Utf8PathBuf::from_path_buf(state_dir.join("state.json")).unwrap();
    let mut store = StateStore::load(state_path).unwrap();
    // The state directory turns into a regular file after loading.
    fs::write(&state_dir, b"not a directory").unwrap();

    let err = harness
        .pipeline()
        .run(&catalog, None, &mut store, &harness.sink())
        .unwrap_err();
    assert_matches!(err, InventoryError::StateWrite { .. });
}
