use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use station_inventory::catalog::Catalog;
use station_inventory::config::ConfigLoader;
use station_inventory::domain::NetworkCode;
use station_inventory::error::InventoryError;
use station_inventory::fdsn::FdsnHttpClient;
use station_inventory::layout::OutputLayout;
use station_inventory::output::{JsonOutput, OutputMode, TracingProgress};
use station_inventory::pipeline::{NetworkPhase, Pipeline, PipelineOptions, RunSummary};
use station_inventory::state::{DEFAULT_STATE_FILE, StateStore};
use station_inventory::tools::SeiscompTools;

#[derive(Parser)]
#[command(name = "station-inventory")]
#[command(about = "Mirror FDSN station metadata and merge it into SeisComP XML inventories")]
#[command(version, author)]
struct Cli {
    /// SeisComP configuration XML listing the stations to mirror
    config_file: PathBuf,

    /// Directory receiving per-station and merged inventory files
    output_dir: PathBuf,

    /// Only process these networks
    #[arg(long, num_args = 1..)]
    networks: Option<Vec<String>>,

    #[arg(long, default_value = DEFAULT_STATE_FILE)]
    state_file: PathBuf,

    /// JSON file with tool paths and FDSN source overrides
    #[arg(long)]
    tools_config: Option<String>,

    /// Trust the state file without checking converted files on disk
    #[arg(long)]
    no_verify_outputs: bool,

    /// Report stations the data centers list but the catalog lacks
    #[arg(long)]
    detect_new_stations: bool,

    /// Also process stations found by --detect-new-stations
    #[arg(long, requires = "detect_new_stations")]
    include_new_stations: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    non_interactive: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<InventoryError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &InventoryError) -> u8 {
    match error {
        InventoryError::CatalogParse { .. }
        | InventoryError::InvalidNetworkCode(_)
        | InventoryError::ConfigRead(_)
        | InventoryError::ConfigParse(_) => 2,
        InventoryError::StateCorrupt { .. } | InventoryError::StateWrite { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let filter = cli
        .networks
        .as_ref()
        .map(|codes| {
            codes
                .iter()
                .map(|code| code.parse::<NetworkCode>())
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;

    let config = ConfigLoader::resolve(cli.tools_config.as_deref())?;
    let catalog = Catalog::load(&cli.config_file)?;
    let state_path = Utf8PathBuf::from_path_buf(cli.state_file.clone())
        .map_err(|_| miette::Report::msg("state file path is not valid UTF-8"))?;
    let mut store = StateStore::load(state_path)?;

    let output_root = Utf8PathBuf::from_path_buf(cli.output_dir.clone())
        .map_err(|_| miette::Report::msg("output directory is not valid UTF-8"))?;
    let layout = OutputLayout::new(output_root);
    let fetcher = FdsnHttpClient::new(&config)?;
    let tools = SeiscompTools::new(&config, layout.clone());
    let info = tools.tool_info();
    if info.fdsnxml2inv.is_none() || info.scxmlmerge.is_none() {
        tracing::warn!(
            fdsnxml2inv = info.fdsnxml2inv.is_some(),
            scxmlmerge = info.scxmlmerge.is_some(),
            "SeisComP tools missing, conversion or merge will fail"
        );
    }

    // With an explicit network filter every selected network is checked.
    let new_station_networks = if filter.is_some() {
        None
    } else {
        Some(config.check_new_stations.clone())
    };
    let options = PipelineOptions {
        verify_outputs: !cli.no_verify_outputs,
        detect_new_stations: cli.detect_new_stations,
        include_new_stations: cli.include_new_stations,
        new_station_networks,
    };
    let pipeline = Pipeline::new(layout, fetcher, tools.clone(), tools).with_options(options);

    match output_mode {
        OutputMode::NonInteractive => {
            let summary = pipeline.run(&catalog, filter.as_deref(), &mut store, &JsonOutput)?;
            JsonOutput::print_summary(&summary).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let summary =
                pipeline.run(&catalog, filter.as_deref(), &mut store, &TracingProgress)?;
            print_summary(&summary);
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    let stations = &summary.stations;
    println!("{cyan}station-inventory summary{reset}");
    println!(
        "{green}stations completed: {} (updated {}, unchanged {}){reset}",
        stations.completed, stations.updated, stations.unchanged
    );
    println!("{green}stations already done: {}{reset}", stations.skipped);
    println!("{red}stations failed: {}{reset}", stations.failed);
    println!(
        "{cyan}networks merged: {}, skipped: {}, failed: {}{reset}",
        summary.networks_in_phase(NetworkPhase::Merged),
        summary.networks_in_phase(NetworkPhase::MergeSkipped),
        summary.networks_in_phase(NetworkPhase::MergeFailed)
    );

    for report in &summary.networks {
        match report.phase {
            NetworkPhase::Merged => println!(
                "{green}  {} merged {} stations -> {}{reset}",
                report.network,
                report.merged_stations,
                report.merged_path.as_deref().unwrap_or_default()
            ),
            NetworkPhase::MergeFailed => println!(
                "{red}  {} merge failed: {}{reset}",
                report.network,
                report.error.as_deref().unwrap_or_default()
            ),
            _ => println!("{yellow}  {} merge skipped{reset}", report.network),
        }
        if !report.new_stations.is_empty() {
            println!(
                "{yellow}    new stations: {}{reset}",
                report.new_stations.join(", ")
            );
        }
    }

    if !summary.failed_stations.is_empty() {
        println!("{red}failed stations (re-run to retry):{reset}");
        for failed in &summary.failed_stations {
            println!(
                "{red}  {} [{} attempts]: {}{reset}",
                failed.station, failed.attempts, failed.error
            );
        }
    }
}
