use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use camino::{Utf8Path, Utf8PathBuf};
use crate::config::ResolvedConfig;
use crate::domain::NetworkCode;
use crate::error::InventoryError;
use crate::layout::{OutputLayout, converted_path_for};

const CONVERT_TOOL: &str = "fdsnxml2inv";
const MERGE_TOOL: &str = "scxmlmerge";

pub trait Converter: Send + Sync {
    /// Converts one StationXML file and returns the SeisComP XML path.
    fn convert(&self, input: &Utf8Path) -> Result<Utf8PathBuf, InventoryError>;
}

pub trait Merger: Send + Sync {
    /// Merges converted files of `network` into one inventory file.
    fn merge(
        &self,
        network: &NetworkCode,
        inputs: &[Utf8PathBuf],
    ) -> Result<Utf8PathBuf, InventoryError>;
}

#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub fdsnxml2inv: Option<String>,
    pub scxmlmerge: Option<String>,
}

/// SeisComP command line tools found on `PATH` or configured explicitly.
#[derive(Clone)]
pub struct SeiscompTools {
    fdsnxml2inv: Option<PathBuf>,
    scxmlmerge: Option<PathBuf>,
    layout: OutputLayout,
}

impl SeiscompTools {
    pub fn new(config: &ResolvedConfig, layout: OutputLayout) -> Self {
        Self {
            fdsnxml2inv: config
                .fdsnxml2inv
                .clone()
                .or_else(|| find_in_path(CONVERT_TOOL)),
            scxmlmerge: config
                .scxmlmerge
                .clone()
                .or_else(|| find_in_path(MERGE_TOOL)),
            layout,
        }
    }

    pub fn tool_info(&self) -> ToolInfo {
        ToolInfo {
            fdsnxml2inv: self
                .fdsnxml2inv
                .as_ref()
                .map(|path| path.display().to_string()),
            scxmlmerge: self
                .scxmlmerge
                .as_ref()
                .map(|path| path.display().to_string()),
        }
    }

    fn require(tool: &Option<PathBuf>, name: &str) -> Result<PathBuf, InventoryError> {
        tool.clone()
            .ok_or_else(|| InventoryError::MissingTool(name.to_string()))
    }
}

impl Converter for SeiscompTools {
    fn convert(&self, input: &Utf8Path) -> Result<Utf8PathBuf, InventoryError> {
        let program = Self::require(&self.fdsnxml2inv, CONVERT_TOOL)?;
        let output = converted_path_for(input);
        match fs::remove_file(output.as_std_path()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(InventoryError::Convert(format!(
                    "cannot remove previous output {output}: {err}"
                )));
            }
        }
        tracing::debug!(input = %input, output = %output, "running {CONVERT_TOOL}");
        let result = run_cmd(&program, &[input.as_str(), output.as_str()])
            .map_err(InventoryError::Convert)?;
        check_exit(&program, &result).map_err(InventoryError::Convert)?;
        if !output.as_std_path().is_file() {
            return Err(InventoryError::Convert(format!(
                "{CONVERT_TOOL} produced no output at {output}"
            )));
        }
        Ok(output)
    }
}

impl Merger for SeiscompTools {
    fn merge(
        &self,
        network: &NetworkCode,
        inputs: &[Utf8PathBuf],
    ) -> Result<Utf8PathBuf, InventoryError> {
        let program = Self::require(&self.scxmlmerge, MERGE_TOOL)?;
        let output = self.layout.merged_path(network);
        let args: Vec<&str> = inputs.iter().map(|path| path.as_str()).collect();
        tracing::debug!(network = %network, inputs = inputs.len(), "running {MERGE_TOOL}");
        let result = run_cmd(&program, &args).map_err(InventoryError::Merge)?;
        check_exit(&program, &result).map_err(InventoryError::Merge)?;
        if result.stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(InventoryError::Merge(format!(
                "{MERGE_TOOL} produced no output for network {network}"
            )));
        }
        OutputLayout::write_bytes_atomic(&output, &result.stdout)
            .map_err(|err| InventoryError::Merge(err.to_string()))?;
        Ok(output)
    }
}

fn run_cmd(program: &Path, args: &[&str]) -> Result<Output, String> {
    Command::new(program)
        .args(args)
        .output()
        .map_err(|err| format!("{}: {err}", program.display()))
}

fn check_exit(program: &Path, output: &Output) -> Result<(), String> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        Err(format!(
            "command failed: {} ({})",
            program.display(),
            output.status
        ))
    } else {
        Err(stderr)
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
