// StepSnap - Execution snapshot recorder for debug adapters
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! StepSnap - Execution snapshot recorder
//!
//! Runs a C, C++ or Python program under its debug adapter and records the
//! state of every step.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use eyre::Result;
use stepsnap_common::{types::BreakpointSpec, StepsnapConfig};

mod cmd;

/// Command-line interface for StepSnap
#[derive(Debug, Parser)]
#[command(name = "stepsnap")]
#[command(about = "StepSnap - Records step-by-step execution snapshots through debug adapters")]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: ~/.stepsnap.toml)
    #[arg(long, global = true, env = "STEPSNAP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Also write logs to a daily rotated file
    #[arg(long, global = true)]
    pub log_file: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Record the execution of a program
    Run(RunArgs),
    /// Rebuild full snapshots from a recorded steps file
    Reconstruct(ReconstructArgs),
}

/// Arguments of `stepsnap run`
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Main source file (.c, .cpp or .py)
    pub source: PathBuf,

    /// File fed to the program's standard input
    #[arg(long, short)]
    pub input: Option<PathBuf>,

    /// Breakpoint lines: `*` for every line or a comma-separated list
    #[arg(long, short, default_value = "*")]
    pub breakpoints: BreakpointSpec,

    /// Additional source files whose frames are recorded
    #[arg(long = "track")]
    pub tracked_files: Vec<PathBuf>,

    /// Where to write the steps JSON (default: stdout)
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Wall-clock budget in seconds, overrides the configuration
    #[arg(long)]
    pub time_limit: Option<u64>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pub pretty: bool,
}

/// Arguments of `stepsnap reconstruct`
#[derive(Debug, Args)]
pub struct ReconstructArgs {
    /// Steps JSON produced by `stepsnap run`
    pub steps: PathBuf,

    /// Where to write the snapshots JSON (default: stdout)
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pub pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    stepsnap_common::logging::init_logging("stepsnap", cli.log_file)?;

    match cli.command {
        Commands::Run(args) => {
            let config = load_config(cli.config)?;
            cmd::run(args, config).await
        }
        Commands::Reconstruct(args) => cmd::reconstruct(args),
    }
}

/// Loads the configuration file, falling back to defaults when it does not
/// exist.
fn load_config(path: Option<PathBuf>) -> Result<StepsnapConfig> {
    let path = match path {
        Some(path) => path,
        None => StepsnapConfig::default_path()?,
    };
    tracing::debug!("Loading configuration from {}", path.display());
    StepsnapConfig::load(&path)
}
