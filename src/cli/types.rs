//! CLI argument definitions.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "workfarm")]
#[command(about = "Workfarm - autonomous agent goal orchestration", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Override the data directory (default: ~/.workfarm-data)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Path to a config file (default: .workfarm/config.yaml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the worker binary
    #[arg(long)]
    pub worker: Option<String>,
}
