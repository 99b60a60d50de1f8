use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "scribad")]
#[command(version)]
#[command(about = "scriba coordinator: job queue and blob storage for transcription workers")]
pub struct Cli {
    /// Path to a JSON config file (all keys optional)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8750 (overrides config)
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory for the blob store and metadata snapshot (overrides config)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Enable verbose output for debugging
    #[arg(short, long)]
    pub verbose: bool,
}
