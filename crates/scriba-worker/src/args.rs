use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "scriba-worker")]
#[command(version)]
#[command(about = "scriba GPU worker: polls the coordinator and transcribes audio jobs")]
pub struct Cli {
    /// Path to a JSON config file (all keys optional except coordinator_url)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Coordinator base URL, e.g. http://queue-host:8750 (overrides config)
    #[arg(long)]
    pub coordinator_url: Option<String>,

    /// Stable worker identifier (overrides config; generated when absent)
    #[arg(long)]
    pub worker_id: Option<String>,

    /// Concurrent decoder invocations (overrides config)
    #[arg(long)]
    pub parallel_decoders: Option<usize>,

    /// Speech decoder executable (overrides config)
    #[arg(long)]
    pub decoder: Option<String>,

    /// Enable verbose output for debugging
    #[arg(short, long)]
    pub verbose: bool,
}
