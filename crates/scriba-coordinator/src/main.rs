mod args;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use scriba_core::blob::BlobStore;
use scriba_core::config::{self, CoordinatorConfig};
use scriba_core::info;

use scriba_coordinator::routes::{self, AppState};
use scriba_coordinator::store::MetadataStore;
use scriba_coordinator::{reaper, sweeper};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = args::Cli::parse();
    scriba_core::set_verbose(cli.verbose);

    let mut cfg: CoordinatorConfig =
        config::load(cli.config.as_deref()).context("loading config")?;
    if let Some(bind) = cli.bind {
        cfg.bind_addr = bind;
    }
    if let Some(data_dir) = cli.data_dir {
        cfg.data_dir = data_dir;
    }

    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("creating data dir {}", cfg.data_dir.display()))?;
    let store = Arc::new(
        MetadataStore::open(cfg.data_dir.join("jobs.json"), cfg.queue.max_retries)
            .context("opening metadata store")?,
    );
    let blobs = Arc::new(BlobStore::open(cfg.data_dir.join("blobs")).context("opening blob store")?);

    tokio::spawn(reaper::run(store.clone(), cfg.queue.reaper_period()));
    tokio::spawn(sweeper::run(store.clone(), blobs.clone()));

    let state = AppState {
        store,
        blobs,
        queue: cfg.queue.clone(),
    };
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    info!("scribad listening on {}", cfg.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}
