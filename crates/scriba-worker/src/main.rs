mod args;
mod audio;
mod client;
mod decoder;
mod merger;
mod pipeline;
mod polish;
mod segmenter;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Notify;

use scriba_core::config::{self, WorkerConfig};
use scriba_core::{ScribaError, info, verbose, warn};

use crate::client::CoordinatorClient;
use crate::decoder::{CommandDecoder, SpeechDecoder};
use crate::pipeline::Pipeline;

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

    let mut cfg: WorkerConfig = config::load(cli.config.as_deref()).context("loading config")?;
    if let Some(url) = cli.coordinator_url {
        cfg.coordinator_url = url;
    }
    if let Some(id) = cli.worker_id {
        cfg.worker_id = Some(id);
    }
    if let Some(n) = cli.parallel_decoders {
        cfg.pipeline.parallel_decoders = n;
    }
    if let Some(program) = cli.decoder {
        cfg.decoder_command = program;
    }
    cfg.validate()?;

    let worker_id = cfg.effective_worker_id();
    let client = Arc::new(CoordinatorClient::new(
        &cfg.coordinator_url,
        worker_id.clone(),
        Duration::from_secs(cfg.http_timeout_seconds),
    )?);
    let speech: Arc<dyn SpeechDecoder> = Arc::new(CommandDecoder::new(
        cfg.decoder_command.clone(),
        cfg.decoder_args.clone(),
    ));
    let cfg = Arc::new(cfg);
    let pipeline = Pipeline {
        client: client.clone(),
        decoder: speech,
        config: cfg.clone(),
        llm: reqwest::Client::new(),
    };

    info!(
        "worker {worker_id} polling {} ({} parallel decoder(s))",
        cfg.coordinator_url, cfg.pipeline.parallel_decoders
    );

    // Ctrl-C cancels the current attempt: the decode pool stops feeding
    // and no commit is attempted.
    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    {
        let shutdown = shutdown.clone();
        let wake = wake.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            shutdown.store(true, Ordering::Relaxed);
            wake.notify_waiters();
        });
    }

    while !shutdown.load(Ordering::Relaxed) {
        match client.next_job().await {
            Ok(Some(job)) => {
                let id = job.id;

                // Per-attempt abort: set by the heartbeat on a lost
                // lease, or propagated from the shutdown flag.
                let abort = Arc::new(AtomicBool::new(false));
                let propagator = {
                    let abort = abort.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        while !shutdown.load(Ordering::Relaxed) {
                            tokio::time::sleep(Duration::from_millis(250)).await;
                        }
                        abort.store(true, Ordering::Relaxed);
                    })
                };

                let result = pipeline.run_job(job, abort).await;
                propagator.abort();

                match result {
                    Ok(()) => {}
                    Err(ScribaError::LeaseLost) => {
                        // No fail RPC: either the coordinator already
                        // reclaimed the job, or we are shutting down and
                        // the reaper will.
                        if shutdown.load(Ordering::Relaxed) {
                            info!("job {id}: attempt cancelled by shutdown");
                        } else {
                            warn!("job {id}: lease lost, attempt discarded");
                        }
                    }
                    Err(e) => {
                        warn!("job {id} failed: {e}");
                        if let Err(rpc) = client.fail(id, &e.to_string(), e.is_retryable()).await {
                            warn!("job {id}: could not report failure: {rpc}");
                        }
                    }
                }
            }
            Ok(None) => {
                verbose!("queue empty, sleeping {}s", cfg.poll_interval_seconds);
                idle_sleep(&wake, Duration::from_secs(cfg.poll_interval_seconds)).await;
            }
            Err(e) => {
                warn!("polling failed: {e}");
                idle_sleep(&wake, Duration::from_secs(cfg.poll_interval_seconds)).await;
            }
        }
    }

    info!("worker {worker_id} stopped");
    Ok(())
}

/// Sleep between polls, waking early on shutdown.
async fn idle_sleep(wake: &Notify, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = wake.notified() => {}
    }
}
