//! One leased job, end to end: download, prepare, segment, decode,
//! merge, polish, upload, commit.
//!
//! A heartbeat task runs for the whole attempt. When it sees a 409 the
//! shared abort flag flips: the decode pool stops feeding, in-flight
//! decodes settle and are discarded, and no commit is attempted; the
//! coordinator will re-dispatch. The same flag serves process shutdown.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use scriba_core::blob;
use scriba_core::config::WorkerConfig;
use scriba_core::job::JobId;
use scriba_core::protocol::{CompleteRequest, NextJobResponse};
use scriba_core::{Result, ScribaError, info, verbose, warn};

use crate::audio;
use crate::client::CoordinatorClient;
use crate::decoder::{self, SpeechDecoder};
use crate::merger;
use crate::polish::{self, LlmEndpoint};
use crate::segmenter;

pub struct Pipeline {
    pub client: Arc<CoordinatorClient>,
    pub decoder: Arc<dyn SpeechDecoder>,
    pub config: Arc<WorkerConfig>,
    /// Client for the formatter/summarizer collaborators.
    pub llm: reqwest::Client,
}

impl Pipeline {
    /// Process one leased job. Returns `LeaseLost` when the attempt was
    /// abandoned (heartbeat 409 or shutdown); any other error should be
    /// reported through the `fail` RPC by the caller.
    pub async fn run_job(&self, job: NextJobResponse, abort: Arc<AtomicBool>) -> Result<()> {
        let started = Instant::now();
        let work_dir = tempfile::tempdir()?;

        let heartbeat = spawn_heartbeat(
            self.client.clone(),
            job.id,
            self.config.queue.heartbeat_interval(),
            abort.clone(),
        );
        let result = self
            .run_inner(&job, work_dir.path(), abort, started)
            .await;
        heartbeat.stop().await;
        result
    }

    async fn run_inner(
        &self,
        job: &NextJobResponse,
        work_dir: &Path,
        abort: Arc<AtomicBool>,
        started: Instant,
    ) -> Result<()> {
        // Download the upload next to the working files.
        let ext = job.audio_key.rsplit('.').next().unwrap_or("bin");
        let src = work_dir.join(format!("input.{ext}"));
        let bytes = self.client.download_blob(&job.audio_key, &src).await?;
        verbose!("job {}: downloaded {bytes} bytes", job.id);

        // Decode the container into the working WAV.
        let prepared = {
            let src = src.clone();
            let work_dir = work_dir.to_path_buf();
            tokio::task::spawn_blocking(move || audio::prepare(&src, &work_dir))
                .await
                .map_err(|e| ScribaError::other(format!("prepare task panicked: {e}")))??
        };

        // Probe for silences near the nominal split points. The probe
        // is best-effort: on failure we split at the nominal stride.
        let windows = segmenter::probe_windows(prepared.duration, &self.config.pipeline);
        let silences = if windows.is_empty() {
            Vec::new()
        } else {
            let audio = prepared.clone();
            let cfg = self.config.pipeline.clone();
            let scanned = tokio::task::spawn_blocking(move || {
                audio::scan_silences(
                    &audio,
                    &windows,
                    cfg.vad_silence_threshold_dbfs,
                    cfg.vad_min_silence_seconds,
                )
            })
            .await;
            match scanned {
                Ok(Ok(silences)) => silences,
                Ok(Err(e)) => {
                    warn!("silence probe failed, using nominal boundaries: {e}");
                    Vec::new()
                }
                Err(e) => {
                    warn!("silence probe task panicked, using nominal boundaries: {e}");
                    Vec::new()
                }
            }
        };

        let chunks = segmenter::plan_chunks(prepared.duration, &silences, &self.config.pipeline)?;
        info!(
            "job {}: {:.1}s of audio in {} chunk(s)",
            job.id,
            prepared.duration,
            chunks.len()
        );

        let per_chunk = decoder::decode_chunks(
            self.decoder.clone(),
            &prepared,
            &chunks,
            work_dir,
            &self.config.pipeline,
            abort.clone(),
        )
        .await?;
        if abort.load(Ordering::Relaxed) {
            return Err(ScribaError::LeaseLost);
        }

        let merged = merger::merge(
            &chunks,
            per_chunk,
            prepared.duration,
            self.config.pipeline.vad_min_silence_seconds,
        )?;
        if merged.dropped > 0 {
            warn!("job {}: dropped {} malformed segment(s)", job.id, merged.dropped);
        }

        // Collaborators are best-effort; the raw artifact always ships.
        let text = match LlmEndpoint::from_config(
            &self.config.formatter_url,
            &self.config.formatter_model,
        ) {
            Some(endpoint) if !merged.text.is_empty() => {
                match polish::format_text(
                    &self.llm,
                    &endpoint,
                    &merged.text,
                    self.config.language.as_deref(),
                )
                .await
                {
                    Ok(formatted) => formatted,
                    Err(e) => {
                        warn!("formatter failed, keeping raw text: {e:#}");
                        merged.text.clone()
                    }
                }
            }
            _ => merged.text.clone(),
        };
        let summary = match LlmEndpoint::from_config(
            &self.config.summarizer_url,
            &self.config.summarizer_model,
        ) {
            Some(endpoint) if !text.is_empty() => {
                match polish::summarize(&self.llm, &endpoint, &text).await {
                    Ok(summary) => Some(summary),
                    Err(e) => {
                        warn!("summarizer failed: {e:#}");
                        None
                    }
                }
            }
            _ => None,
        };

        // Upload artifacts under the job's canonical keys, then commit.
        let text_key = blob::text_key(job.id);
        let segments_key = blob::segments_key(job.id);
        let text_path = work_dir.join("text.gz");
        let segments_path = work_dir.join("segments.json.gz");
        tokio::fs::write(&text_path, scriba_core::artifact::encode_text(&text)?).await?;
        tokio::fs::write(
            &segments_path,
            scriba_core::artifact::encode_segments(&merged.segments)?,
        )
        .await?;
        self.client.upload_blob(&text_key, &text_path).await?;
        self.client.upload_blob(&segments_key, &segments_path).await?;

        let request = CompleteRequest {
            worker: self.client.worker_id().to_string(),
            text_key: text_key.clone(),
            segments_key: Some(segments_key.clone()),
            summary,
            processing_seconds: started.elapsed().as_secs_f64(),
        };
        match self.client.complete(job.id, &request).await {
            Ok(()) => {
                info!(
                    "job {} completed in {:.1}s ({} segment(s))",
                    job.id,
                    request.processing_seconds,
                    merged.segments.len()
                );
                Ok(())
            }
            Err(ScribaError::LeaseLost) => {
                // The job moved on; a future attempt will overwrite the
                // canonical keys anyway, but clean up what we can.
                let _ = self.client.delete_blob(&text_key).await;
                let _ = self.client.delete_blob(&segments_key).await;
                Err(ScribaError::LeaseLost)
            }
            Err(e) => Err(e),
        }
    }
}

struct HeartbeatHandle {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl HeartbeatHandle {
    async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

/// Emit heartbeats until stopped. A 409 flips `abort` and ends the
/// task; transient errors are already retried inside the client and
/// only logged here.
fn spawn_heartbeat(
    client: Arc<CoordinatorClient>,
    id: JobId,
    interval: Duration,
    abort: Arc<AtomicBool>,
) -> HeartbeatHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The claim itself granted a fresh lease; skip the immediate tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match client.heartbeat(id).await {
                        Ok(expiry_ms) => verbose!("job {id}: lease extended to {expiry_ms}"),
                        Err(ScribaError::LeaseLost) => {
                            warn!("job {id}: lease lost, aborting attempt");
                            abort.store(true, Ordering::Relaxed);
                            break;
                        }
                        Err(e) => warn!("job {id}: heartbeat failed: {e}"),
                    }
                }
                result = stop_rx.changed() => {
                    if result.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
    HeartbeatHandle { stop_tx, task }
}
