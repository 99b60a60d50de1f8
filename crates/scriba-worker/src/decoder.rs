//! Speech decoder capability and the parallel decode pool.
//!
//! The decoder is a capability, not a subclass hierarchy: one method,
//! WAV path in, chunk-local segments out. Concrete engines are swapped
//! by configuration; the shipped engine shells out to an external
//! binary (whisper.cpp or compatible) that prints a JSON segment array
//! on stdout.
//!
//! The pool runs up to `parallel_decoders` invocations at once behind a
//! semaphore. Results arrive in any order and are re-indexed by chunk;
//! one failed chunk fails the whole job because a hole in the audio
//! cannot be papered over.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Semaphore;

use scriba_core::config::PipelineConfig;
use scriba_core::segment::Segment;
use scriba_core::{Result, ScribaError, verbose};

use crate::audio::{self, AudioFile};
use crate::segmenter::ChunkSpec;

/// Opaque speech decoder: audio range to segment list.
#[async_trait]
pub trait SpeechDecoder: Send + Sync {
    /// Decode one chunk WAV into segments with chunk-local times.
    async fn decode_chunk(&self, wav: &Path) -> anyhow::Result<Vec<Segment>>;
}

/// External decoder binary.
///
/// Invoked as `{program} {args...} {wav_path}`; stdout must be a JSON
/// array of `{"start", "end", "text"}` objects in chunk-local seconds.
pub struct CommandDecoder {
    program: String,
    args: Vec<String>,
}

impl CommandDecoder {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl SpeechDecoder for CommandDecoder {
    async fn decode_chunk(&self, wav: &Path) -> anyhow::Result<Vec<Segment>> {
        let program = self.program.clone();
        let args = self.args.clone();
        let wav = wav.to_path_buf();

        // The engine call is synchronous and GPU-bound; keep it off the
        // async runtime.
        tokio::task::spawn_blocking(move || {
            let output = Command::new(&program)
                .args(&args)
                .arg(&wav)
                .output()
                .with_context(|| format!("failed to execute decoder `{program}`"))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                anyhow::bail!("decoder exited with {}: {}", output.status, stderr.trim());
            }
            let segments: Vec<Segment> = serde_json::from_slice(&output.stdout)
                .context("decoder stdout is not a JSON segment array")?;
            Ok(segments)
        })
        .await
        .context("decoder task panicked")?
    }
}

/// Decode all chunks, bounded by `parallel_decoders`.
///
/// Returns per-chunk segment lists in chunk order. When `abort` is set
/// (lease lost or shutdown) no new decodes start; in-flight invocations
/// settle and their results are discarded.
pub async fn decode_chunks(
    decoder: Arc<dyn SpeechDecoder>,
    audio: &AudioFile,
    chunks: &[ChunkSpec],
    work_dir: &Path,
    cfg: &PipelineConfig,
    abort: Arc<AtomicBool>,
) -> Result<Vec<Vec<Segment>>> {
    let semaphore = Arc::new(Semaphore::new(cfg.parallel_decoders));
    let mut handles = Vec::with_capacity(chunks.len());

    for chunk in chunks.iter().cloned() {
        let semaphore = semaphore.clone();
        let decoder = decoder.clone();
        let audio = audio.clone();
        let abort = abort.clone();
        let work_dir = work_dir.to_path_buf();
        let timeout = cfg.chunk_timeout(chunk.duration());

        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| ScribaError::other("decode pool closed"))?;
            if abort.load(Ordering::Relaxed) {
                return Err(ScribaError::LeaseLost);
            }

            decode_one(decoder, &audio, &chunk, &work_dir, timeout).await
        }));
    }

    let mut results: Vec<Option<Vec<Segment>>> = vec![None; chunks.len()];
    let mut failures = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Ok((index, segments))) => results[index] = Some(segments),
            // Tasks skipped after an abort carry no information.
            Ok(Err(ScribaError::LeaseLost)) => {}
            Ok(Err(e)) => failures.push(e.to_string()),
            Err(e) => failures.push(format!("decode task panicked: {e}")),
        }
    }

    if abort.load(Ordering::Relaxed) {
        return Err(ScribaError::LeaseLost);
    }
    if !failures.is_empty() {
        return Err(ScribaError::Decode(format!(
            "{} of {} chunks failed: {}",
            failures.len(),
            chunks.len(),
            failures.join("; ")
        )));
    }
    Ok(results
        .into_iter()
        .map(|r| r.unwrap_or_default())
        .collect())
}

async fn decode_one(
    decoder: Arc<dyn SpeechDecoder>,
    audio: &AudioFile,
    chunk: &ChunkSpec,
    work_dir: &Path,
    timeout: std::time::Duration,
) -> Result<(usize, Vec<Segment>)> {
    // Extract the chunk's PCM range to a short-lived temp WAV (serial
    // I/O, not GPU). The file is removed as soon as the decode settles.
    let tmp = tempfile::Builder::new()
        .prefix(&format!("scriba-chunk-{}-", chunk.index))
        .suffix(".wav")
        .tempfile_in(work_dir)?;
    let tmp_path = tmp.path().to_path_buf();
    {
        let audio = audio.clone();
        let (start, end) = (chunk.start, chunk.end);
        let dest = tmp_path.clone();
        tokio::task::spawn_blocking(move || audio::extract_range(&audio, start, end, &dest))
            .await
            .map_err(|e| ScribaError::other(format!("extract task panicked: {e}")))??;
    }

    verbose!(
        "decoding chunk {} [{:.1}s..{:.1}s]",
        chunk.index,
        chunk.start,
        chunk.end
    );
    let decoded = tokio::time::timeout(timeout, decoder.decode_chunk(&tmp_path)).await;
    drop(tmp);

    match decoded {
        Err(_) => Err(ScribaError::Decode(format!(
            "chunk {} timed out after {timeout:?}",
            chunk.index
        ))),
        Ok(Err(e)) => Err(ScribaError::Decode(format!("chunk {}: {e:#}", chunk.index))),
        Ok(Ok(segments)) => Ok((chunk.index, segments)),
    }
}
