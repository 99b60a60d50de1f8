//! Configuration for the coordinator and worker binaries.
//!
//! Settings load from a JSON file (every field optional, per-field
//! defaults) and can be overridden by CLI flags. Defaults live in named
//! functions next to the structs so the file stays the single place to
//! change them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ScribaError};

/// Segmenter and decode-pool tuning (worker side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Nominal distance between chunk split points, seconds.
    #[serde(default = "default_chunk_stride")]
    pub chunk_stride_seconds: f64,
    /// Overlap between adjacent chunks, seconds.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap_seconds: f64,
    /// Half-width of the silence search window around a split point.
    #[serde(default = "default_vad_search_window")]
    pub vad_search_window_seconds: f64,
    /// RMS level below which a frame counts as silence, dBFS.
    #[serde(default = "default_vad_silence_threshold")]
    pub vad_silence_threshold_dbfs: f64,
    /// Minimum run of quiet frames that counts as a silence region.
    #[serde(default = "default_vad_min_silence")]
    pub vad_min_silence_seconds: f64,
    /// Audio shorter than this is decoded as a single chunk.
    #[serde(default = "default_min_duration_for_chunking")]
    pub min_duration_for_chunking_seconds: f64,
    /// Concurrent decoder invocations; sized by the operator to fit GPU
    /// memory.
    #[serde(default = "default_parallel_decoders")]
    pub parallel_decoders: usize,
    /// Fixed slack added to the per-chunk soft timeout.
    #[serde(default = "default_decode_timeout_slack")]
    pub decode_timeout_slack_seconds: f64,
}

fn default_chunk_stride() -> f64 {
    300.0
}
fn default_chunk_overlap() -> f64 {
    15.0
}
fn default_vad_search_window() -> f64 {
    60.0
}
fn default_vad_silence_threshold() -> f64 {
    -30.0
}
fn default_vad_min_silence() -> f64 {
    0.5
}
fn default_min_duration_for_chunking() -> f64 {
    600.0
}
fn default_parallel_decoders() -> usize {
    4
}
fn default_decode_timeout_slack() -> f64 {
    60.0
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_stride_seconds: default_chunk_stride(),
            chunk_overlap_seconds: default_chunk_overlap(),
            vad_search_window_seconds: default_vad_search_window(),
            vad_silence_threshold_dbfs: default_vad_silence_threshold(),
            vad_min_silence_seconds: default_vad_min_silence(),
            min_duration_for_chunking_seconds: default_min_duration_for_chunking(),
            parallel_decoders: default_parallel_decoders(),
            decode_timeout_slack_seconds: default_decode_timeout_slack(),
        }
    }
}

impl PipelineConfig {
    /// Soft timeout for decoding one chunk of the given duration.
    pub fn chunk_timeout(&self, chunk_duration: f64) -> Duration {
        Duration::from_secs_f64(chunk_duration * 10.0 + self.decode_timeout_slack_seconds)
    }
}

/// Queue tuning shared by both processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_lease_duration")]
    pub lease_duration_seconds: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Per-job cap on re-dispatches.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_lease_duration() -> u64 {
    120
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration_seconds: default_lease_duration(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            max_retries: default_max_retries(),
        }
    }
}

impl QueueConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    /// Reaper must run at least three times per lease window.
    pub fn reaper_period(&self) -> Duration {
        Duration::from_secs((self.lease_duration_seconds / 3).max(1))
    }
}

/// Coordinator (`scribad`) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Listen address for the HTTP surface.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Root directory holding the blob store and the metadata snapshot.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(flatten)]
    pub queue: QueueConfig,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8750".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("scriba-data")
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            queue: QueueConfig::default(),
        }
    }
}

/// Worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Base URL of the coordinator. Required.
    #[serde(default)]
    pub coordinator_url: String,
    /// Stable worker identifier; generated when absent.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Language hint forwarded to the formatter (ISO-639-1).
    #[serde(default)]
    pub language: Option<String>,
    /// Idle sleep between `next` polls, seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Per-request HTTP timeout, seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
    /// Speech decoder executable; must print a JSON segment array on
    /// stdout when given a WAV path.
    #[serde(default = "default_decoder_command")]
    pub decoder_command: String,
    /// Extra arguments passed before the WAV path.
    #[serde(default)]
    pub decoder_args: Vec<String>,
    /// Chat-completions endpoint for text formatting; absent = disabled.
    #[serde(default)]
    pub formatter_url: Option<String>,
    #[serde(default)]
    pub formatter_model: Option<String>,
    /// Chat-completions endpoint for summarization; absent = disabled.
    #[serde(default)]
    pub summarizer_url: Option<String>,
    #[serde(default)]
    pub summarizer_model: Option<String>,
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
    #[serde(flatten)]
    pub queue: QueueConfig,
}

fn default_poll_interval() -> u64 {
    10
}
fn default_http_timeout() -> u64 {
    30
}
fn default_decoder_command() -> String {
    "whisper-cli".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_url: String::new(),
            worker_id: None,
            language: None,
            poll_interval_seconds: default_poll_interval(),
            http_timeout_seconds: default_http_timeout(),
            decoder_command: default_decoder_command(),
            decoder_args: Vec::new(),
            formatter_url: None,
            formatter_model: None,
            summarizer_url: None,
            summarizer_model: None,
            pipeline: PipelineConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Fail fast on settings the worker cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.coordinator_url.trim().is_empty() {
            return Err(ScribaError::config(
                "coordinator_url is required (set it in the config file or via --coordinator-url)",
            ));
        }
        if self.pipeline.parallel_decoders == 0 {
            return Err(ScribaError::config("parallel_decoders must be at least 1"));
        }
        // A slower cadence risks losing a healthy lease between beats.
        if self.queue.heartbeat_interval_seconds * 3 > self.queue.lease_duration_seconds {
            return Err(ScribaError::config(
                "heartbeat_interval_seconds must be at most a third of lease_duration_seconds",
            ));
        }
        Ok(())
    }

    /// Configured worker id, or a generated one stable for this process.
    pub fn effective_worker_id(&self) -> String {
        self.worker_id.clone().unwrap_or_else(|| {
            let tag = Uuid::new_v4().simple().to_string();
            format!("worker-{}", &tag[..8])
        })
    }
}

/// Load a config struct from an optional JSON file; absent file means
/// all defaults.
pub fn load<T>(path: Option<&Path>) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match path {
        None => Ok(T::default()),
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                ScribaError::Config(format!("cannot read {}: {e}", path.display()))
            })?;
            serde_json::from_str(&raw)
                .map_err(|e| ScribaError::Config(format!("cannot parse {}: {e}", path.display())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let p = PipelineConfig::default();
        assert_eq!(p.chunk_stride_seconds, 300.0);
        assert_eq!(p.chunk_overlap_seconds, 15.0);
        assert_eq!(p.vad_search_window_seconds, 60.0);
        assert_eq!(p.vad_silence_threshold_dbfs, -30.0);
        assert_eq!(p.vad_min_silence_seconds, 0.5);
        assert_eq!(p.min_duration_for_chunking_seconds, 600.0);
        assert_eq!(p.parallel_decoders, 4);

        let q = QueueConfig::default();
        assert_eq!(q.lease_duration_seconds, 120);
        assert_eq!(q.heartbeat_interval_seconds, 30);
        assert_eq!(q.max_retries, 3);
        assert_eq!(q.reaper_period(), Duration::from_secs(40));
    }

    #[test]
    fn recognized_keys_are_flat() {
        let cfg: WorkerConfig = serde_json::from_str(
            r#"{
                "coordinator_url": "http://localhost:8750",
                "parallel_decoders": 2,
                "chunk_overlap_seconds": 10,
                "lease_duration_seconds": 180
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.pipeline.parallel_decoders, 2);
        assert_eq!(cfg.pipeline.chunk_overlap_seconds, 10.0);
        assert_eq!(cfg.pipeline.chunk_stride_seconds, 300.0);
        assert_eq!(cfg.queue.lease_duration_seconds, 180);
        assert_eq!(cfg.poll_interval_seconds, 10);
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_coordinator_url_fails_validation() {
        let cfg = WorkerConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn slow_heartbeat_cadence_fails_validation() {
        let mut cfg = WorkerConfig {
            coordinator_url: "http://localhost:8750".into(),
            ..WorkerConfig::default()
        };
        cfg.queue.heartbeat_interval_seconds = 50;
        assert!(cfg.validate().is_err());
        cfg.queue.heartbeat_interval_seconds = 40;
        cfg.validate().unwrap();
    }

    #[test]
    fn chunk_timeout_scales_with_duration() {
        let p = PipelineConfig::default();
        assert_eq!(p.chunk_timeout(30.0), Duration::from_secs(360));
    }
}
