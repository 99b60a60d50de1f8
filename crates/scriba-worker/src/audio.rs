//! Audio preparation, probing, range extraction and silence scanning.
//!
//! The pipeline works on a 16 kHz mono 16-bit PCM WAV. Uploads in any
//! other container are converted once with ffmpeg when a job starts;
//! after that every read is plain WAV I/O via hound. Chunk extraction
//! writes short-lived temp WAVs that the decode pool deletes as soon as
//! a chunk is decoded.

use std::path::{Path, PathBuf};
use std::process::Command;

use hound::{WavReader, WavWriter};

use scriba_core::{Result, ScribaError};

/// Sample rate the decoder consumes.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// RMS frame length for the silence scan, seconds.
const FRAME_SECS: f64 = 0.1;

/// A decoded working copy of the job audio.
#[derive(Debug, Clone)]
pub struct AudioFile {
    pub path: PathBuf,
    /// Total duration in seconds.
    pub duration: f64,
    pub sample_rate: u32,
}

/// A detected quiet region, absolute seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceRange {
    pub start: f64,
    pub end: f64,
}

impl SilenceRange {
    pub fn midpoint(&self) -> f64 {
        (self.start + self.end) / 2.0
    }
}

fn wav_err(e: hound::Error) -> ScribaError {
    ScribaError::AudioDecode(e.to_string())
}

/// Produce the working WAV for `src`, converting with ffmpeg unless the
/// upload already is 16 kHz mono 16-bit PCM.
pub fn prepare(src: &Path, work_dir: &Path) -> Result<AudioFile> {
    let meta = std::fs::metadata(src)
        .map_err(|e| ScribaError::AudioDecode(format!("cannot stat audio file: {e}")))?;
    if meta.len() == 0 {
        return Err(ScribaError::AudioDecode("audio file is empty".to_string()));
    }

    if is_working_format(src) {
        return probe(src);
    }

    let dest = work_dir.join("source.wav");
    convert_to_wav(src, &dest)?;
    probe(&dest)
}

/// Whether the file is already in the pipeline's working format.
fn is_working_format(path: &Path) -> bool {
    match WavReader::open(path) {
        Ok(reader) => {
            let spec = reader.spec();
            spec.channels == 1
                && spec.sample_rate == TARGET_SAMPLE_RATE
                && spec.bits_per_sample == 16
                && spec.sample_format == hound::SampleFormat::Int
        }
        Err(_) => false,
    }
}

fn convert_to_wav(src: &Path, dest: &Path) -> Result<()> {
    let output = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
        ])
        .arg(src)
        .args([
            "-ac",
            "1",
            "-ar",
            "16000",
            "-c:a",
            "pcm_s16le",
            "-f",
            "wav",
            "-y",
        ])
        .arg(dest)
        .output()
        .map_err(|e| {
            ScribaError::AudioDecode(format!(
                "failed to execute ffmpeg (is it installed?): {e}"
            ))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ScribaError::AudioDecode(format!(
            "ffmpeg conversion failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Read the WAV header and compute the duration.
pub fn probe(path: &Path) -> Result<AudioFile> {
    let reader = WavReader::open(path).map_err(wav_err)?;
    let spec = reader.spec();
    let samples = reader.duration();
    if samples == 0 {
        return Err(ScribaError::AudioDecode(
            "audio contains no samples".to_string(),
        ));
    }
    Ok(AudioFile {
        path: path.to_path_buf(),
        duration: samples as f64 / spec.sample_rate as f64,
        sample_rate: spec.sample_rate,
    })
}

/// Copy `[start, end)` seconds of the working WAV into `dest`.
pub fn extract_range(audio: &AudioFile, start: f64, end: f64, dest: &Path) -> Result<()> {
    let mut reader = WavReader::open(&audio.path).map_err(wav_err)?;
    let spec = reader.spec();
    let rate = spec.sample_rate as f64;

    let total = reader.duration();
    let start_sample = ((start.max(0.0) * rate) as u32).min(total);
    let end_sample = ((end * rate).ceil() as u32).min(total);

    reader.seek(start_sample).map_err(ScribaError::Io)?;
    let mut writer = WavWriter::create(dest, spec).map_err(wav_err)?;
    let count = end_sample.saturating_sub(start_sample) as usize;
    for sample in reader.samples::<i16>().take(count) {
        writer.write_sample(sample.map_err(wav_err)?).map_err(wav_err)?;
    }
    writer.finalize().map_err(wav_err)?;
    Ok(())
}

/// Scan the given windows (absolute seconds) for quiet regions.
///
/// A region is a run of RMS frames below `threshold_dbfs` lasting at
/// least `min_silence` seconds. Only the requested windows are read, so
/// the probe touches a small fraction of a long file.
pub fn scan_silences(
    audio: &AudioFile,
    windows: &[(f64, f64)],
    threshold_dbfs: f64,
    min_silence: f64,
) -> Result<Vec<SilenceRange>> {
    let mut found = Vec::new();
    for &(win_start, win_end) in windows {
        let win_start = win_start.max(0.0);
        let win_end = win_end.min(audio.duration);
        if win_end <= win_start {
            continue;
        }
        scan_window(audio, win_start, win_end, threshold_dbfs, min_silence, &mut found)?;
    }

    found.sort_by(|a, b| a.start.total_cmp(&b.start));
    found.dedup_by(|a, b| (a.start - b.start).abs() < 1e-9);
    Ok(found)
}

fn scan_window(
    audio: &AudioFile,
    win_start: f64,
    win_end: f64,
    threshold_dbfs: f64,
    min_silence: f64,
    found: &mut Vec<SilenceRange>,
) -> Result<()> {
    let mut reader = WavReader::open(&audio.path).map_err(wav_err)?;
    let rate = audio.sample_rate as f64;
    let frame_len = ((FRAME_SECS * rate) as usize).max(1);

    let start_sample = (win_start * rate) as u32;
    let end_sample = ((win_end * rate) as u32).min(reader.duration());
    reader.seek(start_sample).map_err(ScribaError::Io)?;

    let mut samples = reader.samples::<i16>();
    let mut cursor = start_sample as usize;
    let mut run_start: Option<f64> = None;

    while (cursor as u32) < end_sample {
        let want = frame_len.min(end_sample as usize - cursor);
        let mut sum_sq = 0.0f64;
        let mut read = 0usize;
        for _ in 0..want {
            let Some(sample) = samples.next() else { break };
            let value = sample.map_err(wav_err)? as f64 / i16::MAX as f64;
            sum_sq += value * value;
            read += 1;
        }
        if read == 0 {
            break;
        }

        let rms = (sum_sq / read as f64).sqrt();
        let dbfs = 20.0 * (rms + 1e-10).log10();
        let frame_start = cursor as f64 / rate;

        if dbfs < threshold_dbfs {
            run_start.get_or_insert(frame_start);
        } else if let Some(start) = run_start.take()
            && frame_start - start >= min_silence
        {
            found.push(SilenceRange { start, end: frame_start });
        }

        cursor += read;
    }

    if let Some(start) = run_start {
        let end = (cursor as f64 / rate).min(win_end);
        if end - start >= min_silence {
            found.push(SilenceRange { start, end });
        }
    }
    Ok(())
}

/// Test helper shared across worker modules: write a 16 kHz mono WAV
/// from (amplitude, seconds) runs.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub(crate) fn write_wav(path: &Path, pattern: &[(f64, f64)]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: TARGET_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for &(amplitude, seconds) in pattern {
            let n = (seconds * TARGET_SAMPLE_RATE as f64) as usize;
            let value = (amplitude * i16::MAX as f64) as i16;
            for _ in 0..n {
                writer.write_sample(value).unwrap();
            }
        }
        writer.finalize().unwrap();
    }
}
