//! Chunk planning: silence-snapped split points with fixed overlap.
//!
//! Split points sit nominally at multiples of the stride and are pulled
//! to the middle of a nearby silence when the probe found one, so a
//! chunk ideally begins in a pause rather than mid-word. Every chunk
//! after the first starts `overlap` seconds before its predecessor ends;
//! the merger later removes the duplicated transcription.

use scriba_core::config::PipelineConfig;
use scriba_core::{Result, ScribaError};

use crate::audio::SilenceRange;

/// One planned decode unit. Times are source-file-relative seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpec {
    /// 0-based chunk index.
    pub index: usize,
    pub start: f64,
    pub end: f64,
    /// Overlap with the previous chunk (0 for the first).
    pub overlap: f64,
}

impl ChunkSpec {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Nominal split points at `i * stride`, strictly inside `(0, duration)`.
pub fn nominal_boundaries(duration: f64, stride: f64) -> Vec<f64> {
    let mut boundaries = Vec::new();
    let mut i = 1u32;
    loop {
        let boundary = i as f64 * stride;
        if boundary >= duration - 1e-9 {
            break;
        }
        boundaries.push(boundary);
        i += 1;
    }
    boundaries
}

/// Windows the silence probe must scan, one per nominal split point.
pub fn probe_windows(duration: f64, cfg: &PipelineConfig) -> Vec<(f64, f64)> {
    let window = cfg.vad_search_window_seconds;
    nominal_boundaries(duration, cfg.chunk_stride_seconds)
        .into_iter()
        .map(|b| ((b - window).max(0.0), (b + window).min(duration)))
        .collect()
}

/// The silence midpoint nearest to `nominal` within the search window,
/// or `nominal` itself when the probe found nothing usable there.
fn snap_boundary(nominal: f64, silences: &[SilenceRange], window: f64) -> f64 {
    silences
        .iter()
        .filter(|s| (s.midpoint() - nominal).abs() <= window)
        .min_by(|a, b| {
            (a.midpoint() - nominal)
                .abs()
                .total_cmp(&(b.midpoint() - nominal).abs())
        })
        .map(|s| s.midpoint())
        .unwrap_or(nominal)
}

/// Plan the chunk sequence for an audio file of `duration` seconds.
///
/// Audio below the chunking threshold becomes a single chunk covering
/// the whole file. Otherwise chunks cover `[0, duration]` with the
/// configured overlap between neighbours.
pub fn plan_chunks(
    duration: f64,
    silences: &[SilenceRange],
    cfg: &PipelineConfig,
) -> Result<Vec<ChunkSpec>> {
    if !duration.is_finite() || duration <= 0.0 {
        return Err(ScribaError::AudioDecode(format!(
            "cannot chunk audio of duration {duration}"
        )));
    }
    let stride = cfg.chunk_stride_seconds;
    let overlap = cfg.chunk_overlap_seconds;
    if overlap >= stride {
        return Err(ScribaError::config(
            "chunk_overlap_seconds must be smaller than chunk_stride_seconds",
        ));
    }

    if duration < cfg.min_duration_for_chunking_seconds {
        return Ok(vec![ChunkSpec {
            index: 0,
            start: 0.0,
            end: duration,
            overlap: 0.0,
        }]);
    }

    // Snap each nominal boundary, keeping the sequence strictly
    // increasing with room for the overlap; a snap that would violate
    // that falls back to the nominal position, and a nominal position
    // that still violates it is dropped.
    let mut boundaries: Vec<f64> = Vec::new();
    let mut prev = 0.0f64;
    for nominal in nominal_boundaries(duration, stride) {
        let snapped = snap_boundary(nominal, silences, cfg.vad_search_window_seconds);
        let candidate = if snapped > prev + overlap && snapped < duration - 1e-6 {
            snapped
        } else {
            nominal
        };
        if candidate <= prev + overlap || candidate >= duration - 1e-6 {
            continue;
        }
        boundaries.push(candidate);
        prev = candidate;
    }

    let mut chunks = Vec::with_capacity(boundaries.len() + 1);
    let mut start = 0.0f64;
    for boundary in boundaries {
        let index = chunks.len();
        chunks.push(ChunkSpec {
            index,
            start,
            end: boundary,
            overlap: if index == 0 { 0.0 } else { overlap },
        });
        start = (boundary - overlap).max(0.0);
    }
    let index = chunks.len();
    chunks.push(ChunkSpec {
        index,
        start,
        end: duration,
        overlap: if index == 0 { 0.0 } else { overlap },
    });

    Ok(chunks)
}
