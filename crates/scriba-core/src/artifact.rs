//! Persisted artifact codecs.
//!
//! Two artifacts per completed job:
//! - text: UTF-8, LF line endings, one paragraph per logical break,
//!   gzip-compressed, no header;
//! - segments: a top-level JSON array of `{"start", "end", "text"}`
//!   sorted by start, gzip-compressed. No schema version tag.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Result, ScribaError};
use crate::segment::Segment;

/// Gzip-compress a text artifact.
pub fn encode_text(text: &str) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    Ok(encoder.finish()?)
}

/// Decompress a text artifact.
pub fn decode_text(bytes: &[u8]) -> Result<String> {
    let mut decoder = GzDecoder::new(bytes);
    let mut text = String::new();
    decoder.read_to_string(&mut text)?;
    Ok(text)
}

/// Serialize and gzip-compress a segment list.
pub fn encode_segments(segments: &[Segment]) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(segments)
        .map_err(|e| ScribaError::Other(format!("segment serialization failed: {e}")))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decompress and parse a segment artifact.
pub fn decode_segments(bytes: &[u8]) -> Result<Vec<Segment>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    serde_json::from_slice(&json)
        .map_err(|e| ScribaError::Other(format!("segment artifact is malformed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_still_produces_a_nonempty_blob() {
        // An all-silence job commits an empty transcript; the gzip file
        // itself must still exist and be non-empty for the completion
        // invariant.
        let blob = encode_text("").unwrap();
        assert!(!blob.is_empty());
        assert_eq!(decode_text(&blob).unwrap(), "");
    }

    #[test]
    fn segments_artifact_is_a_plain_array() {
        let segs = vec![
            Segment::new(0.0, 1.5, "hello"),
            Segment::new(1.5, 3.0, "world"),
        ];
        let blob = encode_segments(&segs).unwrap();

        let mut decoder = GzDecoder::new(&blob[..]);
        let mut json = String::new();
        decoder.read_to_string(&mut json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value.is_array());
        assert_eq!(value[0]["text"], "hello");
        assert_eq!(value[1]["start"], 1.5);

        assert_eq!(decode_segments(&blob).unwrap(), segs);
    }

    #[test]
    fn malformed_segments_artifact_is_rejected() {
        let blob = encode_text("not json").unwrap();
        assert!(decode_segments(&blob).is_err());
    }
}
