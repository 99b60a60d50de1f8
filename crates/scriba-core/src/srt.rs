//! SubRip rendering from a committed segment list.
//!
//! Downstream subtitle export reads the segments artifact and renders it
//! with this function; keeping the renderer next to the artifact codec
//! means every consumer formats cues identically.

use crate::segment::Segment;

/// Render a sorted segment list as SubRip text (CRLF-free, LF endings).
pub fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for (i, seg) in segments.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n",
            i + 1,
            timestamp(seg.start),
            timestamp(seg.end),
            seg.text
        ));
    }
    out
}

/// `HH:MM:SS,mmm` with a comma millisecond separator per the format.
fn timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    let s = total_secs % 60;
    let m = (total_secs / 60) % 60;
    let h = total_secs / 3600;
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_numbered_cues() {
        let segs = vec![
            Segment::new(0.0, 1.5, "hello"),
            Segment::new(61.25, 62.0, "world"),
        ];
        let srt = render(&segs);
        assert_eq!(
            srt,
            "1\n00:00:00,000 --> 00:00:01,500\nhello\n\n2\n00:01:01,250 --> 00:01:02,000\nworld\n"
        );
    }

    #[test]
    fn empty_list_renders_empty() {
        assert_eq!(render(&[]), "");
    }

    #[test]
    fn hours_roll_over() {
        assert_eq!(timestamp(3723.004), "01:02:03,004");
    }
}
