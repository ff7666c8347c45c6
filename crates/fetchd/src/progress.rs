//! Stateless interpreter over chunks of external tool output.
//!
//! Download tools print human-oriented status lines; this module extracts
//! the two signals the job manager cares about (completion percentage and
//! destination file name) and ignores everything else. It depends only on
//! output conventions, not on which tool produced the text.

use std::path::Path;

/// Literal prefix download tools print before the destination path,
/// e.g. `[download] Destination: /tmp/movie.mp4`.
const DESTINATION_MARKER: &str = "Destination: ";

/// Signals extracted from one chunk of freshly arrived output.
///
/// Either field may be absent; an absent field means "no new information",
/// never "reset the old value".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSignal {
    pub percent: Option<f64>,
    pub filename: Option<String>,
}

impl ProgressSignal {
    /// True when the chunk carried no recognizable signal at all.
    pub fn is_empty(&self) -> bool {
        self.percent.is_none() && self.filename.is_none()
    }
}

/// Scan one chunk of output for progress signals.
///
/// A chunk that matches nothing produces an empty signal; parsing never
/// fails. Percentage and filename extraction are independent, so a single
/// chunk may yield both.
pub fn scan_chunk(chunk: &str) -> ProgressSignal {
    ProgressSignal {
        percent: extract_percent(chunk),
        filename: extract_filename(chunk),
    }
}

/// Extract the first number (optionally fractional) immediately followed by
/// a percent sign. The latest chunk always wins; no smoothing across chunks.
fn extract_percent(chunk: &str) -> Option<f64> {
    let bytes = chunk.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'%' {
            continue;
        }
        // Walk back over the digits (and at most one dot) preceding the sign.
        let mut start = i;
        let mut seen_dot = false;
        while start > 0 {
            let c = bytes[start - 1];
            if c.is_ascii_digit() {
                start -= 1;
            } else if c == b'.' && !seen_dot {
                seen_dot = true;
                start -= 1;
            } else {
                break;
            }
        }
        if start == i {
            continue;
        }
        if let Ok(value) = chunk[start..i].parse::<f64>() {
            return Some(value.min(100.0).max(0.0));
        }
    }
    None
}

/// Extract the file name from a destination-announced line, if any.
/// Only the last path segment is reported.
fn extract_filename(chunk: &str) -> Option<String> {
    for line in chunk.lines() {
        let Some(pos) = line.find(DESTINATION_MARKER) else {
            continue;
        };
        let path = line[pos + DESTINATION_MARKER.len()..].trim();
        if path.is_empty() {
            continue;
        }
        if let Some(name) = Path::new(path).file_name().and_then(|n| n.to_str()) {
            return Some(name.to_string());
        }
    }
    None
}
