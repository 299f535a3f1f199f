//! Splitting of socket payloads into device log lines.
//!
//! The device batches several serial lines into one WebSocket text frame, so
//! every payload is split before anyone looks at it.

/// Splits a payload into non-empty lines, dropping trailing `\r`.
pub fn split_lines(payload: &str) -> impl Iterator<Item = &str> {
    payload
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.trim().is_empty())
}

/// Returns true when `line` carries the readiness `marker`.
///
/// Matching is by substring on the trimmed marker; an empty marker never
/// matches.
pub fn matches_marker(line: &str, marker: &str) -> bool {
    let marker = marker.trim();
    !marker.is_empty() && line.contains(marker)
}
