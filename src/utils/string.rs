/// Find the largest valid UTF-8 boundary at or before the given byte index.
#[inline]
fn safe_byte_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    s.char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= max_bytes)
        .last()
        .unwrap_or(0)
}

/// Truncate a string with a marker if it exceeds `max_len` bytes (UTF-8 safe).
///
/// Used to bound agent stderr and test output before it is persisted on a run.
#[inline]
pub fn truncate_with_marker(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let boundary = safe_byte_boundary(s, max_len);
        format!("{}...[truncated]", &s[..boundary])
    }
}

/// Truncate a string to a maximum character count, adding "..." when cut.
#[inline]
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", truncated)
}
