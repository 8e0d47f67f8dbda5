/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// One-line preview for log output: newlines flattened, long text cut with an ellipsis.
pub fn log_snippet(s: &str, max_chars: usize) -> String {
    let head = prefix_chars(s, max_chars);
    let mut out = head.replace(['\n', '\r'], " ");
    if head.len() < s.len() {
        out.push_str("...");
    }
    out
}
