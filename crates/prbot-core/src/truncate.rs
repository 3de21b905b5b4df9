//! Character-budget truncation for prompt text and user-facing messages.
//!
//! All limits are in characters, not bytes, so multi-byte text is never split
//! in the middle of a code point.

/// Truncate a string slice to at most `max_chars` characters (Unicode-safe).
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

/// Bound `text` to `max_chars` characters.
///
/// Text within budget is returned unchanged. Otherwise the first `max_chars`
/// characters are kept and a marker naming the number of dropped characters is
/// appended, so the same input always produces the same output.
pub fn truncate_with_marker(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    let kept = truncate_str(text, max_chars);
    let omitted = total - max_chars;
    format!("{}\n... [{} chars omitted]", kept, omitted)
}

/// Short form used for single-line messages: keeps `max_chars` total including
/// a trailing `...`.
pub fn truncate_ellipsis(s: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    if max_chars <= 3 {
        return s.chars().take(max_chars).collect();
    }
    format!("{}...", truncate_str(s, max_chars - 3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_budget_is_unchanged() {
        assert_eq!(truncate_with_marker("hello", 5), "hello");
        assert_eq!(truncate_with_marker("", 0), "");
    }

    #[test]
    fn test_marker_reports_omitted_count() {
        let out = truncate_with_marker("abcdefghij", 4);
        assert_eq!(out, "abcd\n... [6 chars omitted]");
    }

    #[test]
    fn test_marker_is_deterministic() {
        let text = "x".repeat(500);
        assert_eq!(truncate_with_marker(&text, 100), truncate_with_marker(&text, 100));
    }

    #[test]
    fn test_truncate_str_unicode_safe() {
        assert_eq!(truncate_str("ééééé", 2), "éé");
        assert_eq!(truncate_str("こんにちは", 10), "こんにちは");
    }

    #[test]
    fn test_truncate_ellipsis_small_max() {
        assert_eq!(truncate_ellipsis("こんにちは", 3), "こんに");
        assert_eq!(truncate_ellipsis("ééééé", 4), "é...");
        assert_eq!(truncate_ellipsis("abc", 0), "");
    }
}
