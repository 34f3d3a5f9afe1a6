//! Efficient text processing utilities

use std::borrow::Cow;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
}

/// Text sizing and shaping helpers shared across the engine
pub struct TextUtils;

impl TextUtils {
    /// Approximate token count: ceil(characterCount / 4).
    ///
    /// The real tokenizer lives with the answering model; budgets here only
    /// need a stable, cheap estimate that never undercounts by much.
    pub fn estimate_tokens(text: &str) -> usize {
        (text.chars().count() + 3) / 4
    }

    /// Truncate text to at most `max_chars` characters, appending an ellipsis
    /// when anything was cut. Always splits on a char boundary.
    pub fn truncate_chars(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            return Cow::Borrowed(text);
        }
        if max_chars <= 3 {
            return Cow::Borrowed("...");
        }
        let mut result: String = text.chars().take(max_chars - 3).collect();
        result.push_str("...");
        Cow::Owned(result)
    }

    /// Collapse a multi-line text into a single line with normalized
    /// whitespace, capped at `max_chars`.
    pub fn one_line(text: &str, max_chars: usize) -> String {
        let collapsed = WHITESPACE_REGEX.replace_all(text.trim(), " ");
        Self::truncate_chars(&collapsed, max_chars).into_owned()
    }

    /// Normalize whitespace efficiently
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        if WHITESPACE_REGEX.is_match(text) {
            Cow::Owned(WHITESPACE_REGEX.replace_all(text, " ").trim().to_string())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// First sentence of a text (up to the first terminator), capped.
    pub fn first_sentence(text: &str, max_chars: usize) -> String {
        let trimmed = text.trim();
        let end = trimmed
            .char_indices()
            .find(|(_, c)| matches!(c, '.' | '!' | '?'))
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(trimmed.len());
        Self::one_line(&trimmed[..end], max_chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(TextUtils::estimate_tokens(""), 0);
        assert_eq!(TextUtils::estimate_tokens("abcd"), 1);
        assert_eq!(TextUtils::estimate_tokens("abcde"), 2);
        assert_eq!(TextUtils::estimate_tokens("a"), 1);
    }

    #[test]
    fn test_truncate_chars_boundary_safe() {
        assert_eq!(TextUtils::truncate_chars("short", 10), "short");
        assert_eq!(TextUtils::truncate_chars("abcdefghij", 8), "abcde...");
        // Multi-byte characters must not be split
        let s = "日本語のテキストです";
        let truncated = TextUtils::truncate_chars(s, 6);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.chars().count(), 6);
    }

    #[test]
    fn test_one_line_collapses_whitespace() {
        assert_eq!(TextUtils::one_line("a\n  b\t c", 100), "a b c");
        assert_eq!(TextUtils::one_line("  spaced  ", 100), "spaced");
    }

    #[test]
    fn test_first_sentence() {
        assert_eq!(
            TextUtils::first_sentence("First point. Second point.", 100),
            "First point."
        );
        assert_eq!(TextUtils::first_sentence("no terminator here", 100), "no terminator here");
    }
}
