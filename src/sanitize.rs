//! Output sanitization applied to every stage result before it is
//! checkpointed or handed to the next stage.

use regex::Regex;
use std::sync::LazyLock;

/// Paired reasoning block, markers included. Non-greedy, spans lines.
static REASONING_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<think\b[^>]*>.*?</think\s*>").expect("reasoning block pattern is valid")
});

/// Any leftover open or close marker.
static STRAY_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?think\b[^>]*>").expect("stray marker pattern is valid")
});

/// Three or more line breaks, whitespace-only lines included.
static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("blank run pattern is valid")
});

/// Clean raw provider output.
///
/// - removes `<think>...</think>` blocks (case-insensitive, multi-line)
/// - removes unbalanced `<think>` / `</think>` markers
/// - collapses runs of blank lines to a single blank line
/// - trims surrounding whitespace
///
/// Pure and deterministic.
pub fn sanitize(raw: &str) -> String {
    let text = raw.replace("\r\n", "\n");
    let text = REASONING_BLOCK.replace_all(&text, "");
    let text = STRAY_MARKER.replace_all(&text, "");
    let text = BLANK_RUN.replace_all(&text, "\n\n");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_reasoning_block() {
        assert_eq!(sanitize("before<think>secret</think>after"), "beforeafter");
    }

    #[test]
    fn test_strips_multiline_block_case_insensitive() {
        let raw = "<THINK>\nstep 1\nstep 2\n</Think>\n# Title\n\nBody";
        assert_eq!(sanitize(raw), "# Title\n\nBody");
    }

    #[test]
    fn test_strips_unbalanced_markers() {
        assert_eq!(sanitize("draft</think> text"), "draft text");
        assert_eq!(sanitize("<think>draft text"), "draft text");
    }

    #[test]
    fn test_removes_every_block() {
        let raw = "a<think>x</think>b<think>y</think>c";
        assert_eq!(sanitize(raw), "abc");
    }

    #[test]
    fn test_collapses_blank_lines() {
        assert_eq!(sanitize("one\n\n\n\ntwo"), "one\n\ntwo");
        assert_eq!(sanitize("one\n \n\t\n\ntwo"), "one\n\ntwo");
        assert_eq!(sanitize("one\r\n\r\n\r\ntwo"), "one\n\ntwo");
        // A single blank line is left alone.
        assert_eq!(sanitize("one\n\ntwo"), "one\n\ntwo");
    }

    #[test]
    fn test_trims_and_is_idempotent() {
        let raw = "  \n<think>plan</think>\n\n\n\nArticle body\n\n\n";
        let once = sanitize(raw);
        assert_eq!(once, "Article body");
        assert_eq!(sanitize(&once), once);
    }

    #[test]
    fn test_plain_text_unchanged() {
        assert_eq!(sanitize("no markers here"), "no markers here");
        assert_eq!(sanitize(""), "");
    }
}
