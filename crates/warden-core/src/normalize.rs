//! Error text normalization for proposal deduplication.
//!
//! Two errors are "the same" when they differ only in volatile details:
//! ids, counters, timestamps, whitespace. Normalization strips those so a
//! prefix comparison can catch near-identical failures.

use lazy_static::lazy_static;
use regex::Regex;

use crate::sanitize::truncate;

lazy_static! {
    static ref UUID_PATTERN: Regex = Regex::new(
        r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}"
    ).unwrap();

    static ref HEX_PATTERN: Regex = Regex::new(r"\b0x[0-9a-f]+\b|\b[0-9a-f]{12,}\b").unwrap();

    static ref DIGITS_PATTERN: Regex = Regex::new(r"\d+").unwrap();

    static ref WHITESPACE_PATTERN: Regex = Regex::new(r"\s+").unwrap();
}

/// Normalize an error string into a dedup key of at most `max_chars`.
pub fn normalize_error(error: &str, max_chars: usize) -> String {
    let lowered = error.to_lowercase();
    let no_ids = UUID_PATTERN.replace_all(&lowered, "<id>");
    let no_hex = HEX_PATTERN.replace_all(&no_ids, "<hex>");
    let no_digits = DIGITS_PATTERN.replace_all(&no_hex, "#");
    let collapsed = WHITESPACE_PATTERN.replace_all(no_digits.trim(), " ");

    match collapsed.char_indices().nth(max_chars) {
        None => collapsed.into_owned(),
        Some((idx, _)) => collapsed[..idx].trim_end().to_string(),
    }
}

/// First line of an error, bounded for display.
pub fn summarize_error(error: &str, max_chars: usize) -> String {
    let first_line = error.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    truncate(first_line.trim(), max_chars)
}

/// Whether two normalized errors describe the same failure.
///
/// Empty keys never match, so a blank error cannot suppress every later one.
pub fn is_near_duplicate(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.starts_with(b) || b.starts_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volatile_details_removed() {
        let a = normalize_error(
            "Timeout after 30012ms calling search (request 3f2a9c1e-0b4d-4e5f-8a7b-112233445566)",
            120,
        );
        let b = normalize_error(
            "timeout  after 29998ms calling search (request 9aa0c1e2-1111-4e5f-8a7b-aabbccddeeff)",
            120,
        );
        assert_eq!(a, b);
        assert_eq!(a, "timeout after #ms calling search (request <id>)");
    }

    #[test]
    fn test_hex_addresses_collapsed() {
        assert_eq!(
            normalize_error("segfault at 0xdeadbeef", 120),
            "segfault at <hex>"
        );
    }

    #[test]
    fn test_normalized_length_bounded() {
        let long = "error ".repeat(100);
        assert!(normalize_error(&long, 20).chars().count() <= 20);
    }

    #[test]
    fn test_near_duplicate_prefix_either_way() {
        assert!(is_near_duplicate("connection refused", "connection refused by host #"));
        assert!(is_near_duplicate("connection refused by host #", "connection refused"));
        assert!(!is_near_duplicate("connection refused", "permission denied"));
        assert!(!is_near_duplicate("", "anything"));
    }

    #[test]
    fn test_summary_uses_first_line() {
        let summary = summarize_error("\n  KeyError: 'city'\nTraceback...", 100);
        assert_eq!(summary, "KeyError: 'city'");
    }
}
