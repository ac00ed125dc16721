//! Text helpers for summary storage

use std::borrow::Cow;

pub struct TextUtils;

impl TextUtils {
    /// Split `text` into pieces of at most `max_bytes` UTF-8 bytes without
    /// cutting through a character. Concatenating the pieces yields `text`.
    pub fn split_by_bytes(text: &str, max_bytes: usize) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        let max_bytes = max_bytes.max(4);
        let mut chunks = Vec::with_capacity(text.len() / max_bytes + 1);
        let mut start = 0;

        while start < text.len() {
            let mut end = (start + max_bytes).min(text.len());
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            chunks.push(text[start..end].to_string());
            start = end;
        }

        chunks
    }

    /// Truncate text to max length with ellipsis if needed, on a char boundary
    pub fn truncate_with_ellipsis(text: &str, max_len: usize) -> Cow<'_, str> {
        if text.len() <= max_len {
            Cow::Borrowed(text)
        } else if max_len <= 3 {
            Cow::Borrowed("...")
        } else {
            let mut end = max_len - 3;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            let mut result = String::with_capacity(max_len);
            result.push_str(&text[..end]);
            result.push_str("...");
            Cow::Owned(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_reassembles() {
        let text = "abcdefghij".repeat(25);
        let chunks = TextUtils::split_by_bytes(&text, 16);
        assert!(chunks.iter().all(|c| c.len() <= 16));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let text = "héllo wörld ✓✓✓".repeat(10);
        let chunks = TextUtils::split_by_bytes(&text, 5);
        assert!(chunks.iter().all(|c| c.len() <= 5 && !c.is_empty()));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_split_empty() {
        assert!(TextUtils::split_by_bytes("", 10).is_empty());
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(TextUtils::truncate_with_ellipsis("short", 10), "short");
        assert_eq!(TextUtils::truncate_with_ellipsis("a longer sentence", 8), "a lon...");
        assert_eq!(TextUtils::truncate_with_ellipsis("ééééé", 6), "é...");
    }
}
