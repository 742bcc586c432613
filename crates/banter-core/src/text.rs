use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Canonical text form used for content addressing: NFC, trimmed, lowercased.
///
/// Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(text: &str) -> String {
    text.nfc().collect::<String>().trim().to_lowercase()
}

/// SHA-256 hex digest of the normalized text. This is the shared content key
/// for the embedding cache and the message/embedding join.
pub fn content_sha256(text: &str) -> String {
    let mut h = Sha256::new();
    h.update(normalize(text).as_bytes());
    hex::encode(h.finalize())
}

/// Cheap token estimate used by the context budgeter: chars / 4, minimum 1
/// for non-empty text.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        0
    } else {
        (chars / 4).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        for s in ["  Kyiv  ", "КИЇВ", "JavaScript\u{0301}", "", "a  b"] {
            let once = normalize(s);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn normalize_folds_case_and_whitespace() {
        assert_eq!(normalize("  Kyiv "), "kyiv");
        assert_eq!(normalize("КИЇВ"), "київ");
    }

    #[test]
    fn content_key_ignores_surrounding_noise() {
        assert_eq!(content_sha256("Kyiv"), content_sha256("  kyiv  "));
        assert_ne!(content_sha256("kyiv"), content_sha256("lviv"));
    }

    #[test]
    fn token_estimate_is_chars_over_four() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("ab"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }
}
