// src/utils/text.rs

//! Text normalization, fingerprinting and tokenization.

use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

/// Decode bytes as UTF-8, replacing invalid sequences and dropping a BOM.
pub fn decode(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.strip_prefix('\u{feff}').unwrap_or(&text).to_string()
}

/// Normalize text so that cosmetic differences do not change the fingerprint.
///
/// Line breaks are unified to `\n`, control characters removed, runs of
/// whitespace inside a line collapsed to one space, lines trimmed and empty
/// lines dropped. Line structure is kept for the diff.
pub fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");

    unified
        .lines()
        .map(|line| {
            line.chars()
                .filter(|c| !c.is_control() || *c == '\t')
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Hex-encoded SHA-256 of the given text.
pub fn fingerprint(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(digest)
}

/// Lowercased Unicode words of the text.
pub fn terms(text: &str) -> Vec<String> {
    text.unicode_words().map(|w| w.to_lowercase()).collect()
}

/// Truncate to at most `max_bytes`, respecting char boundaries.
pub fn truncate_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
