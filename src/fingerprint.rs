//! Content fingerprinting and text normalization.
//!
//! A document snapshot's identity is the SHA-256 of its normalized text.
//! Normalization is deterministic: identical raw input yields bitwise
//! identical output and therefore the same fingerprint across runs,
//! processes, and machines. Case is preserved; whitespace runs collapse to
//! single spaces; paragraph breaks survive as single newlines; Unicode is
//! brought to NFC; HTML input is reduced to its visible text first.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::error::{Error, Result};
use crate::model::ParagraphDigest;

/// Default cap on normalized document size: 2 MiB of UTF-8.
pub const DEFAULT_MAX_BYTES: usize = 2 * 1024 * 1024;

/// Excerpts are bounded to this many characters.
pub const MAX_EXCERPT_CHARS: usize = 500;

/// 256-bit content fingerprint.
///
/// Serialized as a lowercase hex string everywhere (serde, SQL, cache keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(Error::Serialization(format!(
                "fingerprint must be 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_val(chunk[0])?;
            let lo = hex_val(chunk[1])?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

fn hex_val(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Error::Serialization(format!("invalid hex char {:?}", c as char))),
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// SHA-256 over the normalized UTF-8 bytes.
pub fn fingerprint(normalized: &str) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    ContentHash(hasher.finalize().into())
}

// ─── Normalization ───────────────────────────────────────────────────────────

static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style|noscript)\b[^>]*>.*?</(script|style|noscript)>").unwrap());
static COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static BLOCK_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</?(p|div|br|li|ul|ol|h[1-6]|tr|table|section|article|header|footer|blockquote)\b[^>]*>")
        .unwrap()
});
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

/// Configurable normalizer producing the comparison form of a document.
#[derive(Debug, Clone)]
pub struct Normalizer {
    max_bytes: usize,
}

impl Normalizer {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Normalize raw document text.
    ///
    /// `is_html` should come from the transport content type; when unknown,
    /// [`looks_like_html`] sniffs the body. Input larger than the configured
    /// cap fails with `InputTooLarge`.
    pub fn normalize(&self, raw: &str, is_html: bool) -> Result<String> {
        if raw.len() > self.max_bytes {
            return Err(Error::InputTooLarge {
                len: raw.len(),
                max: self.max_bytes,
            });
        }

        let text = if is_html { strip_html(raw) } else { raw.to_string() };
        let text: String = text.nfc().collect();
        Ok(collapse_whitespace(&text))
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES)
    }
}

/// Cheap sniff for HTML bodies served without a content type.
pub fn looks_like_html(raw: &str) -> bool {
    let head: String = raw.trim_start().chars().take(256).collect();
    let lower = head.to_ascii_lowercase();
    lower.starts_with("<!doctype") || lower.starts_with("<html") || lower.contains("<body")
}

/// Reduce HTML to visible text, marking block boundaries as paragraph breaks.
fn strip_html(html: &str) -> String {
    let without_hidden = SCRIPT_RE.replace_all(html, " ");
    let without_comments = COMMENT_RE.replace_all(&without_hidden, " ");
    let with_breaks = BLOCK_TAG_RE.replace_all(&without_comments, "\n\n");
    let text = TAG_RE.replace_all(&with_breaks, " ");
    decode_entities(&text)
}

/// Decode the named and numeric entities that matter for legal text.
fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '&' {
            out.push(c);
            continue;
        }
        let rest = &text[i..];
        let end = rest
            .char_indices()
            .take(13)
            .find(|&(_, ch)| ch == ';')
            .map(|(j, _)| j);
        let Some(end) = end else {
            out.push(c);
            continue;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ => {
                if let Some(num) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                    u32::from_str_radix(num, 16).ok().and_then(char::from_u32)
                } else if let Some(num) = entity.strip_prefix('#') {
                    num.parse::<u32>().ok().and_then(char::from_u32)
                } else {
                    None
                }
            }
        };
        match decoded {
            Some(d) => {
                out.push(d);
                // Skip the consumed entity body.
                for _ in 0..end {
                    chars.next();
                }
            }
            None => out.push(c),
        }
    }
    out
}

/// Collapse whitespace runs to single spaces; runs containing two or more
/// newlines become a single paragraph-break newline.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_ws = false;
    let mut pending_newlines = 0usize;

    for c in text.chars() {
        if c.is_whitespace() {
            pending_ws = true;
            if c == '\n' {
                pending_newlines += 1;
            }
            continue;
        }
        if pending_ws && !out.is_empty() {
            if pending_newlines >= 2 {
                out.push('\n');
            } else {
                out.push(' ');
            }
        }
        pending_ws = false;
        pending_newlines = 0;
        out.push(c);
    }
    out
}

// ─── Excerpts and paragraph digests ──────────────────────────────────────────

/// Byte-safe substring of the normalized text by character offsets.
///
/// Bounded to [`MAX_EXCERPT_CHARS`]; callers must pass `start < end` within
/// the text, otherwise `BadRange`.
pub fn excerpt(normalized: &str, start: usize, end: usize) -> Result<String> {
    let total = normalized.chars().count();
    if start >= end || end > total {
        return Err(Error::BadRange {
            start,
            end,
            len: total,
        });
    }
    let take = (end - start).min(MAX_EXCERPT_CHARS);
    Ok(normalized.chars().skip(start).take(take).collect())
}

/// Split normalized text into its paragraph units.
pub fn paragraphs(normalized: &str) -> Vec<&str> {
    normalized
        .split('\n')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Truncated per-paragraph hash trail stored with each document version.
pub fn paragraph_digests(normalized: &str) -> Vec<ParagraphDigest> {
    paragraphs(normalized)
        .into_iter()
        .map(|p| {
            let mut hasher = Sha256::new();
            hasher.update(p.as_bytes());
            let digest = hasher.finalize();
            ParagraphDigest {
                hash: digest[..8].iter().map(|b| format!("{:02x}", b)).collect(),
                chars: p.chars().count() as u64,
            }
        })
        .collect()
}

/// Section-count heuristic: paragraphs ending with `:` or short all-caps
/// lines read as headings.
pub fn section_count(normalized: &str) -> u32 {
    paragraphs(normalized)
        .iter()
        .filter(|p| {
            p.ends_with(':')
                || (p.chars().count() <= 60
                    && p.chars().any(|c| c.is_alphabetic())
                    && p.chars().filter(|c| c.is_alphabetic()).all(|c| c.is_uppercase()))
        })
        .count() as u32
}
