//! Selector-hint extraction.
//!
//! Monitoring targets may name the page region holding the legal text
//! (`#terms`, `.legal-content`, or a tag name). Extraction narrows the HTML
//! to the hinted elements; the normalizer strips the remaining markup. With
//! no hint, or no hint matching, the full document passes through.

use once_cell::sync::Lazy;
use regex::Regex;

static TAG_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<([a-zA-Z][a-zA-Z0-9]*)").unwrap());

/// Narrow `html` to the regions matched by any of the hints.
pub fn extract_with_hints(html: &str, hints: &[String]) -> String {
    if hints.is_empty() {
        return html.to_string();
    }

    let mut regions = Vec::new();
    for hint in hints {
        if let Some(region) = extract_hint(html, hint) {
            regions.push(region);
        }
    }

    if regions.is_empty() {
        log::debug!("no selector hint matched; using the full page");
        html.to_string()
    } else {
        regions.join("\n\n")
    }
}

fn extract_hint<'a>(html: &'a str, hint: &str) -> Option<&'a str> {
    let pattern = match hint.chars().next()? {
        '#' => format!(
            r#"(?is)<[a-zA-Z][a-zA-Z0-9]*\b[^>]*\bid\s*=\s*["']{}["'][^>]*>"#,
            regex::escape(&hint[1..])
        ),
        '.' => format!(
            r#"(?is)<[a-zA-Z][a-zA-Z0-9]*\b[^>]*\bclass\s*=\s*["'][^"']*\b{}\b[^"']*["'][^>]*>"#,
            regex::escape(&hint[1..])
        ),
        _ => format!(r"(?is)<{}\b[^>]*>", regex::escape(hint)),
    };
    let start_re = Regex::new(&pattern).ok()?;
    let start = start_re.find(html)?;

    let tag = TAG_NAME_RE
        .captures(start.as_str())?
        .get(1)?
        .as_str()
        .to_lowercase();
    let end = find_matching_close(html, start.end(), &tag)?;
    Some(&html[start.start()..end])
}

/// Scan for the close tag balancing nested elements of the same name.
///
/// Works on the original string so byte offsets stay valid regardless of
/// the surrounding content.
fn find_matching_close(html: &str, from: usize, tag: &str) -> Option<usize> {
    let token_re = Regex::new(&format!(r"(?i)</?{}\b", regex::escape(tag))).ok()?;

    let mut depth = 1usize;
    let mut pos = from;
    while depth > 0 {
        let token = token_re.find(&html[pos..])?;
        let abs_start = pos + token.start();
        let is_close = token.as_str().starts_with("</");
        pos = pos + token.end();

        if is_close {
            depth -= 1;
            let tag_end = html[abs_start..].find('>').map(|i| abs_start + i + 1)?;
            pos = tag_end;
            if depth == 0 {
                return Some(pos);
            }
        } else {
            depth += 1;
        }
    }
    Some(pos)
}
