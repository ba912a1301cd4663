//! Deterministic clause matching against the active rule library.
//!
//! Keyword and regex checks produce candidate findings positioned in the
//! normalized text (character offsets). Overlapping candidates are collapsed
//! keeping the highest severity, then the longest span, then the lowest
//! start — the same policy later applied when semantic matches merge in.

use regex::Regex;
use uuid::Uuid;

use crate::model::{PatternRule, Severity};

/// Base confidence of a single keyword hit.
const KEYWORD_BASE_CONFIDENCE: f64 = 0.6;
/// Bonus per additional distinct keyword of the same rule in a paragraph.
const KEYWORD_BONUS: f64 = 0.1;
const KEYWORD_CONFIDENCE_CAP: f64 = 0.9;
/// Regex hits carry more signal than plain keyword containment.
const REGEX_CONFIDENCE: f64 = 0.85;

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    Keyword,
    Regex,
    Semantic,
}

/// A located candidate clause, prior to persistence.
#[derive(Debug, Clone)]
pub struct CandidateFinding {
    pub category: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub confidence: f64,
    pub pattern_id: Option<Uuid>,
    /// Character offsets into the normalized text.
    pub start: usize,
    pub end: usize,
    pub source: MatchSource,
    pub recommendation: Option<String>,
    pub impact: Option<String>,
}

impl CandidateFinding {
    fn overlaps(&self, other: &CandidateFinding) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True when `self` wins the overlap dedup against `other`.
    fn beats(&self, other: &CandidateFinding) -> bool {
        if self.severity != other.severity {
            return self.severity > other.severity;
        }
        let (self_span, other_span) = (self.end - self.start, other.end - other.start);
        if self_span != other_span {
            return self_span > other_span;
        }
        self.start < other.start
    }
}

struct CompiledRule {
    rule: PatternRule,
    regex: Option<Regex>,
    keywords_lower: Vec<String>,
}

/// A rule library compiled for scanning.
pub struct PatternMatcher {
    rules: Vec<CompiledRule>,
}

impl PatternMatcher {
    /// Compile the active rules. Rules with an invalid regex keep their
    /// keyword checks and log the defect.
    pub fn compile(rules: Vec<PatternRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let regex = rule.regex.as_deref().and_then(|pattern| {
                    Regex::new(pattern)
                        .map_err(|e| {
                            log::warn!("rule '{}' has an invalid regex: {e}", rule.name);
                            e
                        })
                        .ok()
                });
                let keywords_lower = rule.keywords.iter().map(|k| k.to_lowercase()).collect();
                CompiledRule {
                    regex,
                    keywords_lower,
                    rule,
                }
            })
            .collect();
        Self { rules }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Scan normalized text, returning deduplicated candidates ordered by
    /// position.
    pub fn scan(&self, normalized: &str) -> Vec<CandidateFinding> {
        let lower = lowercase_preserving_offsets(normalized);
        // Char offsets are identical between the two strings, byte offsets
        // are not; each string gets its own index.
        let norm_index = CharIndex::new(normalized);
        let lower_index = CharIndex::new(&lower);

        let mut candidates = Vec::new();
        for compiled in &self.rules {
            candidates.extend(self.scan_rule(compiled, normalized, &lower, &norm_index, &lower_index));
        }
        dedup_overlaps(candidates)
    }

    fn scan_rule(
        &self,
        compiled: &CompiledRule,
        normalized: &str,
        lower: &str,
        norm_index: &CharIndex,
        lower_index: &CharIndex,
    ) -> Vec<CandidateFinding> {
        let mut out = Vec::new();
        let paragraph_spans = lower_index.paragraph_spans();

        // Keyword containment, scored up by co-occurring keywords within the
        // same paragraph.
        for keyword in &compiled.keywords_lower {
            let mut from = 0;
            while let Some(found) = lower[from..].find(keyword.as_str()) {
                let byte_start = from + found;
                let byte_end = byte_start + keyword.len();
                from = byte_end;

                let (start, end) = lower_index.to_chars(byte_start, byte_end);
                let paragraph = paragraph_span_for(&paragraph_spans, start);
                let distinct_hits = compiled
                    .keywords_lower
                    .iter()
                    .filter(|k| {
                        lower[lower_index.to_byte(paragraph.0)..lower_index.to_byte(paragraph.1)]
                            .contains(k.as_str())
                    })
                    .count();
                let confidence = (KEYWORD_BASE_CONFIDENCE
                    + KEYWORD_BONUS * distinct_hits.saturating_sub(1) as f64)
                    .min(KEYWORD_CONFIDENCE_CAP);

                out.push(self.candidate(compiled, start, end, confidence, MatchSource::Keyword));
            }
        }

        // Regex matches.
        if let Some(regex) = &compiled.regex {
            for found in regex.find_iter(normalized) {
                let (start, end) = norm_index.to_chars(found.start(), found.end());
                out.push(self.candidate(compiled, start, end, REGEX_CONFIDENCE, MatchSource::Regex));
            }
        }

        out
    }

    fn candidate(
        &self,
        compiled: &CompiledRule,
        start: usize,
        end: usize,
        confidence: f64,
        source: MatchSource,
    ) -> CandidateFinding {
        let rule = &compiled.rule;
        CandidateFinding {
            category: rule.category.clone(),
            title: rule.name.clone(),
            description: rule.description.clone(),
            severity: rule.severity,
            confidence,
            pattern_id: Some(rule.id),
            start,
            end,
            source,
            recommendation: rule
                .legal_basis
                .as_ref()
                .map(|basis| format!("Review against {basis}")),
            impact: None,
        }
    }
}

/// Collapse overlapping candidates under the severity/span/position policy.
pub fn dedup_overlaps(mut candidates: Vec<CandidateFinding>) -> Vec<CandidateFinding> {
    candidates.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| (b.end - b.start).cmp(&(a.end - a.start)))
            .then_with(|| a.start.cmp(&b.start))
    });

    let mut kept: Vec<CandidateFinding> = Vec::new();
    for candidate in candidates {
        match kept.iter_mut().find(|winner| winner.overlaps(&candidate)) {
            Some(winner) => {
                debug_assert!(winner.beats(&candidate) || !candidate.beats(winner));
                // The loser still contributes its confidence signal.
                winner.confidence = winner.confidence.max(candidate.confidence).min(1.0);
            }
            None => kept.push(candidate),
        }
    }
    kept.sort_by_key(|c| c.start);
    kept
}

// ─── Offset bookkeeping ──────────────────────────────────────────────────────

/// Byte/char offset translation for one text.
pub struct CharIndex {
    /// Byte offset of every char, plus the terminal byte length.
    byte_of_char: Vec<usize>,
    /// Paragraph spans in char offsets.
    paragraphs: Vec<(usize, usize)>,
}

impl CharIndex {
    pub fn new(text: &str) -> Self {
        let mut byte_of_char: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
        byte_of_char.push(text.len());

        let mut paragraphs = Vec::new();
        let mut start = 0usize;
        let mut pos = 0usize;
        for c in text.chars() {
            if c == '\n' {
                if pos > start {
                    paragraphs.push((start, pos));
                }
                start = pos + 1;
            }
            pos += 1;
        }
        if pos > start {
            paragraphs.push((start, pos));
        }

        Self {
            byte_of_char,
            paragraphs,
        }
    }

    /// Translate a byte range to a char range.
    pub fn to_chars(&self, byte_start: usize, byte_end: usize) -> (usize, usize) {
        let start = self.byte_of_char.partition_point(|&b| b < byte_start);
        let end = self.byte_of_char.partition_point(|&b| b < byte_end);
        (start, end)
    }

    /// Byte offset of a char offset.
    pub fn to_byte(&self, char_offset: usize) -> usize {
        self.byte_of_char[char_offset.min(self.byte_of_char.len() - 1)]
    }

    pub fn paragraph_spans(&self) -> Vec<(usize, usize)> {
        self.paragraphs.clone()
    }

    pub fn char_len(&self) -> usize {
        self.byte_of_char.len() - 1
    }
}

fn paragraph_span_for(spans: &[(usize, usize)], char_offset: usize) -> (usize, usize) {
    spans
        .iter()
        .copied()
        .find(|&(start, end)| char_offset >= start && char_offset < end)
        .unwrap_or((char_offset, char_offset + 1))
}

/// Lowercase without shifting char offsets: characters whose lowercase form
/// is a different length are kept as-is, which is exact for the ASCII legal
/// text this pipeline sees and safe everywhere else.
fn lowercase_preserving_offsets(text: &str) -> String {
    text.chars()
        .map(|c| {
            let mut lower = c.to_lowercase();
            match (lower.next(), lower.next()) {
                (Some(single), None) => single,
                _ => c,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::builtin_rules;

    fn matcher() -> PatternMatcher {
        PatternMatcher::compile(builtin_rules())
    }

    #[test]
    fn broad_collection_clause_is_found_with_position() {
        let text = "Welcome to the service.\nWe may collect any information you provide.";
        let findings = matcher().scan(text);

        let hit = findings
            .iter()
            .find(|f| f.category == "data_collection")
            .expect("data_collection finding");
        assert_eq!(hit.severity, Severity::High);
        assert!(hit.confidence >= 0.6);
        assert!(hit.pattern_id.is_some());

        let excerpt: String = text
            .chars()
            .skip(hit.start)
            .take(hit.end - hit.start)
            .collect();
        assert!(excerpt.to_lowercase().contains("collect any information"));
    }

    #[test]
    fn class_action_waiver_is_critical() {
        let text = "You waive the right to participate in class actions.";
        let findings = matcher().scan(text);
        let hit = findings
            .iter()
            .find(|f| f.category == "user_rights")
            .expect("user_rights finding");
        assert_eq!(hit.severity, Severity::Critical);
    }

    #[test]
    fn overlapping_matches_keep_the_highest_severity() {
        let low = CandidateFinding {
            category: "liability".into(),
            title: "a".into(),
            description: String::new(),
            severity: Severity::Medium,
            confidence: 0.95,
            pattern_id: None,
            start: 10,
            end: 40,
            source: MatchSource::Keyword,
            recommendation: None,
            impact: None,
        };
        let high = CandidateFinding {
            severity: Severity::Critical,
            confidence: 0.7,
            start: 20,
            end: 35,
            ..low.clone()
        };
        let elsewhere = CandidateFinding {
            start: 100,
            end: 120,
            ..low.clone()
        };

        let kept = dedup_overlaps(vec![low, high, elsewhere]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].severity, Severity::Critical);
        // The absorbed match still lifts the winner's confidence.
        assert!((kept[0].confidence - 0.95).abs() < 1e-9);
        assert_eq!(kept[1].start, 100);
    }

    #[test]
    fn severity_tie_breaks_by_span_then_position() {
        let base = CandidateFinding {
            category: "x".into(),
            title: "t".into(),
            description: String::new(),
            severity: Severity::High,
            confidence: 0.8,
            pattern_id: None,
            start: 0,
            end: 10,
            source: MatchSource::Keyword,
            recommendation: None,
            impact: None,
        };
        let longer = CandidateFinding {
            start: 5,
            end: 30,
            ..base.clone()
        };
        let kept = dedup_overlaps(vec![base, longer]);
        assert_eq!(kept.len(), 1);
        assert_eq!((kept[0].start, kept[0].end), (5, 30));
    }

    #[test]
    fn multiple_keywords_in_one_paragraph_raise_confidence() {
        // Two keywords of the third-party rule in one paragraph.
        let text = "We share your information and may disclose to third parties at will.";
        let findings = matcher().scan(text);
        let hit = findings
            .iter()
            .find(|f| f.category == "data_sharing")
            .expect("data_sharing finding");
        assert!(hit.confidence > KEYWORD_BASE_CONFIDENCE);
    }

    #[test]
    fn char_offsets_survive_multibyte_text() {
        let text = "Préambule légal.\nYou waive the right to participate in class actions.";
        let findings = matcher().scan(text);
        let hit = findings
            .iter()
            .find(|f| f.category == "user_rights")
            .expect("user_rights finding");

        let excerpt: String = text
            .chars()
            .skip(hit.start)
            .take(hit.end - hit.start)
            .collect();
        assert!(excerpt.contains("class action"));
    }

    #[test]
    fn benign_text_produces_no_findings() {
        let findings = matcher().scan("This document describes our holiday schedule.");
        assert!(findings.is_empty());
    }
}
