//! Change detection between document captures.
//!
//! The previous capture is only available as its paragraph hash trail
//! (raw text is never retained), so the diff runs over paragraph digests:
//! LCS on the hash sequences yields added/removed runs, and paired runs
//! count as modifications. Descriptive snippets come from the *new* text
//! only.

use crate::fingerprint::{paragraph_digests, paragraphs, section_count, ContentHash};
use crate::model::{ChangeKind, DocumentVersion, ParagraphDigest};

/// Largest LCS table we are willing to fill; beyond this the diff falls
/// back to multiset counting.
const MAX_LCS_CELLS: usize = 4_000_000;

/// Snippet budget for significant changes.
const SNIPPET_CHARS: usize = 140;
const MAX_SIGNIFICANT: usize = 10;

/// Outcome of evaluating a fresh capture against the stored trail.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeDecision {
    /// Same fingerprint; only the monitoring clock moves.
    NoChange,
    Changed(DetectedChange),
}

/// A change worth re-analyzing.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedChange {
    pub kind: ChangeKind,
    pub summary: String,
    pub significant_changes: Vec<String>,
    /// Always zero at detection time; the pipeline recomputes the true
    /// delta once the new risk score exists.
    pub risk_delta: i32,
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}

/// Decide whether a fresh capture needs analysis.
pub fn evaluate(
    previous: Option<&DocumentVersion>,
    new_fingerprint: ContentHash,
    new_normalized: &str,
) -> ChangeDecision {
    let Some(previous) = previous else {
        return ChangeDecision::Changed(DetectedChange {
            kind: ChangeKind::Initial,
            summary: "initial capture".to_string(),
            significant_changes: Vec::new(),
            risk_delta: 0,
            added: 0,
            removed: 0,
            modified: 0,
        });
    };

    if previous.fingerprint == new_fingerprint {
        return ChangeDecision::NoChange;
    }

    let new_paragraphs = paragraphs(new_normalized);
    let new_digests = paragraph_digests(new_normalized);
    let diff = diff_digests(&previous.paragraph_digest, &new_digests);

    let total = new_digests.len().max(previous.paragraph_digest.len()).max(1);
    let changed_units = diff.added + diff.removed + diff.modified;
    let changed_ratio = changed_units as f64 / total as f64;

    let old_sections = previous.section_count.max(0) as f64;
    let new_sections = f64::from(section_count(new_normalized));
    let section_shift = if old_sections > 0.0 {
        (new_sections - old_sections).abs() / old_sections
    } else if new_sections > 0.0 {
        1.0
    } else {
        0.0
    };

    let kind = if changed_ratio > 0.5 || section_shift > 0.2 {
        ChangeKind::StructureChanged
    } else {
        ChangeKind::Modified
    };

    let summary = format!(
        "{} added, {} removed, {} modified paragraphs",
        diff.added, diff.removed, diff.modified
    );
    let significant_changes = significant_snippets(&new_paragraphs, &diff.new_changed_indices);

    ChangeDecision::Changed(DetectedChange {
        kind,
        summary,
        significant_changes,
        risk_delta: 0,
        added: diff.added,
        removed: diff.removed,
        modified: diff.modified,
    })
}

struct DigestDiff {
    added: usize,
    removed: usize,
    modified: usize,
    /// Indices into the new paragraph list that are new or rewritten.
    new_changed_indices: Vec<usize>,
}

fn diff_digests(old: &[ParagraphDigest], new: &[ParagraphDigest]) -> DigestDiff {
    if old.len().saturating_mul(new.len()) > MAX_LCS_CELLS {
        return multiset_diff(old, new);
    }

    // LCS over the hash sequences.
    let n = old.len();
    let m = new.len();
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * (m + 1) + j] = if old[i].hash == new[j].hash {
                table[(i + 1) * (m + 1) + j + 1] + 1
            } else {
                table[(i + 1) * (m + 1) + j].max(table[i * (m + 1) + j + 1])
            };
        }
    }

    // Walk the edit script; a run of deletions followed by insertions (or
    // vice versa) reads as paragraph modifications.
    let mut added = 0;
    let mut removed = 0;
    let mut modified = 0;
    let mut new_changed_indices = Vec::new();
    let (mut i, mut j) = (0, 0);
    let mut run_removed = 0usize;
    let mut run_added: Vec<usize> = Vec::new();

    let mut flush_run = |run_removed: &mut usize, run_added: &mut Vec<usize>| {
        let pairs = (*run_removed).min(run_added.len());
        modified += pairs;
        removed += *run_removed - pairs;
        added += run_added.len() - pairs;
        new_changed_indices.extend(run_added.iter().copied());
        *run_removed = 0;
        run_added.clear();
    };

    while i < n || j < m {
        if i < n && j < m && old[i].hash == new[j].hash {
            flush_run(&mut run_removed, &mut run_added);
            i += 1;
            j += 1;
        } else if j < m
            && (i == n || table[i * (m + 1) + j + 1] >= table[(i + 1) * (m + 1) + j])
        {
            run_added.push(j);
            j += 1;
        } else {
            run_removed += 1;
            i += 1;
        }
    }
    flush_run(&mut run_removed, &mut run_added);

    DigestDiff {
        added,
        removed,
        modified,
        new_changed_indices,
    }
}

/// Order-insensitive fallback for very large documents.
fn multiset_diff(old: &[ParagraphDigest], new: &[ParagraphDigest]) -> DigestDiff {
    use std::collections::HashMap;

    let mut counts: HashMap<&str, i64> = HashMap::new();
    for digest in old {
        *counts.entry(digest.hash.as_str()).or_default() += 1;
    }

    let mut added = 0;
    let mut new_changed_indices = Vec::new();
    for (idx, digest) in new.iter().enumerate() {
        let entry = counts.entry(digest.hash.as_str()).or_default();
        if *entry > 0 {
            *entry -= 1;
        } else {
            added += 1;
            new_changed_indices.push(idx);
        }
    }
    let removed: i64 = counts.values().filter(|&&v| v > 0).sum();

    DigestDiff {
        added,
        removed: removed as usize,
        modified: 0,
        new_changed_indices,
    }
}

/// Top changed paragraphs by size, rendered as heading or leading snippet.
fn significant_snippets(new_paragraphs: &[&str], changed_indices: &[usize]) -> Vec<String> {
    let mut by_size: Vec<&str> = changed_indices
        .iter()
        .filter_map(|&idx| new_paragraphs.get(idx).copied())
        .collect();
    by_size.sort_by_key(|p| std::cmp::Reverse(p.chars().count()));
    by_size
        .into_iter()
        .take(MAX_SIGNIFICANT)
        .map(|p| {
            if p.chars().count() <= SNIPPET_CHARS {
                p.to_string()
            } else {
                p.chars().take(SNIPPET_CHARS).collect()
            }
        })
        .collect()
}
