//! Risk scoring.
//!
//! The model's overall score is authoritative when it returns one in range;
//! otherwise the score is a severity-weighted sum over the findings. The
//! per-version risk delta is the completed score minus the previous
//! version's score.

use crate::model::Severity;

/// Deterministic fallback: weighted sum of finding severities, capped.
pub fn severity_weighted_score(severities: &[Severity]) -> u32 {
    severities
        .iter()
        .map(|s| s.risk_weight())
        .sum::<u32>()
        .min(100)
}

/// Pick the authoritative score for a completed analysis.
pub fn resolve_risk_score(llm_score: Option<u32>, severities: &[Severity]) -> u32 {
    match llm_score {
        Some(score) if score <= 100 => score,
        _ => severity_weighted_score(severities),
    }
}

/// Score movement against the previous version.
pub fn risk_delta(current: u32, previous: Option<u32>) -> i32 {
    current as i32 - previous.unwrap_or(0) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_sum_caps_at_one_hundred() {
        assert_eq!(severity_weighted_score(&[]), 0);
        assert_eq!(
            severity_weighted_score(&[Severity::Low, Severity::Medium]),
            20
        );
        assert_eq!(
            severity_weighted_score(&[Severity::Critical, Severity::Critical, Severity::High]),
            100
        );
    }

    #[test]
    fn llm_score_wins_when_present() {
        assert_eq!(resolve_risk_score(Some(78), &[Severity::Low]), 78);
        assert_eq!(resolve_risk_score(None, &[Severity::High]), 30);
    }

    #[test]
    fn delta_is_signed_against_previous() {
        assert_eq!(risk_delta(70, Some(55)), 15);
        assert_eq!(risk_delta(40, Some(55)), -15);
        assert_eq!(risk_delta(70, None), 70);
    }
}
