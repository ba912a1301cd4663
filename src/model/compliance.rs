//! Compliance alerts, jurisdiction rules, and trend windows.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::analysis::Severity;
use super::pattern::Jurisdiction;

/// Lifecycle of a compliance alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AlertStatus::Open),
            "acknowledged" => Some(AlertStatus::Acknowledged),
            "resolved" => Some(AlertStatus::Resolved),
            _ => None,
        }
    }
}

/// An open issue raised for one document against one jurisdiction rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceAlert {
    pub id: Uuid,
    pub document_id: Uuid,
    pub pattern_id: Option<Uuid>,
    pub jurisdiction: Jurisdiction,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    pub status: AlertStatus,
    /// Structured supporting detail; never contains document text.
    pub evidence: serde_json::Value,
}

/// Aggregate rule evaluated after each completed analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JurisdictionRule {
    pub id: Uuid,
    pub jurisdiction: Jurisdiction,
    /// Finding categories a compliant analysis is expected to cover.
    pub required_category_coverage: Vec<String>,
    /// Pattern rule ids whose presence is itself a violation.
    pub forbidden_patterns: Vec<Uuid>,
    /// Findings at or above this severity are violations.
    pub severity_floor: Severity,
    /// Re-alert suppression window.
    #[serde(with = "duration_seconds")]
    pub window: Duration,
}

impl JurisdictionRule {
    pub fn new(jurisdiction: Jurisdiction, severity_floor: Severity, window: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            jurisdiction,
            required_category_coverage: Vec::new(),
            forbidden_patterns: Vec::new(),
            severity_floor,
            window,
        }
    }

    pub fn with_required_coverage<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_category_coverage = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_forbidden_patterns(mut self, patterns: Vec<Uuid>) -> Self {
        self.forbidden_patterns = patterns;
        self
    }
}

/// Sliding windows tracked by the trend counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendWindow {
    Day,
    Week,
    Month,
}

impl TrendWindow {
    pub const ALL: [TrendWindow; 3] = [TrendWindow::Day, TrendWindow::Week, TrendWindow::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrendWindow::Day => "1d",
            TrendWindow::Week => "7d",
            TrendWindow::Month => "30d",
        }
    }

    pub fn length(&self) -> Duration {
        match self {
            TrendWindow::Day => Duration::days(1),
            TrendWindow::Week => Duration::days(7),
            TrendWindow::Month => Duration::days(30),
        }
    }

    /// Start of the window bucket containing `at`.
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.length().num_seconds();
        let ts = at.timestamp();
        let aligned = ts - ts.rem_euclid(secs);
        DateTime::from_timestamp(aligned, 0).unwrap_or(at)
    }
}

mod duration_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(d)?;
        Ok(Duration::seconds(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_start_is_stable_within_a_window() {
        let t1 = DateTime::parse_from_rfc3339("2025-06-03T04:10:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let t2 = DateTime::parse_from_rfc3339("2025-06-03T21:55:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(TrendWindow::Day.bucket_start(t1), TrendWindow::Day.bucket_start(t2));
        assert!(TrendWindow::Day.bucket_start(t1) <= t1);
    }
}
