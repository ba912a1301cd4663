//! Analyses and the findings they produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity of a finding or alert. Ordering is semantic: `Low < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Weight used for the deterministic fallback risk score.
    pub fn risk_weight(&self) -> u32 {
        match self {
            Severity::Low => 5,
            Severity::Medium => 15,
            Severity::High => 30,
            Severity::Critical => 50,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
            AnalysisStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AnalysisStatus::Pending),
            "processing" => Some(AnalysisStatus::Processing),
            "completed" => Some(AnalysisStatus::Completed),
            "failed" => Some(AnalysisStatus::Failed),
            "expired" => Some(AnalysisStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisStatus::Completed | AnalysisStatus::Failed | AnalysisStatus::Expired
        )
    }

    /// Legal transitions of the analysis state machine.
    ///
    /// ```text
    /// pending --lease--> processing
    /// processing --ok--> completed
    /// processing --retryable err--> pending
    /// processing --fatal err--> failed
    /// completed --past retention--> expired
    /// ```
    pub fn can_transition_to(&self, to: AnalysisStatus) -> bool {
        matches!(
            (self, to),
            (AnalysisStatus::Pending, AnalysisStatus::Processing)
                | (AnalysisStatus::Processing, AnalysisStatus::Completed)
                | (AnalysisStatus::Processing, AnalysisStatus::Pending)
                | (AnalysisStatus::Processing, AnalysisStatus::Failed)
                | (AnalysisStatus::Completed, AnalysisStatus::Expired)
        )
    }
}

/// One pipeline run over a document version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: Uuid,
    pub document_id: Uuid,
    pub document_version_id: Uuid,
    pub owner_id: Uuid,
    pub status: AnalysisStatus,
    /// 0..=100, present once completed.
    pub overall_risk_score: Option<u32>,
    pub model_id: Option<String>,
    pub model_version: Option<String>,
    pub processing_ms: Option<u64>,
    pub executive_summary: Option<String>,
    pub key_findings: Vec<String>,
    pub recommendations: Vec<String>,
    /// Stable error label when `status == Failed`.
    pub error_kind: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Analysis {
    /// Expired at exactly `expires_at` and beyond.
    pub fn is_past_retention(&self, now: DateTime<Utc>) -> bool {
        self.status == AnalysisStatus::Completed
            && self.expires_at.map(|e| now >= e).unwrap_or(false)
    }
}

/// Summary fields produced by the model for a completed analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub executive_summary: String,
    pub key_findings: Vec<String>,
    pub recommendations: Vec<String>,
    pub overall_risk_score: Option<u32>,
}

/// A located clause matched by a pattern rule or semantic query.
///
/// Immutable once written. Positions are character offsets into the
/// normalized text of the referenced document version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub analysis_id: Uuid,
    pub category: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    /// In `[0.0, 1.0]`.
    pub confidence: f64,
    pub pattern_id: Option<Uuid>,
    /// At most 500 characters.
    pub excerpt: String,
    pub position_start: u64,
    pub position_end: u64,
    pub recommendation: Option<String>,
    pub impact: Option<String>,
}
