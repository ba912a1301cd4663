//! Documents and their immutable version history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fingerprint::ContentHash;

/// Kind of legal document being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Tos,
    PrivacyPolicy,
    Eula,
    CookiePolicy,
    Dpa,
    ServiceAgreement,
    Other,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Tos => "tos",
            DocumentType::PrivacyPolicy => "privacy_policy",
            DocumentType::Eula => "eula",
            DocumentType::CookiePolicy => "cookie_policy",
            DocumentType::Dpa => "dpa",
            DocumentType::ServiceAgreement => "service_agreement",
            DocumentType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "tos" => DocumentType::Tos,
            "privacy_policy" => DocumentType::PrivacyPolicy,
            "eula" => DocumentType::Eula,
            "cookie_policy" => DocumentType::CookiePolicy,
            "dpa" => DocumentType::Dpa,
            "service_agreement" => DocumentType::ServiceAgreement,
            _ => DocumentType::Other,
        }
    }
}

/// A tracked document owned by a user or team.
///
/// `content_fingerprint` always reflects the latest captured version. The
/// store keeps `(owner_id, content_fingerprint)` unique across live rows, so
/// re-uploading identical content resolves to the existing document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub team_id: Option<Uuid>,
    pub title: String,
    pub source_url: Option<String>,
    pub document_type: DocumentType,
    pub content_fingerprint: ContentHash,
    pub content_length: u64,
    /// BCP-47 language tag.
    pub language: String,
    pub monitoring_enabled: bool,
    pub monitor_interval_seconds: Option<u64>,
    pub last_monitored_at: Option<DateTime<Utc>>,
    pub next_monitor_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency counter, bumped on every row update.
    pub row_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Document {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Why a new version was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// First capture of this document.
    Initial,
    /// Content changed but overall structure held.
    Modified,
    /// Majority of paragraphs or the section layout changed.
    StructureChanged,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Initial => "initial",
            ChangeKind::Modified => "modified",
            ChangeKind::StructureChanged => "structure_changed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(ChangeKind::Initial),
            "modified" => Some(ChangeKind::Modified),
            "structure_changed" => Some(ChangeKind::StructureChanged),
            _ => None,
        }
    }
}

/// Compact per-paragraph record kept instead of the paragraph text.
///
/// Raw document text is only held transiently during analysis; the stored
/// trail is a sequence of truncated paragraph hashes plus lengths, enough to
/// diff a fresh capture against the previous one without retaining content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParagraphDigest {
    /// First 8 bytes of the paragraph's SHA-256, hex-encoded.
    pub hash: String,
    /// Paragraph length in characters.
    pub chars: u64,
}

/// Immutable snapshot record of one captured version of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: Uuid,
    pub document_id: Uuid,
    /// Monotonic, contiguous, starts at 1.
    pub version_seq: i64,
    pub fingerprint: ContentHash,
    pub content_length: u64,
    pub captured_at: DateTime<Utc>,
    pub change_kind: ChangeKind,
    pub change_summary: String,
    pub significant_changes: Vec<String>,
    pub risk_delta: i32,
    /// Paragraph hash trail used by the change detector.
    pub paragraph_digest: Vec<ParagraphDigest>,
    /// Section count heuristic at capture time.
    pub section_count: u32,
}
