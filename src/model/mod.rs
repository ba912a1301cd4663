//! Domain entities.
//!
//! Identifiers are opaque UUIDs, timestamps are UTC, and every enum that is
//! persisted has a stable snake_case string form used both by serde and by
//! the SQL layer. Entities are plain data; invariants that span rows
//! (version contiguity, single non-terminal analysis, unique live
//! fingerprint per owner) are enforced at the store's write boundary.

pub mod analysis;
pub mod audit;
pub mod compliance;
pub mod document;
pub mod job;
pub mod pattern;

pub use analysis::{Analysis, AnalysisStatus, AnalysisSummary, Finding, Severity};
pub use audit::AuditRecord;
pub use compliance::{AlertStatus, ComplianceAlert, JurisdictionRule, TrendWindow};
pub use document::{ChangeKind, Document, DocumentType, DocumentVersion, ParagraphDigest};
pub use job::{JobState, MonitorJob};
pub use pattern::{builtin_rules, Jurisdiction, PatternRule};
