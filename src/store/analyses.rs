//! Analysis lifecycle and findings.

use chrono::{DateTime, Utc};
use rusqlite::{named_params, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fingerprint::MAX_EXCERPT_CHARS;
use crate::model::{Analysis, AnalysisStatus, Finding, Severity};

use super::{
    from_json, is_unique_violation, opt_ts, parse_opt_ts, parse_ts, parse_opt_uuid, parse_uuid,
    to_json, ts, MetadataStore,
};

const ANALYSIS_COLS: &str = "id, document_id, document_version_id, owner_id, status, \
     overall_risk_score, model_id, model_version, processing_ms, executive_summary, \
     key_findings, recommendations, error_kind, started_at, completed_at, expires_at, created_at";

fn analysis_from_row(row: &Row<'_>) -> rusqlite::Result<RawAnalysis> {
    Ok(RawAnalysis {
        id: row.get(0)?,
        document_id: row.get(1)?,
        document_version_id: row.get(2)?,
        owner_id: row.get(3)?,
        status: row.get(4)?,
        overall_risk_score: row.get(5)?,
        model_id: row.get(6)?,
        model_version: row.get(7)?,
        processing_ms: row.get(8)?,
        executive_summary: row.get(9)?,
        key_findings: row.get(10)?,
        recommendations: row.get(11)?,
        error_kind: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
        expires_at: row.get(15)?,
        created_at: row.get(16)?,
    })
}

struct RawAnalysis {
    id: String,
    document_id: String,
    document_version_id: String,
    owner_id: String,
    status: String,
    overall_risk_score: Option<i64>,
    model_id: Option<String>,
    model_version: Option<String>,
    processing_ms: Option<i64>,
    executive_summary: Option<String>,
    key_findings: String,
    recommendations: String,
    error_kind: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    expires_at: Option<String>,
    created_at: String,
}

impl RawAnalysis {
    fn into_analysis(self) -> Result<Analysis> {
        Ok(Analysis {
            id: parse_uuid(&self.id)?,
            document_id: parse_uuid(&self.document_id)?,
            document_version_id: parse_uuid(&self.document_version_id)?,
            owner_id: parse_uuid(&self.owner_id)?,
            status: AnalysisStatus::parse(&self.status)
                .ok_or_else(|| Error::Storage(format!("bad analysis status {:?}", self.status)))?,
            overall_risk_score: self.overall_risk_score.map(|v| v as u32),
            model_id: self.model_id,
            model_version: self.model_version,
            processing_ms: self.processing_ms.map(|v| v as u64),
            executive_summary: self.executive_summary,
            key_findings: from_json(&self.key_findings)?,
            recommendations: from_json(&self.recommendations)?,
            error_kind: self.error_kind,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            expires_at: parse_opt_ts(self.expires_at)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

const FINDING_COLS: &str = "id, analysis_id, category, title, description, severity, \
     confidence, pattern_id, excerpt, position_start, position_end, recommendation, impact";

fn finding_from_row(row: &Row<'_>) -> rusqlite::Result<RawFinding> {
    Ok(RawFinding {
        id: row.get(0)?,
        analysis_id: row.get(1)?,
        category: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        severity: row.get(5)?,
        confidence: row.get(6)?,
        pattern_id: row.get(7)?,
        excerpt: row.get(8)?,
        position_start: row.get(9)?,
        position_end: row.get(10)?,
        recommendation: row.get(11)?,
        impact: row.get(12)?,
    })
}

struct RawFinding {
    id: String,
    analysis_id: String,
    category: String,
    title: String,
    description: String,
    severity: String,
    confidence: f64,
    pattern_id: Option<String>,
    excerpt: String,
    position_start: i64,
    position_end: i64,
    recommendation: Option<String>,
    impact: Option<String>,
}

impl RawFinding {
    fn into_finding(self) -> Result<Finding> {
        Ok(Finding {
            id: parse_uuid(&self.id)?,
            analysis_id: parse_uuid(&self.analysis_id)?,
            category: self.category,
            title: self.title,
            description: self.description,
            severity: Severity::parse(&self.severity)
                .ok_or_else(|| Error::Storage(format!("bad severity {:?}", self.severity)))?,
            confidence: self.confidence,
            pattern_id: parse_opt_uuid(self.pattern_id)?,
            excerpt: self.excerpt,
            position_start: self.position_start as u64,
            position_end: self.position_end as u64,
            recommendation: self.recommendation,
            impact: self.impact,
        })
    }
}

/// Fields applied with a status transition.
#[derive(Debug, Clone, Default)]
pub struct AnalysisPatch {
    pub overall_risk_score: Option<u32>,
    pub model_id: Option<String>,
    pub model_version: Option<String>,
    pub processing_ms: Option<u64>,
    pub executive_summary: Option<String>,
    pub key_findings: Option<Vec<String>>,
    pub recommendations: Option<Vec<String>>,
    pub error_kind: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A finding ready for insertion.
#[derive(Debug, Clone)]
pub struct NewFinding {
    pub category: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub confidence: f64,
    pub pattern_id: Option<Uuid>,
    pub excerpt: String,
    pub position_start: u64,
    pub position_end: u64,
    pub recommendation: Option<String>,
    pub impact: Option<String>,
}

impl MetadataStore {
    /// Create a pending analysis for a version.
    ///
    /// The partial unique index on non-terminal statuses turns a concurrent
    /// duplicate into `AnalysisInProgress`.
    pub fn create_analysis(
        &self,
        document_id: Uuid,
        document_version_id: Uuid,
        owner_id: Uuid,
    ) -> Result<Analysis> {
        let conn = self.conn();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let inserted = conn.execute(
            "INSERT INTO analyses (id, document_id, document_version_id, owner_id, status, created_at) \
             VALUES (:id, :doc, :version, :owner, 'pending', :now)",
            named_params! {
                ":id": id.to_string(),
                ":doc": document_id.to_string(),
                ":version": document_version_id.to_string(),
                ":owner": owner_id.to_string(),
                ":now": ts(now),
            },
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(Error::AnalysisInProgress {
                    version_id: document_version_id,
                })
            }
            Err(e) => return Err(e.into()),
        }
        Self::get_analysis_with(&conn, id)
    }

    fn get_analysis_with(conn: &rusqlite::Connection, id: Uuid) -> Result<Analysis> {
        let mut stmt =
            conn.prepare(&format!("SELECT {ANALYSIS_COLS} FROM analyses WHERE id = :id"))?;
        let raw = stmt
            .query_row(named_params! { ":id": id.to_string() }, analysis_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("analysis {id}")),
                other => other.into(),
            })?;
        raw.into_analysis()
    }

    pub fn get_analysis(&self, id: Uuid) -> Result<Analysis> {
        Self::get_analysis_with(&self.conn(), id)
    }

    /// Conditional state transition. The `WHERE status = :from` clause makes
    /// transitions linearizable at the database; a lost race surfaces as
    /// `Conflict`.
    pub fn transition_analysis(
        &self,
        id: Uuid,
        from: AnalysisStatus,
        to: AnalysisStatus,
        patch: AnalysisPatch,
    ) -> Result<Analysis> {
        if !from.can_transition_to(to) {
            return Err(Error::Internal(format!(
                "illegal analysis transition {} -> {}",
                from.as_str(),
                to.as_str()
            )));
        }

        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE analyses SET status = :to, \
             overall_risk_score = COALESCE(:score, overall_risk_score), \
             model_id = COALESCE(:model_id, model_id), \
             model_version = COALESCE(:model_version, model_version), \
             processing_ms = COALESCE(:processing_ms, processing_ms), \
             executive_summary = COALESCE(:summary, executive_summary), \
             key_findings = COALESCE(:key_findings, key_findings), \
             recommendations = COALESCE(:recommendations, recommendations), \
             error_kind = COALESCE(:error_kind, error_kind), \
             started_at = COALESCE(:started_at, started_at), \
             completed_at = COALESCE(:completed_at, completed_at), \
             expires_at = COALESCE(:expires_at, expires_at) \
             WHERE id = :id AND status = :from",
            named_params! {
                ":to": to.as_str(),
                ":score": patch.overall_risk_score.map(|v| v as i64),
                ":model_id": patch.model_id,
                ":model_version": patch.model_version,
                ":processing_ms": patch.processing_ms.map(|v| v as i64),
                ":summary": patch.executive_summary,
                ":key_findings": patch.key_findings.as_ref().map(to_json).transpose()?,
                ":recommendations": patch.recommendations.as_ref().map(to_json).transpose()?,
                ":error_kind": patch.error_kind,
                ":started_at": opt_ts(patch.started_at),
                ":completed_at": opt_ts(patch.completed_at),
                ":expires_at": opt_ts(patch.expires_at),
                ":id": id.to_string(),
                ":from": from.as_str(),
            },
        )?;
        if changed == 0 {
            return Err(Error::Conflict(format!(
                "analysis {id} is not in state {}",
                from.as_str()
            )));
        }
        Self::get_analysis_with(&conn, id)
    }

    /// Atomic insert of an analysis's findings, replacing anything a prior
    /// failed attempt left behind so retries never duplicate rows.
    ///
    /// Validates positions against the referenced version's content length
    /// and the excerpt bound before any row is written.
    pub fn insert_findings(&self, analysis_id: Uuid, findings: &[NewFinding]) -> Result<Vec<Finding>> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(Error::from)?;
        tx.execute(
            "DELETE FROM findings WHERE analysis_id = :id",
            named_params! { ":id": analysis_id.to_string() },
        )?;

        let content_length: i64 = tx.query_row(
            "SELECT v.content_length FROM analyses a \
             JOIN document_versions v ON v.id = a.document_version_id \
             WHERE a.id = :id",
            named_params! { ":id": analysis_id.to_string() },
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                Error::NotFound(format!("analysis {analysis_id}"))
            }
            other => other.into(),
        })?;

        let mut inserted = Vec::with_capacity(findings.len());
        for finding in findings {
            if finding.position_start >= finding.position_end
                || finding.position_end > content_length as u64
            {
                return Err(Error::BadRange {
                    start: finding.position_start as usize,
                    end: finding.position_end as usize,
                    len: content_length as usize,
                });
            }
            if finding.excerpt.chars().count() > MAX_EXCERPT_CHARS {
                return Err(Error::Internal(format!(
                    "finding excerpt exceeds {MAX_EXCERPT_CHARS} chars"
                )));
            }

            let id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO findings (id, analysis_id, category, title, description, severity, \
                 confidence, pattern_id, excerpt, position_start, position_end, recommendation, impact) \
                 VALUES (:id, :analysis, :category, :title, :description, :severity, :confidence, \
                 :pattern, :excerpt, :start, :end, :recommendation, :impact)",
                named_params! {
                    ":id": id.to_string(),
                    ":analysis": analysis_id.to_string(),
                    ":category": finding.category,
                    ":title": finding.title,
                    ":description": finding.description,
                    ":severity": finding.severity.as_str(),
                    ":confidence": finding.confidence.clamp(0.0, 1.0),
                    ":pattern": finding.pattern_id.map(|p| p.to_string()),
                    ":excerpt": finding.excerpt,
                    ":start": finding.position_start as i64,
                    ":end": finding.position_end as i64,
                    ":recommendation": finding.recommendation,
                    ":impact": finding.impact,
                },
            )?;
            inserted.push(id);
        }
        tx.commit()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {FINDING_COLS} FROM findings WHERE analysis_id = :id ORDER BY position_start"
        ))?;
        let rows =
            stmt.query_map(named_params! { ":id": analysis_id.to_string() }, finding_from_row)?;
        rows.map(|r| r.map_err(Error::from).and_then(RawFinding::into_finding))
            .collect()
    }

    pub fn findings_for(&self, analysis_id: Uuid) -> Result<Vec<Finding>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FINDING_COLS} FROM findings WHERE analysis_id = :id ORDER BY position_start"
        ))?;
        let rows =
            stmt.query_map(named_params! { ":id": analysis_id.to_string() }, finding_from_row)?;
        rows.map(|r| r.map_err(Error::from).and_then(RawFinding::into_finding))
            .collect()
    }

    /// Latest completed analysis for a document, if any.
    pub fn latest_completed_analysis(&self, document_id: Uuid) -> Result<Option<Analysis>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ANALYSIS_COLS} FROM analyses \
             WHERE document_id = :doc AND status = 'completed' \
             ORDER BY completed_at DESC LIMIT 1"
        ))?;
        let raw = stmt
            .query_row(named_params! { ":doc": document_id.to_string() }, analysis_from_row)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Error::from(other)),
            })?;
        raw.map(RawAnalysis::into_analysis).transpose()
    }

    /// Risk score of the most recent completed analysis for any version
    /// strictly older than `before_seq`.
    pub fn previous_risk_score(&self, document_id: Uuid, before_seq: i64) -> Result<Option<u32>> {
        let conn = self.conn();
        let score: Option<i64> = conn
            .query_row(
                "SELECT a.overall_risk_score FROM analyses a \
                 JOIN document_versions v ON v.id = a.document_version_id \
                 WHERE a.document_id = :doc AND v.version_seq < :seq \
                   AND a.status IN ('completed', 'expired') AND a.overall_risk_score IS NOT NULL \
                 ORDER BY v.version_seq DESC LIMIT 1",
                named_params! { ":doc": document_id.to_string(), ":seq": before_seq },
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Error::from(other)),
            })?;
        Ok(score.map(|v| v as u32))
    }

    /// Move past-retention completed analyses to `expired`. Returns how many
    /// rows changed.
    pub fn sweep_expired_analyses(&self, now: DateTime<Utc>) -> Result<u64> {
        let changed = self.conn().execute(
            "UPDATE analyses SET status = 'expired' \
             WHERE status = 'completed' AND expires_at IS NOT NULL AND expires_at <= :now",
            named_params! { ":now": ts(now) },
        )?;
        Ok(changed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;
    use crate::model::{ChangeKind, DocumentType};
    use crate::store::documents::{NewDocument, NewVersion};

    fn setup() -> (MetadataStore, Uuid, Uuid, Uuid) {
        let store = MetadataStore::open_in_memory().unwrap();
        let owner = Uuid::new_v4();
        let fp = fingerprint::fingerprint("analysis target text");
        let (doc, _) = store
            .upsert_document(NewDocument {
                owner_id: owner,
                team_id: None,
                title: "TOS".into(),
                source_url: None,
                document_type: DocumentType::Tos,
                fingerprint: fp,
                content_length: 100,
                language: "en".into(),
            })
            .unwrap();
        let version = store
            .append_version(
                doc.id,
                NewVersion {
                    fingerprint: fp,
                    content_length: 100,
                    change_kind: ChangeKind::Initial,
                    change_summary: "initial".into(),
                    significant_changes: vec![],
                    risk_delta: 0,
                    paragraph_digest: vec![],
                    section_count: 0,
                },
            )
            .unwrap();
        (store, owner, doc.id, version.id)
    }

    fn finding(start: u64, end: u64) -> NewFinding {
        NewFinding {
            category: "data_collection".into(),
            title: "Broad collection".into(),
            description: "collects everything".into(),
            severity: Severity::High,
            confidence: 0.9,
            pattern_id: None,
            excerpt: "collect any information".into(),
            position_start: start,
            position_end: end,
            recommendation: None,
            impact: None,
        }
    }

    #[test]
    fn one_non_terminal_analysis_per_version() {
        let (store, owner, doc, version) = setup();
        let first = store.create_analysis(doc, version, owner).unwrap();
        assert_eq!(first.status, AnalysisStatus::Pending);

        let err = store.create_analysis(doc, version, owner).unwrap_err();
        assert!(matches!(err, Error::AnalysisInProgress { version_id } if version_id == version));

        // Terminal state frees the slot.
        store
            .transition_analysis(
                first.id,
                AnalysisStatus::Pending,
                AnalysisStatus::Processing,
                AnalysisPatch {
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .transition_analysis(
                first.id,
                AnalysisStatus::Processing,
                AnalysisStatus::Failed,
                AnalysisPatch {
                    error_kind: Some("llm_refused".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        store.create_analysis(doc, version, owner).unwrap();
    }

    #[test]
    fn conditional_transition_loses_races_cleanly() {
        let (store, owner, doc, version) = setup();
        let analysis = store.create_analysis(doc, version, owner).unwrap();

        store
            .transition_analysis(
                analysis.id,
                AnalysisStatus::Pending,
                AnalysisStatus::Processing,
                AnalysisPatch::default(),
            )
            .unwrap();

        // A second worker trying the same lease loses.
        let err = store
            .transition_analysis(
                analysis.id,
                AnalysisStatus::Pending,
                AnalysisStatus::Processing,
                AnalysisPatch::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Illegal edges are rejected before touching the row.
        let err = store
            .transition_analysis(
                analysis.id,
                AnalysisStatus::Pending,
                AnalysisStatus::Completed,
                AnalysisPatch::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn findings_validate_positions_against_the_version() {
        let (store, owner, doc, version) = setup();
        let analysis = store.create_analysis(doc, version, owner).unwrap();

        // position_end beyond content_length (100) fails and nothing lands.
        let err = store
            .insert_findings(analysis.id, &[finding(0, 20), finding(50, 120)])
            .unwrap_err();
        assert!(matches!(err, Error::BadRange { .. }));
        assert!(store.findings_for(analysis.id).unwrap().is_empty());

        let ok = store
            .insert_findings(analysis.id, &[finding(0, 20), finding(30, 100)])
            .unwrap();
        assert_eq!(ok.len(), 2);
    }

    #[test]
    fn completed_analyses_expire_at_the_boundary() {
        let (store, owner, doc, version) = setup();
        let analysis = store.create_analysis(doc, version, owner).unwrap();
        let now = Utc::now();

        store
            .transition_analysis(
                analysis.id,
                AnalysisStatus::Pending,
                AnalysisStatus::Processing,
                AnalysisPatch::default(),
            )
            .unwrap();
        store
            .transition_analysis(
                analysis.id,
                AnalysisStatus::Processing,
                AnalysisStatus::Completed,
                AnalysisPatch {
                    overall_risk_score: Some(55),
                    completed_at: Some(now),
                    expires_at: Some(now),
                    ..Default::default()
                },
            )
            .unwrap();

        // `now == expires_at` counts as expired.
        assert_eq!(store.sweep_expired_analyses(now).unwrap(), 1);
        let analysis = store.get_analysis(analysis.id).unwrap();
        assert_eq!(analysis.status, AnalysisStatus::Expired);
        // Score survives expiry for delta computations.
        assert_eq!(analysis.overall_risk_score, Some(55));
    }
}
