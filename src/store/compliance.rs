//! Compliance alerts and idempotence markers.

use chrono::{DateTime, Utc};
use rusqlite::{named_params, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{AlertStatus, ComplianceAlert, Jurisdiction, Severity};

use super::{parse_opt_uuid, parse_ts, parse_uuid, ts, MetadataStore};

const ALERT_COLS: &str =
    "id, document_id, pattern_id, jurisdiction, severity, detected_at, status, evidence";

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<RawAlert> {
    Ok(RawAlert {
        id: row.get(0)?,
        document_id: row.get(1)?,
        pattern_id: row.get(2)?,
        jurisdiction: row.get(3)?,
        severity: row.get(4)?,
        detected_at: row.get(5)?,
        status: row.get(6)?,
        evidence: row.get(7)?,
    })
}

struct RawAlert {
    id: String,
    document_id: String,
    pattern_id: Option<String>,
    jurisdiction: String,
    severity: String,
    detected_at: String,
    status: String,
    evidence: String,
}

impl RawAlert {
    fn into_alert(self) -> Result<ComplianceAlert> {
        Ok(ComplianceAlert {
            id: parse_uuid(&self.id)?,
            document_id: parse_uuid(&self.document_id)?,
            pattern_id: parse_opt_uuid(self.pattern_id)?,
            jurisdiction: Jurisdiction::parse(&self.jurisdiction).ok_or_else(|| {
                Error::Storage(format!("bad jurisdiction {:?}", self.jurisdiction))
            })?,
            severity: Severity::parse(&self.severity)
                .ok_or_else(|| Error::Storage(format!("bad severity {:?}", self.severity)))?,
            detected_at: parse_ts(&self.detected_at)?,
            status: AlertStatus::parse(&self.status)
                .ok_or_else(|| Error::Storage(format!("bad alert status {:?}", self.status)))?,
            evidence: serde_json::from_str(&self.evidence)?,
        })
    }
}

impl MetadataStore {
    pub fn open_alert(
        &self,
        document_id: Uuid,
        pattern_id: Option<Uuid>,
        jurisdiction: Jurisdiction,
        severity: Severity,
        evidence: serde_json::Value,
    ) -> Result<ComplianceAlert> {
        let alert = ComplianceAlert {
            id: Uuid::new_v4(),
            document_id,
            pattern_id,
            jurisdiction,
            severity,
            detected_at: Utc::now(),
            status: AlertStatus::Open,
            evidence,
        };
        self.conn().execute(
            "INSERT INTO compliance_alerts (id, document_id, pattern_id, jurisdiction, severity, \
             detected_at, status, evidence) \
             VALUES (:id, :doc, :pattern, :jurisdiction, :severity, :at, 'open', :evidence)",
            named_params! {
                ":id": alert.id.to_string(),
                ":doc": alert.document_id.to_string(),
                ":pattern": alert.pattern_id.map(|p| p.to_string()),
                ":jurisdiction": alert.jurisdiction.as_str(),
                ":severity": alert.severity.as_str(),
                ":at": ts(alert.detected_at),
                ":evidence": alert.evidence.to_string(),
            },
        )?;
        Ok(alert)
    }

    /// Is there an open alert for this (document, pattern, severity) within
    /// the suppression window?
    pub fn has_open_alert_since(
        &self,
        document_id: Uuid,
        pattern_id: Option<Uuid>,
        severity: Severity,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM compliance_alerts \
             WHERE document_id = :doc AND status = 'open' AND severity = :severity \
               AND detected_at >= :since \
               AND ((:pattern IS NULL AND pattern_id IS NULL) OR pattern_id = :pattern)",
            named_params! {
                ":doc": document_id.to_string(),
                ":severity": severity.as_str(),
                ":since": ts(since),
                ":pattern": pattern_id.map(|p| p.to_string()),
            },
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn alerts_for_document(&self, document_id: Uuid) -> Result<Vec<ComplianceAlert>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALERT_COLS} FROM compliance_alerts WHERE document_id = :doc \
             ORDER BY detected_at"
        ))?;
        let rows =
            stmt.query_map(named_params! { ":doc": document_id.to_string() }, alert_from_row)?;
        rows.map(|r| r.map_err(Error::from).and_then(RawAlert::into_alert))
            .collect()
    }

    pub fn set_alert_status(&self, alert_id: Uuid, status: AlertStatus) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE compliance_alerts SET status = :status WHERE id = :id",
            named_params! { ":status": status.as_str(), ":id": alert_id.to_string() },
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("alert {alert_id}")));
        }
        Ok(())
    }

    /// Once-only marker per `(analysis, rule)`. Returns `true` on first
    /// claim; reprocessing the same pair returns `false` so counters and
    /// alerts are never double-applied.
    pub fn try_mark_compliance_processed(&self, analysis_id: Uuid, rule_id: Uuid) -> Result<bool> {
        let changed = self.conn().execute(
            "INSERT OR IGNORE INTO compliance_markers (analysis_id, rule_id, recorded_at) \
             VALUES (:analysis, :rule, :at)",
            named_params! {
                ":analysis": analysis_id.to_string(),
                ":rule": rule_id.to_string(),
                ":at": ts(Utc::now()),
            },
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;
    use crate::model::DocumentType;
    use crate::store::documents::NewDocument;
    use serde_json::json;

    fn store_with_doc() -> (MetadataStore, Uuid) {
        let store = MetadataStore::open_in_memory().unwrap();
        let (doc, _) = store
            .upsert_document(NewDocument {
                owner_id: Uuid::new_v4(),
                team_id: None,
                title: "TOS".into(),
                source_url: None,
                document_type: DocumentType::Tos,
                fingerprint: fingerprint::fingerprint("x"),
                content_length: 1,
                language: "en".into(),
            })
            .unwrap();
        (store, doc.id)
    }

    #[test]
    fn open_alert_round_trips_and_window_check_sees_it() {
        let (store, doc) = store_with_doc();
        let pattern = Uuid::new_v4();
        let alert = store
            .open_alert(
                doc,
                Some(pattern),
                Jurisdiction::Gdpr,
                Severity::High,
                json!({"finding_count": 2}),
            )
            .unwrap();

        let since = Utc::now() - chrono::Duration::days(7);
        assert!(store
            .has_open_alert_since(doc, Some(pattern), Severity::High, since)
            .unwrap());
        assert!(!store
            .has_open_alert_since(doc, Some(pattern), Severity::Critical, since)
            .unwrap());
        assert!(!store
            .has_open_alert_since(doc, None, Severity::High, since)
            .unwrap());

        store.set_alert_status(alert.id, AlertStatus::Resolved).unwrap();
        assert!(!store
            .has_open_alert_since(doc, Some(pattern), Severity::High, since)
            .unwrap());
    }

    #[test]
    fn markers_claim_exactly_once() {
        let (store, _) = store_with_doc();
        let analysis = Uuid::new_v4();
        let rule = Uuid::new_v4();

        assert!(store.try_mark_compliance_processed(analysis, rule).unwrap());
        assert!(!store.try_mark_compliance_processed(analysis, rule).unwrap());
        assert!(store
            .try_mark_compliance_processed(analysis, Uuid::new_v4())
            .unwrap());
    }
}
