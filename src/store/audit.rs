//! Audit trail persistence.
//!
//! Append-only. The single mutation path is the GDPR anonymization used by
//! [`super::PurgeService`], which clears actor and state fields but keeps
//! the row.

use chrono::{DateTime, Utc};
use rusqlite::{named_params, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::AuditRecord;

use super::{parse_opt_uuid, parse_ts, parse_uuid, ts, MetadataStore};

const AUDIT_COLS: &str = "id, actor, action, resource_type, resource_id, before_state, \
     after_state, correlation_id, anonymized, at";

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<RawAudit> {
    Ok(RawAudit {
        id: row.get(0)?,
        actor: row.get(1)?,
        action: row.get(2)?,
        resource_type: row.get(3)?,
        resource_id: row.get(4)?,
        before_state: row.get(5)?,
        after_state: row.get(6)?,
        correlation_id: row.get(7)?,
        anonymized: row.get(8)?,
        at: row.get(9)?,
    })
}

struct RawAudit {
    id: String,
    actor: Option<String>,
    action: String,
    resource_type: String,
    resource_id: String,
    before_state: Option<String>,
    after_state: Option<String>,
    correlation_id: Option<String>,
    anonymized: bool,
    at: String,
}

impl RawAudit {
    fn into_record(self) -> Result<AuditRecord> {
        Ok(AuditRecord {
            id: parse_uuid(&self.id)?,
            actor: parse_opt_uuid(self.actor)?,
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            before: self.before_state.map(|s| serde_json::from_str(&s)).transpose()?,
            after: self.after_state.map(|s| serde_json::from_str(&s)).transpose()?,
            correlation_id: parse_opt_uuid(self.correlation_id)?,
            anonymized: self.anonymized,
            at: parse_ts(&self.at)?,
        })
    }
}

impl MetadataStore {
    pub fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO audit_records (id, actor, action, resource_type, resource_id, \
             before_state, after_state, correlation_id, anonymized, at) \
             VALUES (:id, :actor, :action, :rtype, :rid, :before, :after, :corr, :anon, :at)",
            named_params! {
                ":id": record.id.to_string(),
                ":actor": record.actor.map(|a| a.to_string()),
                ":action": record.action,
                ":rtype": record.resource_type,
                ":rid": record.resource_id,
                ":before": record.before.as_ref().map(|v| v.to_string()),
                ":after": record.after.as_ref().map(|v| v.to_string()),
                ":corr": record.correlation_id.map(|c| c.to_string()),
                ":anon": record.anonymized,
                ":at": ts(record.at),
            },
        )?;
        Ok(())
    }

    pub fn audit_for_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<AuditRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLS} FROM audit_records \
             WHERE resource_type = :rtype AND resource_id = :rid ORDER BY at"
        ))?;
        let rows = stmt.query_map(
            named_params! { ":rtype": resource_type, ":rid": resource_id },
            audit_from_row,
        )?;
        rows.map(|r| r.map_err(Error::from).and_then(RawAudit::into_record))
            .collect()
    }

    /// Retention purge of rows older than the cutoff.
    pub fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let removed = self.conn().execute(
            "DELETE FROM audit_records WHERE at < :cutoff",
            named_params! { ":cutoff": ts(cutoff) },
        )?;
        Ok(removed as u64)
    }

    /// GDPR anonymization: clear the PII fields of every record written by
    /// this actor, keep the rows.
    pub fn anonymize_audit_for_actor(&self, actor: Uuid) -> Result<u64> {
        let changed = self.conn().execute(
            "UPDATE audit_records SET actor = NULL, before_state = NULL, after_state = NULL, \
             anonymized = 1 WHERE actor = :actor",
            named_params! { ":actor": actor.to_string() },
        )?;
        Ok(changed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_append_and_query_in_time_order() {
        let store = MetadataStore::open_in_memory().unwrap();
        let doc_id = Uuid::new_v4().to_string();

        let mut first = AuditRecord::new("intake.created", "document", &doc_id);
        first.at = Utc::now() - chrono::Duration::seconds(10);
        store.append_audit(&first).unwrap();
        store
            .append_audit(
                &AuditRecord::new("intake.no_change", "document", &doc_id)
                    .with_after(json!({"last_monitored_at": "updated"})),
            )
            .unwrap();

        let records = store.audit_for_resource("document", &doc_id).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, "intake.created");
        assert_eq!(records[1].action, "intake.no_change");
    }

    #[test]
    fn anonymization_clears_pii_but_keeps_rows() {
        let store = MetadataStore::open_in_memory().unwrap();
        let actor = Uuid::new_v4();
        let doc_id = Uuid::new_v4().to_string();

        store
            .append_audit(
                &AuditRecord::new("document.deleted", "document", &doc_id)
                    .with_actor(actor)
                    .with_before(json!({"title": "Secret"})),
            )
            .unwrap();

        assert_eq!(store.anonymize_audit_for_actor(actor).unwrap(), 1);
        let records = store.audit_for_resource("document", &doc_id).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].anonymized);
        assert!(records[0].actor.is_none());
        assert!(records[0].before.is_none());
        // The action itself survives for the audit trail.
        assert_eq!(records[0].action, "document.deleted");
    }

    #[test]
    fn retention_purge_removes_only_old_rows() {
        let store = MetadataStore::open_in_memory().unwrap();
        let doc_id = Uuid::new_v4().to_string();

        let mut old = AuditRecord::new("analysis.completed", "analysis", &doc_id);
        old.at = Utc::now() - chrono::Duration::days(400);
        store.append_audit(&old).unwrap();
        store
            .append_audit(&AuditRecord::new("analysis.completed", "analysis", &doc_id))
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(365);
        assert_eq!(store.purge_audit_before(cutoff).unwrap(), 1);
        assert_eq!(store.audit_for_resource("analysis", &doc_id).unwrap().len(), 1);
    }
}
