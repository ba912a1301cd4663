//! Document and version operations.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{named_params, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fingerprint::ContentHash;
use crate::model::{ChangeKind, Document, DocumentType, DocumentVersion, ParagraphDigest};

use super::{
    from_json, is_unique_violation, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid, to_json,
    ts, MetadataStore,
};

/// Input for [`MetadataStore::upsert_document`].
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub owner_id: Uuid,
    pub team_id: Option<Uuid>,
    pub title: String,
    pub source_url: Option<String>,
    pub document_type: DocumentType,
    pub fingerprint: ContentHash,
    pub content_length: u64,
    pub language: String,
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<RawDocument> {
    Ok(RawDocument {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        team_id: row.get(2)?,
        title: row.get(3)?,
        source_url: row.get(4)?,
        document_type: row.get(5)?,
        content_fingerprint: row.get(6)?,
        content_length: row.get(7)?,
        language: row.get(8)?,
        monitoring_enabled: row.get(9)?,
        monitor_interval_seconds: row.get(10)?,
        last_monitored_at: row.get(11)?,
        next_monitor_at: row.get(12)?,
        row_version: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
        deleted_at: row.get(16)?,
    })
}

struct RawDocument {
    id: String,
    owner_id: String,
    team_id: Option<String>,
    title: String,
    source_url: Option<String>,
    document_type: String,
    content_fingerprint: String,
    content_length: i64,
    language: String,
    monitoring_enabled: bool,
    monitor_interval_seconds: Option<i64>,
    last_monitored_at: Option<String>,
    next_monitor_at: Option<String>,
    row_version: i64,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl RawDocument {
    fn into_document(self) -> Result<Document> {
        Ok(Document {
            id: parse_uuid(&self.id)?,
            owner_id: parse_uuid(&self.owner_id)?,
            team_id: parse_opt_uuid(self.team_id)?,
            title: self.title,
            source_url: self.source_url,
            document_type: DocumentType::parse(&self.document_type),
            content_fingerprint: ContentHash::from_hex(&self.content_fingerprint)?,
            content_length: self.content_length as u64,
            language: self.language,
            monitoring_enabled: self.monitoring_enabled,
            monitor_interval_seconds: self.monitor_interval_seconds.map(|v| v as u64),
            last_monitored_at: parse_opt_ts(self.last_monitored_at)?,
            next_monitor_at: parse_opt_ts(self.next_monitor_at)?,
            row_version: self.row_version,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            deleted_at: parse_opt_ts(self.deleted_at)?,
        })
    }
}

const DOCUMENT_COLS: &str = "id, owner_id, team_id, title, source_url, document_type, \
     content_fingerprint, content_length, language, monitoring_enabled, \
     monitor_interval_seconds, last_monitored_at, next_monitor_at, row_version, \
     created_at, updated_at, deleted_at";

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<RawVersion> {
    Ok(RawVersion {
        id: row.get(0)?,
        document_id: row.get(1)?,
        version_seq: row.get(2)?,
        fingerprint: row.get(3)?,
        content_length: row.get(4)?,
        captured_at: row.get(5)?,
        change_kind: row.get(6)?,
        change_summary: row.get(7)?,
        significant_changes: row.get(8)?,
        risk_delta: row.get(9)?,
        paragraph_digest: row.get(10)?,
        section_count: row.get(11)?,
    })
}

struct RawVersion {
    id: String,
    document_id: String,
    version_seq: i64,
    fingerprint: String,
    content_length: i64,
    captured_at: String,
    change_kind: String,
    change_summary: String,
    significant_changes: String,
    risk_delta: i64,
    paragraph_digest: String,
    section_count: i64,
}

impl RawVersion {
    fn into_version(self) -> Result<DocumentVersion> {
        Ok(DocumentVersion {
            id: parse_uuid(&self.id)?,
            document_id: parse_uuid(&self.document_id)?,
            version_seq: self.version_seq,
            fingerprint: ContentHash::from_hex(&self.fingerprint)?,
            content_length: self.content_length as u64,
            captured_at: parse_ts(&self.captured_at)?,
            change_kind: ChangeKind::parse(&self.change_kind)
                .ok_or_else(|| Error::Storage(format!("bad change kind {:?}", self.change_kind)))?,
            change_summary: self.change_summary,
            significant_changes: from_json(&self.significant_changes)?,
            risk_delta: self.risk_delta as i32,
            paragraph_digest: from_json(&self.paragraph_digest)?,
            section_count: self.section_count as u32,
        })
    }
}

const VERSION_COLS: &str = "id, document_id, version_seq, fingerprint, content_length, \
     captured_at, change_kind, change_summary, significant_changes, risk_delta, \
     paragraph_digest, section_count";

/// Input for [`MetadataStore::append_version`].
#[derive(Debug, Clone)]
pub(crate) struct NewVersion {
    pub fingerprint: ContentHash,
    pub content_length: u64,
    pub change_kind: ChangeKind,
    pub change_summary: String,
    pub significant_changes: Vec<String>,
    pub risk_delta: i32,
    pub paragraph_digest: Vec<ParagraphDigest>,
    pub section_count: u32,
}

impl MetadataStore {
    /// Idempotent create: a live document with the same `(owner,
    /// fingerprint)` is returned as-is (`created == false`, title left
    /// untouched); otherwise a new row is inserted.
    pub fn upsert_document(&self, new: NewDocument) -> Result<(Document, bool)> {
        let conn = self.conn();
        if let Some(existing) = Self::find_live_by_fingerprint(&conn, new.owner_id, new.fingerprint)? {
            return Ok((existing, false));
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        let inserted = conn.execute(
            "INSERT INTO documents (id, owner_id, team_id, title, source_url, document_type, \
             content_fingerprint, content_length, language, created_at, updated_at) \
             VALUES (:id, :owner, :team, :title, :url, :dtype, :fp, :len, :lang, :now, :now)",
            named_params! {
                ":id": id.to_string(),
                ":owner": new.owner_id.to_string(),
                ":team": new.team_id.map(|t| t.to_string()),
                ":title": new.title,
                ":url": new.source_url,
                ":dtype": new.document_type.as_str(),
                ":fp": new.fingerprint.to_hex(),
                ":len": new.content_length as i64,
                ":lang": new.language,
                ":now": ts(now),
            },
        );

        match inserted {
            Ok(_) => {}
            // Lost a race with a concurrent upsert of the same content.
            Err(e) if is_unique_violation(&e) => {
                if let Some(existing) =
                    Self::find_live_by_fingerprint(&conn, new.owner_id, new.fingerprint)?
                {
                    return Ok((existing, false));
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }

        let doc = Self::get_document_with(&conn, id)?;
        Ok((doc, true))
    }

    fn find_live_by_fingerprint(
        conn: &rusqlite::Connection,
        owner: Uuid,
        fingerprint: ContentHash,
    ) -> Result<Option<Document>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLS} FROM documents \
             WHERE owner_id = :owner AND content_fingerprint = :fp AND deleted_at IS NULL"
        ))?;
        let raw = stmt
            .query_row(
                named_params! {
                    ":owner": owner.to_string(),
                    ":fp": fingerprint.to_hex(),
                },
                document_from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        raw.map(RawDocument::into_document).transpose()
    }

    fn get_document_with(conn: &rusqlite::Connection, id: Uuid) -> Result<Document> {
        let mut stmt =
            conn.prepare(&format!("SELECT {DOCUMENT_COLS} FROM documents WHERE id = :id"))?;
        let raw = stmt
            .query_row(named_params! { ":id": id.to_string() }, document_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    Error::NotFound(format!("document {id}"))
                }
                other => other.into(),
            })?;
        raw.into_document()
    }

    pub fn get_document(&self, id: Uuid) -> Result<Document> {
        Self::get_document_with(&self.conn(), id)
    }

    pub fn find_document_by_fingerprint(
        &self,
        owner: Uuid,
        fingerprint: ContentHash,
    ) -> Result<Option<Document>> {
        Self::find_live_by_fingerprint(&self.conn(), owner, fingerprint)
    }

    pub fn documents_for_owner(&self, owner: Uuid) -> Result<Vec<Document>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLS} FROM documents WHERE owner_id = :owner AND deleted_at IS NULL"
        ))?;
        let rows = stmt.query_map(named_params! { ":owner": owner.to_string() }, document_from_row)?;
        rows.map(|r| r.map_err(Error::from).and_then(RawDocument::into_document))
            .collect()
    }

    /// Append the next version and roll the document's fingerprint forward,
    /// all in one transaction.
    ///
    /// Fails with `FingerprintUnchanged` when the fingerprint equals the
    /// latest version's and the change is not the initial capture.
    pub(crate) fn append_version(
        &self,
        document_id: Uuid,
        new: NewVersion,
    ) -> Result<DocumentVersion> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(Error::from)?;

        let latest: Option<(i64, String)> = tx
            .query_row(
                "SELECT version_seq, fingerprint FROM document_versions \
                 WHERE document_id = :doc ORDER BY version_seq DESC LIMIT 1",
                named_params! { ":doc": document_id.to_string() },
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Error::from(other)),
            })?;

        if let Some((_, latest_fp)) = &latest {
            if *latest_fp == new.fingerprint.to_hex() && new.change_kind != ChangeKind::Initial {
                return Err(Error::FingerprintUnchanged);
            }
        }
        let next_seq = latest.map(|(seq, _)| seq + 1).unwrap_or(1);

        let id = Uuid::new_v4();
        let now = Utc::now();
        tx.execute(
            "INSERT INTO document_versions (id, document_id, version_seq, fingerprint, \
             content_length, captured_at, change_kind, change_summary, significant_changes, \
             risk_delta, paragraph_digest, section_count) \
             VALUES (:id, :doc, :seq, :fp, :len, :at, :kind, :summary, :sig, :delta, :digest, :sections)",
            named_params! {
                ":id": id.to_string(),
                ":doc": document_id.to_string(),
                ":seq": next_seq,
                ":fp": new.fingerprint.to_hex(),
                ":len": new.content_length as i64,
                ":at": ts(now),
                ":kind": new.change_kind.as_str(),
                ":summary": new.change_summary,
                ":sig": to_json(&new.significant_changes)?,
                ":delta": new.risk_delta as i64,
                ":digest": to_json(&new.paragraph_digest)?,
                ":sections": new.section_count as i64,
            },
        )?;

        // Roll the document row forward under optimistic concurrency: one
        // in-transaction retry on a stale read, then `Conflict`.
        let mut updated = false;
        for _ in 0..2 {
            let row_version: i64 = tx.query_row(
                "SELECT row_version FROM documents WHERE id = :id AND deleted_at IS NULL",
                named_params! { ":id": document_id.to_string() },
                |row| row.get(0),
            )?;
            let changed = tx.execute(
                "UPDATE documents SET content_fingerprint = :fp, content_length = :len, \
                 updated_at = :now, row_version = row_version + 1 \
                 WHERE id = :id AND row_version = :expected",
                named_params! {
                    ":fp": new.fingerprint.to_hex(),
                    ":len": new.content_length as i64,
                    ":now": ts(now),
                    ":id": document_id.to_string(),
                    ":expected": row_version,
                },
            )?;
            if changed == 1 {
                updated = true;
                break;
            }
        }
        if !updated {
            return Err(Error::Conflict(format!(
                "document {document_id} row version moved during append"
            )));
        }

        tx.commit()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {VERSION_COLS} FROM document_versions WHERE id = :id"
        ))?;
        let raw = stmt.query_row(named_params! { ":id": id.to_string() }, version_from_row)?;
        raw.into_version()
    }

    pub fn get_version(&self, id: Uuid) -> Result<DocumentVersion> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {VERSION_COLS} FROM document_versions WHERE id = :id"
        ))?;
        let raw = stmt
            .query_row(named_params! { ":id": id.to_string() }, version_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("version {id}")),
                other => other.into(),
            })?;
        raw.into_version()
    }

    pub fn latest_version(&self, document_id: Uuid) -> Result<Option<DocumentVersion>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {VERSION_COLS} FROM document_versions \
             WHERE document_id = :doc ORDER BY version_seq DESC LIMIT 1"
        ))?;
        let raw = stmt
            .query_row(named_params! { ":doc": document_id.to_string() }, version_from_row)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Error::from(other)),
            })?;
        raw.map(RawVersion::into_version).transpose()
    }

    pub fn versions_for_document(&self, document_id: Uuid) -> Result<Vec<DocumentVersion>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {VERSION_COLS} FROM document_versions \
             WHERE document_id = :doc ORDER BY version_seq"
        ))?;
        let rows =
            stmt.query_map(named_params! { ":doc": document_id.to_string() }, version_from_row)?;
        rows.map(|r| r.map_err(Error::from).and_then(RawVersion::into_version))
            .collect()
    }

    /// Record the score movement computed when an analysis completes.
    pub fn set_version_risk_delta(&self, version_id: Uuid, delta: i32) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE document_versions SET risk_delta = :delta WHERE id = :id",
            named_params! { ":delta": delta as i64, ":id": version_id.to_string() },
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("version {version_id}")));
        }
        Ok(())
    }

    /// Enable periodic re-checks for a document.
    pub fn enable_monitoring(&self, document_id: Uuid, interval: Duration) -> Result<()> {
        let now = Utc::now();
        let changed = self.conn().execute(
            "UPDATE documents SET monitoring_enabled = 1, monitor_interval_seconds = :interval, \
             next_monitor_at = :next, updated_at = :now, row_version = row_version + 1 \
             WHERE id = :id AND deleted_at IS NULL",
            named_params! {
                ":interval": interval.num_seconds(),
                ":next": ts(now + interval),
                ":now": ts(now),
                ":id": document_id.to_string(),
            },
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("document {document_id}")));
        }
        Ok(())
    }

    /// Touch the monitoring clock after a pass and schedule the next one.
    pub fn touch_monitored(&self, document_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        let interval: Option<i64> = conn
            .query_row(
                "SELECT monitor_interval_seconds FROM documents \
                 WHERE id = :id AND deleted_at IS NULL AND monitoring_enabled = 1",
                named_params! { ":id": document_id.to_string() },
                |row| row.get::<_, Option<i64>>(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Error::from(other)),
            })?;
        let next = interval.map(|secs| ts(at + Duration::seconds(secs)));

        let changed = conn.execute(
            "UPDATE documents SET last_monitored_at = :at, \
             next_monitor_at = COALESCE(:next, next_monitor_at), updated_at = :at \
             WHERE id = :id AND deleted_at IS NULL",
            named_params! {
                ":at": ts(at),
                ":next": next,
                ":id": document_id.to_string(),
            },
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("document {document_id}")));
        }
        Ok(())
    }

    /// Monitored documents whose next check is due.
    pub fn due_for_monitoring(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Document>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLS} FROM documents \
             WHERE monitoring_enabled = 1 AND deleted_at IS NULL \
               AND next_monitor_at IS NOT NULL AND next_monitor_at <= :now \
             ORDER BY next_monitor_at LIMIT :limit"
        ))?;
        let rows = stmt.query_map(
            named_params! { ":now": ts(now), ":limit": limit as i64 },
            document_from_row,
        )?;
        rows.map(|r| r.map_err(Error::from).and_then(RawDocument::into_document))
            .collect()
    }

    /// Tombstone a document. Versions, analyses, and findings stay.
    pub fn soft_delete_document(&self, document_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let changed = self.conn().execute(
            "UPDATE documents SET deleted_at = :now, monitoring_enabled = 0, updated_at = :now, \
             row_version = row_version + 1 \
             WHERE id = :id AND deleted_at IS NULL",
            named_params! { ":now": ts(now), ":id": document_id.to_string() },
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("document {document_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;

    fn store() -> MetadataStore {
        MetadataStore::open_in_memory().unwrap()
    }

    fn new_doc(owner: Uuid, fp: ContentHash) -> NewDocument {
        NewDocument {
            owner_id: owner,
            team_id: None,
            title: "Terms of Service".into(),
            source_url: Some("https://example.com/tos".into()),
            document_type: DocumentType::Tos,
            fingerprint: fp,
            content_length: 42,
            language: "en".into(),
        }
    }

    fn version_input(fp: ContentHash, kind: ChangeKind) -> NewVersion {
        NewVersion {
            fingerprint: fp,
            content_length: 42,
            change_kind: kind,
            change_summary: "initial capture".into(),
            significant_changes: vec![],
            risk_delta: 0,
            paragraph_digest: vec![],
            section_count: 0,
        }
    }

    #[test]
    fn upsert_is_idempotent_per_owner_and_fingerprint() {
        let store = store();
        let owner = Uuid::new_v4();
        let fp = fingerprint::fingerprint("some text");

        let (first, created) = store.upsert_document(new_doc(owner, fp)).unwrap();
        assert!(created);

        let mut again = new_doc(owner, fp);
        again.title = "A Different Title".into();
        let (second, created) = store.upsert_document(again).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        // Title is not mutated on the dedup path.
        assert_eq!(second.title, "Terms of Service");

        // A different owner with the same content gets their own row.
        let (third, created) = store.upsert_document(new_doc(Uuid::new_v4(), fp)).unwrap();
        assert!(created);
        assert_ne!(third.id, first.id);
    }

    #[test]
    fn version_sequence_is_contiguous_from_one() {
        let store = store();
        let owner = Uuid::new_v4();
        let fp1 = fingerprint::fingerprint("v1");
        let fp2 = fingerprint::fingerprint("v2");
        let fp3 = fingerprint::fingerprint("v3");
        let (doc, _) = store.upsert_document(new_doc(owner, fp1)).unwrap();

        let v1 = store
            .append_version(doc.id, version_input(fp1, ChangeKind::Initial))
            .unwrap();
        let v2 = store
            .append_version(doc.id, version_input(fp2, ChangeKind::Modified))
            .unwrap();
        let v3 = store
            .append_version(doc.id, version_input(fp3, ChangeKind::StructureChanged))
            .unwrap();

        assert_eq!((v1.version_seq, v2.version_seq, v3.version_seq), (1, 2, 3));
        // The document row follows the latest fingerprint.
        let doc = store.get_document(doc.id).unwrap();
        assert_eq!(doc.content_fingerprint, fp3);
    }

    #[test]
    fn unchanged_fingerprint_is_rejected() {
        let store = store();
        let owner = Uuid::new_v4();
        let fp = fingerprint::fingerprint("same");
        let (doc, _) = store.upsert_document(new_doc(owner, fp)).unwrap();
        store
            .append_version(doc.id, version_input(fp, ChangeKind::Initial))
            .unwrap();

        let err = store
            .append_version(doc.id, version_input(fp, ChangeKind::Modified))
            .unwrap_err();
        assert!(matches!(err, Error::FingerprintUnchanged));
        // Nothing was appended.
        assert_eq!(store.versions_for_document(doc.id).unwrap().len(), 1);
    }

    #[test]
    fn soft_delete_frees_the_fingerprint_slot() {
        let store = store();
        let owner = Uuid::new_v4();
        let fp = fingerprint::fingerprint("text");
        let (doc, _) = store.upsert_document(new_doc(owner, fp)).unwrap();

        store.soft_delete_document(doc.id).unwrap();
        let (fresh, created) = store.upsert_document(new_doc(owner, fp)).unwrap();
        assert!(created);
        assert_ne!(fresh.id, doc.id);
    }

    #[test]
    fn on_disk_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fineprint.db");
        let owner = Uuid::new_v4();
        let fp = fingerprint::fingerprint("durable text");

        {
            let store = MetadataStore::open(&path).unwrap();
            store.upsert_document(new_doc(owner, fp)).unwrap();
        }

        let store = MetadataStore::open(&path).unwrap();
        let found = store.find_document_by_fingerprint(owner, fp).unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().title, "Terms of Service");
    }

    #[test]
    fn monitoring_schedule_advances_on_touch() {
        let store = store();
        let owner = Uuid::new_v4();
        let fp = fingerprint::fingerprint("monitored");
        let (doc, _) = store.upsert_document(new_doc(owner, fp)).unwrap();

        store.enable_monitoring(doc.id, Duration::seconds(3600)).unwrap();
        // Not yet due.
        assert!(store.due_for_monitoring(Utc::now(), 10).unwrap().is_empty());

        let later = Utc::now() + Duration::seconds(7200);
        let due = store.due_for_monitoring(later, 10).unwrap();
        assert_eq!(due.len(), 1);

        store.touch_monitored(doc.id, later).unwrap();
        let doc = store.get_document(doc.id).unwrap();
        // Stored timestamps carry microsecond precision.
        assert_eq!(
            doc.last_monitored_at.unwrap().timestamp_micros(),
            later.timestamp_micros()
        );
        assert!(doc.next_monitor_at.unwrap() > later);
    }
}
