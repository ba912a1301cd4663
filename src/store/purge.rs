//! GDPR hard deletion.
//!
//! Removing a user is a cross-store contract: relational rows cascade away,
//! vector points for the owner's documents and clauses are deleted (clauses
//! first, so no clause ever outlives its document row), cache keys are
//! invalidated, and audit records are anonymized in place.

use std::sync::Arc;

use uuid::Uuid;

use crate::cache::Cache;
use crate::error::Result;
use crate::model::AuditRecord;
use crate::vector::{Collection, Filter, VectorIndex};

use super::MetadataStore;

/// Summary of one purge run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub documents_deleted: u64,
    pub vector_points_deleted: u64,
    pub audit_records_anonymized: u64,
}

/// Deletion-contract coordinator over the three stores.
pub struct PurgeService {
    store: Arc<MetadataStore>,
    cache: Cache,
    vector: Arc<dyn VectorIndex>,
}

impl PurgeService {
    pub fn new(store: Arc<MetadataStore>, cache: Cache, vector: Arc<dyn VectorIndex>) -> Self {
        Self {
            store,
            cache,
            vector,
        }
    }

    /// Tombstone one document and drop its hot cache entries. Versions,
    /// analyses, and findings stay queryable.
    pub async fn soft_delete_document(&self, document_id: Uuid) -> Result<()> {
        let document = self.store.get_document(document_id)?;
        self.store.soft_delete_document(document_id)?;

        self.cache
            .invalidate(&format!("doc_meta:{}", document.content_fingerprint))
            .await?;
        self.cache
            .invalidate(&format!("owner:{}:dashboard", document.owner_id))
            .await?;

        self.store.append_audit(
            &AuditRecord::new("document.soft_deleted", "document", document_id.to_string())
                .with_actor(document.owner_id),
        )?;
        Ok(())
    }

    /// Erase everything owned by `owner`.
    pub async fn hard_purge_user(&self, owner: Uuid) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        let documents = self.store.documents_for_owner(owner)?;
        let owner_filter = Filter::new().must_eq("owner_id", owner.to_string());

        // Vector points go first, clauses before documents.
        report.vector_points_deleted += self
            .vector
            .delete_by_filter(Collection::Clauses, &owner_filter)
            .await?;
        report.vector_points_deleted += self
            .vector
            .delete_by_filter(Collection::Documents, &owner_filter)
            .await?;

        // Relational rows: versions, analyses, findings, monitor jobs, and
        // alerts all hang off documents via ON DELETE CASCADE.
        for document in &documents {
            let removed = self.store.conn().execute(
                "DELETE FROM documents WHERE id = :id",
                rusqlite::named_params! { ":id": document.id.to_string() },
            )?;
            report.documents_deleted += removed as u64;

            self.cache
                .invalidate(&format!("doc_meta:{}", document.content_fingerprint))
                .await?;
        }

        report.audit_records_anonymized = self.store.anonymize_audit_for_actor(owner)?;
        self.cache.invalidate_prefix(&format!("owner:{owner}:")).await?;

        self.store.append_audit(
            &AuditRecord::new("user.hard_purged", "user", owner.to_string()).with_after(
                serde_json::json!({
                    "documents_deleted": report.documents_deleted,
                    "vector_points_deleted": report.vector_points_deleted,
                }),
            ),
        )?;

        log::info!(
            "hard-purged owner {owner}: {} documents, {} vector points, {} audit rows anonymized",
            report.documents_deleted,
            report.vector_points_deleted,
            report.audit_records_anonymized
        );
        Ok(report)
    }
}
