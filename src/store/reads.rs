//! Cache-fronted reads.
//!
//! Hot read paths go through the cache first and fall back to the store;
//! cache failures degrade to direct reads and never block. Only immutable
//! or invalidation-covered data is cached: a terminal analysis (immutable),
//! and the latest version summary keyed by the document's current
//! fingerprint (invalidated on append).

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::cache::Cache;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::model::{Analysis, Document, DocumentVersion};

use super::MetadataStore;

/// Read-through facade over [`MetadataStore`].
#[derive(Clone)]
pub struct CachedReads {
    store: Arc<MetadataStore>,
    cache: Cache,
    analysis_ttl: Duration,
    doc_meta_ttl: Duration,
}

impl CachedReads {
    pub fn new(store: Arc<MetadataStore>, cache: Cache, cfg: &CacheConfig) -> Self {
        Self {
            store,
            cache,
            analysis_ttl: Duration::from_secs(cfg.analysis_ttl),
            doc_meta_ttl: Duration::from_secs(cfg.doc_meta_ttl),
        }
    }

    /// Analysis by id. Terminal rows are cached (they no longer change);
    /// non-terminal rows always come from the store.
    pub async fn analysis(&self, id: Uuid) -> Result<Analysis> {
        let key = format!("analysis:{id}");
        match self.cache.get::<Analysis>(&key).await {
            Ok(Some(analysis)) => return Ok(analysis),
            Ok(None) => {}
            Err(e) => log::warn!("analysis cache read failed ({e}); using the store"),
        }

        let analysis = self.store.get_analysis(id)?;
        if analysis.status.is_terminal() {
            if let Err(e) = self.cache.set(&key, &analysis, self.analysis_ttl).await {
                log::warn!("analysis cache write failed: {e}");
            }
        }
        Ok(analysis)
    }

    /// Latest version of a document, keyed by the document's current
    /// fingerprint so an append (which rolls the fingerprint) naturally
    /// misses.
    pub async fn latest_version(&self, document: &Document) -> Result<Option<DocumentVersion>> {
        let key = format!("doc_meta:{}", document.content_fingerprint);
        match self.cache.get::<DocumentVersion>(&key).await {
            Ok(Some(version)) => return Ok(Some(version)),
            Ok(None) => {}
            Err(e) => log::warn!("doc_meta cache read failed ({e}); using the store"),
        }

        let version = self.store.latest_version(document.id)?;
        if let Some(version) = &version {
            if version.fingerprint == document.content_fingerprint {
                if let Err(e) = self.cache.set(&key, version, self.doc_meta_ttl).await {
                    log::warn!("doc_meta cache write failed: {e}");
                }
            }
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::fingerprint;
    use crate::model::{AnalysisStatus, ChangeKind, DocumentType};
    use crate::store::documents::{NewDocument, NewVersion};
    use crate::store::AnalysisPatch;
    use chrono::Utc;

    async fn setup() -> (CachedReads, Arc<MetadataStore>, Document) {
        let store = Arc::new(MetadataStore::open_in_memory().unwrap());
        let cache = Cache::new(Arc::new(MemoryCache::new()));
        let reads = CachedReads::new(store.clone(), cache, &CacheConfig::default());

        let fp = fingerprint::fingerprint("cached text");
        let (document, _) = store
            .upsert_document(NewDocument {
                owner_id: Uuid::new_v4(),
                team_id: None,
                title: "TOS".into(),
                source_url: None,
                document_type: DocumentType::Tos,
                fingerprint: fp,
                content_length: 20,
                language: "en".into(),
            })
            .unwrap();
        store
            .append_version(
                document.id,
                NewVersion {
                    fingerprint: fp,
                    content_length: 20,
                    change_kind: ChangeKind::Initial,
                    change_summary: "initial".into(),
                    significant_changes: vec![],
                    risk_delta: 0,
                    paragraph_digest: vec![],
                    section_count: 0,
                },
            )
            .unwrap();
        let document = store.get_document(document.id).unwrap();
        (reads, store, document)
    }

    #[tokio::test]
    async fn latest_version_reads_through_and_caches() {
        let (reads, _store, document) = setup().await;

        let first = reads.latest_version(&document).await.unwrap().unwrap();
        let second = reads.latest_version(&document).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.version_seq, 1);
    }

    #[tokio::test]
    async fn non_terminal_analyses_are_not_cached() {
        let (reads, store, document) = setup().await;
        let version = store.latest_version(document.id).unwrap().unwrap();
        let analysis = store
            .create_analysis(document.id, version.id, document.owner_id)
            .unwrap();

        // First read sees pending and must not pin it.
        assert_eq!(
            reads.analysis(analysis.id).await.unwrap().status,
            AnalysisStatus::Pending
        );

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
                    overall_risk_score: Some(10),
                    completed_at: Some(Utc::now()),
                    expires_at: Some(Utc::now() + chrono::Duration::days(90)),
                    ..Default::default()
                },
            )
            .unwrap();

        // The completed row is now served (and cached from here on).
        assert_eq!(
            reads.analysis(analysis.id).await.unwrap().status,
            AnalysisStatus::Completed
        );
        assert_eq!(
            reads.analysis(analysis.id).await.unwrap().status,
            AnalysisStatus::Completed
        );
    }
}
