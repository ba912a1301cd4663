//! Intake processing: raw fetch result → document row → change decision →
//! analysis job.
//!
//! Raw text exists only inside this step and the analysis job it produces;
//! nothing durable keeps it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::cache::Cache;
use crate::change::{self, ChangeDecision};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, PlatformEvent};
use crate::fingerprint::{
    fingerprint, looks_like_html, paragraph_digests, section_count, ContentHash, Normalizer,
};
use crate::model::{AuditRecord, ChangeKind, Document, DocumentType};
use crate::queue::{JobQueue, Priority, QueueJob};
use crate::store::{CachedReads, MetadataStore, NewDocument, NewVersion};

use super::AnalysisJob;

/// One fetched candidate document, as emitted by the crawler or an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeEvent {
    pub request_id: Uuid,
    pub owner_id: Uuid,
    pub team_id: Option<Uuid>,
    /// Known document for monitor-driven re-fetches; `None` for fresh intake.
    pub document_id: Option<Uuid>,
    pub title: String,
    pub url: Option<String>,
    pub document_type: DocumentType,
    pub language: String,
    pub fetched_at: DateTime<Utc>,
    pub content_type: Option<String>,
    pub raw_bytes: Vec<u8>,
}

impl QueueJob for IntakeEvent {}

/// What intake did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Content identical to the latest version; only the monitor clock moved.
    Unchanged { document_id: Uuid },
    /// A new version was recorded and queued for analysis.
    Scheduled {
        document_id: Uuid,
        version_seq: i64,
        analysis_id: Uuid,
        change_kind: ChangeKind,
    },
}

/// The intake stage.
pub struct IntakeProcessor {
    store: Arc<MetadataStore>,
    cache: Cache,
    reads: CachedReads,
    analysis_queue: Arc<JobQueue<AnalysisJob>>,
    events: EventBus,
    normalizer: Normalizer,
}

impl IntakeProcessor {
    pub fn new(
        store: Arc<MetadataStore>,
        cache: Cache,
        analysis_queue: Arc<JobQueue<AnalysisJob>>,
        events: EventBus,
        normalizer: Normalizer,
        cache_cfg: &CacheConfig,
    ) -> Self {
        let reads = CachedReads::new(store.clone(), cache.clone(), cache_cfg);
        Self {
            store,
            cache,
            reads,
            analysis_queue,
            events,
            normalizer,
        }
    }

    pub async fn process(&self, event: &IntakeEvent) -> Result<IntakeOutcome> {
        let raw_text = String::from_utf8_lossy(&event.raw_bytes);
        let is_html = event
            .content_type
            .as_deref()
            .map(|ct| ct.contains("html"))
            .unwrap_or_else(|| looks_like_html(&raw_text));
        let normalized = self.normalizer.normalize(&raw_text, is_html)?;
        let content_hash = fingerprint(&normalized);
        let content_length = normalized.chars().count() as u64;

        let (document, created) = self.resolve_document(event, content_hash, content_length)?;

        let previous = self.reads.latest_version(&document).await?;
        let decision = change::evaluate(previous.as_ref(), content_hash, &normalized);

        match decision {
            ChangeDecision::NoChange => {
                self.store.touch_monitored(document.id, event.fetched_at)?;
                self.store.append_audit(
                    &AuditRecord::new("intake.no_change", "document", document.id.to_string())
                        .with_correlation(event.request_id)
                        .with_after(json!({ "fetched_at": event.fetched_at })),
                )?;
                Ok(IntakeOutcome::Unchanged {
                    document_id: document.id,
                })
            }
            ChangeDecision::Changed(detected) => {
                let old_fingerprint = document.content_fingerprint;
                let version = self.store.append_version(
                    document.id,
                    NewVersion {
                        fingerprint: content_hash,
                        content_length,
                        change_kind: detected.kind,
                        change_summary: detected.summary.clone(),
                        significant_changes: detected.significant_changes.clone(),
                        risk_delta: detected.risk_delta,
                        paragraph_digest: paragraph_digests(&normalized),
                        section_count: section_count(&normalized),
                    },
                )?;

                let analysis =
                    match self
                        .store
                        .create_analysis(document.id, version.id, event.owner_id)
                    {
                        Ok(analysis) => analysis,
                        // Another intake beat us to this version; nothing to do.
                        Err(Error::AnalysisInProgress { .. }) => {
                            return Ok(IntakeOutcome::Unchanged {
                                document_id: document.id,
                            })
                        }
                        Err(e) => return Err(e),
                    };

                let job = AnalysisJob {
                    analysis_id: analysis.id,
                    document_id: document.id,
                    document_version_id: version.id,
                    owner_id: event.owner_id,
                    document_type: event.document_type,
                    fingerprint: content_hash,
                    normalized: Arc::new(normalized),
                };
                // Backpressure bubbles up so the intake job retries later.
                self.analysis_queue.enqueue(job, Priority::Normal)?;

                self.store.touch_monitored(document.id, event.fetched_at)?;
                self.invalidate_doc_meta(old_fingerprint, content_hash).await;

                if detected.kind != ChangeKind::Initial {
                    self.events.publish(PlatformEvent::DocumentChanged {
                        document_id: document.id,
                        version_seq: version.version_seq,
                        change_kind: detected.kind,
                        detected_at: version.captured_at,
                    });
                }
                let action = if created { "intake.created" } else { "intake.changed" };
                self.store.append_audit(
                    &AuditRecord::new(action, "document", document.id.to_string())
                        .with_actor(event.owner_id)
                        .with_correlation(event.request_id)
                        .with_after(json!({
                            "version_seq": version.version_seq,
                            "change_kind": detected.kind.as_str(),
                            "change_summary": detected.summary,
                        })),
                )?;

                Ok(IntakeOutcome::Scheduled {
                    document_id: document.id,
                    version_seq: version.version_seq,
                    analysis_id: analysis.id,
                    change_kind: detected.kind,
                })
            }
        }
    }

    fn resolve_document(
        &self,
        event: &IntakeEvent,
        content_hash: ContentHash,
        content_length: u64,
    ) -> Result<(Document, bool)> {
        match event.document_id {
            Some(id) => Ok((self.store.get_document(id)?, false)),
            None => self.store.upsert_document(NewDocument {
                owner_id: event.owner_id,
                team_id: event.team_id,
                title: event.title.clone(),
                source_url: event.url.clone(),
                document_type: event.document_type,
                fingerprint: content_hash,
                content_length,
                language: event.language.clone(),
            }),
        }
    }

    async fn invalidate_doc_meta(&self, old: ContentHash, new: ContentHash) {
        let _ = self.cache.invalidate(&format!("doc_meta:{old}")).await;
        let _ = self.cache.invalidate(&format!("doc_meta:{new}")).await;
    }
}
