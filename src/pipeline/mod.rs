//! Analysis orchestration.
//!
//! Drives a document version from normalized text to a persisted, scored
//! analysis:
//!
//! 1. admission via the fingerprint dedup lock,
//! 2. lease (`pending → processing`) and fingerprint drift check,
//! 3. deterministic pattern matching against the cached rule library,
//! 4. semantic clause search over windowed embeddings,
//! 5. one LLM summarization call,
//! 6. transactional persistence (clause embeddings land before the
//!    completing transition),
//! 7. compliance handoff, cache invalidation, events.
//!
//! Transient failures put the row back to `pending` for queue redelivery;
//! fatal ones terminate it as `failed` with the error kind recorded.

pub mod intake;
pub mod matcher;
pub mod scoring;

pub use intake::{IntakeEvent, IntakeOutcome, IntakeProcessor};
pub use matcher::{CandidateFinding, MatchSource, PatternMatcher};

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use futures::future;
use serde_json::json;
use uuid::Uuid;

use crate::cache::Cache;
use crate::compliance::ComplianceJob;
use crate::config::{AnalysisConfig, CacheConfig, LlmConfig, VectorConfig};
use crate::error::{Error, ErrorClass, Result};
use crate::events::{EventBus, PlatformEvent};
use crate::fingerprint::{excerpt, fingerprint, ContentHash};
use crate::llm::{build_analysis_prompt, parse_summary, LlmClient, LlmRequest};
use crate::model::{
    Analysis, AnalysisStatus, AuditRecord, DocumentType, Finding, PatternRule, Severity,
};
use crate::queue::{JobQueue, Priority, QueueJob};
use crate::store::{AnalysisPatch, MetadataStore, NewFinding};
use crate::vector::{Collection, Embedder, Filter, VectorIndex, VectorRecord};

/// Queue job: analyze one captured version.
#[derive(Clone)]
pub struct AnalysisJob {
    pub analysis_id: Uuid,
    pub document_id: Uuid,
    pub document_version_id: Uuid,
    pub owner_id: Uuid,
    pub document_type: DocumentType,
    pub fingerprint: ContentHash,
    /// Normalized text, held only for the lifetime of the job.
    pub normalized: Arc<String>,
}

impl QueueJob for AnalysisJob {
    fn dedup_key(&self) -> Option<String> {
        Some(format!("{}:{}", self.document_id, self.fingerprint))
    }
}

/// Outcome of one pipeline run.
#[derive(Debug)]
pub enum PipelineOutcome {
    Completed(Analysis),
    /// Another worker owns this fingerprint right now; the submission is
    /// dropped and the owner's result stands.
    Absorbed,
}

/// Character-offset window over the normalized text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClauseWindow {
    pub start: usize,
    pub end: usize,
}

/// Fixed-size clause windows with overlap, in character offsets.
pub fn clause_windows(char_len: usize, window: usize, overlap: usize) -> Vec<ClauseWindow> {
    if char_len == 0 || window == 0 {
        return Vec::new();
    }
    let step = window.saturating_sub(overlap).max(1);
    let mut out = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + window).min(char_len);
        out.push(ClauseWindow { start, end });
        if end == char_len {
            break;
        }
        start += step;
    }
    out
}

/// The analysis orchestrator.
pub struct AnalysisPipeline {
    store: Arc<MetadataStore>,
    cache: Cache,
    vector: Arc<dyn VectorIndex>,
    clause_embedder: Arc<dyn Embedder>,
    document_embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LlmClient>,
    compliance_queue: Arc<JobQueue<ComplianceJob>>,
    events: EventBus,
    analysis_cfg: AnalysisConfig,
    vector_cfg: VectorConfig,
    llm_cfg: LlmConfig,
    cache_cfg: CacheConfig,
}

impl AnalysisPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<MetadataStore>,
        cache: Cache,
        vector: Arc<dyn VectorIndex>,
        clause_embedder: Arc<dyn Embedder>,
        document_embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmClient>,
        compliance_queue: Arc<JobQueue<ComplianceJob>>,
        events: EventBus,
        analysis_cfg: AnalysisConfig,
        vector_cfg: VectorConfig,
        llm_cfg: LlmConfig,
        cache_cfg: CacheConfig,
    ) -> Self {
        Self {
            store,
            cache,
            vector,
            clause_embedder,
            document_embedder,
            llm,
            compliance_queue,
            events,
            analysis_cfg,
            vector_cfg,
            llm_cfg,
            cache_cfg,
        }
    }

    /// Run one analysis job under the fingerprint dedup lock.
    ///
    /// Transient errors are returned to the caller (the worker nacks the
    /// delivery) after the row has been parked back at `pending`.
    pub async fn run(&self, job: &AnalysisJob) -> Result<PipelineOutcome> {
        let lock_key = format!("dedup_lock:{}", job.fingerprint);
        let ttl = StdDuration::from_secs(self.cache_cfg.dedup_lock_ttl);

        let token = match self.cache.acquire_lock(&lock_key, ttl).await {
            Ok(Some(token)) => Some(token),
            Ok(None) => {
                log::debug!(
                    "analysis {}: dedup lock busy for {}, absorbing",
                    job.analysis_id,
                    job.fingerprint
                );
                return Ok(PipelineOutcome::Absorbed);
            }
            // Degraded cache never blocks the pipeline; the queue-side dedup
            // index still guards against duplicates.
            Err(e) if e.class() == ErrorClass::Degraded => {
                log::warn!("dedup lock unavailable ({e}); continuing without it");
                None
            }
            Err(e) => return Err(e),
        };

        let result = self.run_locked(job).await;

        if let Some(token) = token {
            let _ = self.cache.release_lock(&token).await;
        }
        result
    }

    async fn run_locked(&self, job: &AnalysisJob) -> Result<PipelineOutcome> {
        let started = Utc::now();
        match self.store.transition_analysis(
            job.analysis_id,
            AnalysisStatus::Pending,
            AnalysisStatus::Processing,
            AnalysisPatch {
                started_at: Some(started),
                ..Default::default()
            },
        ) {
            Ok(_) => {}
            // Not pending: either terminal already or another worker holds
            // the lease. Both mean this delivery has nothing to do.
            Err(Error::Conflict(_)) => return Ok(PipelineOutcome::Absorbed),
            Err(e) => return Err(e),
        }

        match self.execute(job, started).await {
            Ok(analysis) => Ok(PipelineOutcome::Completed(analysis)),
            Err(e) => {
                self.record_failure(job, &e);
                Err(e)
            }
        }
    }

    async fn execute(&self, job: &AnalysisJob, started: chrono::DateTime<Utc>) -> Result<Analysis> {
        // Drift check: the text in hand must still be the version we claim
        // to analyze.
        let actual = fingerprint(&job.normalized);
        if actual != job.fingerprint {
            return Err(Error::FingerprintDrift {
                recorded: job.fingerprint.to_hex(),
                actual: actual.to_hex(),
            });
        }

        // Pattern matching over the cached active library.
        let rules = self.active_rules().await?;
        let pattern_matcher = PatternMatcher::compile(rules);
        let mut candidates = pattern_matcher.scan(&job.normalized);

        // Semantic clause search, merged under the same overlap policy.
        candidates = self.merge_semantic_matches(job, candidates).await?;

        // One summarization call per analysis.
        let preview = self.finding_preview(job, &candidates)?;
        let prompt =
            build_analysis_prompt(job.document_type.as_str(), &job.normalized, &preview)?;
        let response = self
            .llm
            .complete(LlmRequest {
                prompt,
                max_tokens: self.llm_cfg.max_tokens,
                model_id: self.llm_cfg.model_id.clone(),
            })
            .await?;
        let summary = parse_summary(&response.text)?;

        // Persist findings, then clause embeddings, then the completing
        // transition — readers of a completed analysis always see both.
        let new_findings = self.to_new_findings(job, &candidates)?;
        let findings = self.store.insert_findings(job.analysis_id, &new_findings)?;
        self.upsert_clause_embeddings(job, &findings).await?;
        self.upsert_document_embedding(job).await?;

        let severities: Vec<Severity> = findings.iter().map(|f| f.severity).collect();
        let score = scoring::resolve_risk_score(summary.overall_risk_score, &severities);
        let completed_at = Utc::now();
        let expires_at = completed_at + chrono::Duration::days(self.analysis_cfg.retention_days as i64);
        let processing_ms = (completed_at - started).num_milliseconds().max(0) as u64;

        let analysis = self.store.transition_analysis(
            job.analysis_id,
            AnalysisStatus::Processing,
            AnalysisStatus::Completed,
            AnalysisPatch {
                overall_risk_score: Some(score),
                model_id: Some(self.llm_cfg.model_id.clone()),
                processing_ms: Some(processing_ms),
                executive_summary: Some(summary.executive_summary),
                key_findings: Some(summary.key_findings),
                recommendations: Some(summary.recommendations),
                completed_at: Some(completed_at),
                expires_at: Some(expires_at),
                ..Default::default()
            },
        )?;

        // True risk delta now that the score exists.
        let version = self.store.get_version(job.document_version_id)?;
        let previous = self
            .store
            .previous_risk_score(job.document_id, version.version_seq)?;
        self.store
            .set_version_risk_delta(version.id, scoring::risk_delta(score, previous))?;

        self.handoff_and_invalidate(job, &analysis).await;
        Ok(analysis)
    }

    /// Active rules through the cache; misses and degraded reads fall back
    /// to the store.
    async fn active_rules(&self) -> Result<Vec<PatternRule>> {
        let ttl = StdDuration::from_secs(self.cache_cfg.pattern_lib_ttl);
        match self.cache.get::<Vec<PatternRule>>("pattern_lib:all").await {
            Ok(Some(rules)) => return Ok(rules),
            Ok(None) => {}
            Err(e) => log::warn!("pattern library cache read failed ({e}); using the store"),
        }
        let rules = self.store.active_pattern_rules()?;
        if let Err(e) = self.cache.set("pattern_lib:all", &rules, ttl).await {
            log::warn!("pattern library cache write failed: {e}");
        }
        Ok(rules)
    }

    async fn merge_semantic_matches(
        &self,
        job: &AnalysisJob,
        mut candidates: Vec<CandidateFinding>,
    ) -> Result<Vec<CandidateFinding>> {
        let top_k = self.vector_cfg.pattern_top_k;
        if top_k == 0 {
            return Ok(candidates);
        }

        let char_len = job.normalized.chars().count();
        let windows = clause_windows(
            char_len,
            self.analysis_cfg.clause_window_chars,
            self.analysis_cfg.clause_overlap_chars,
        );
        let filter = Filter::new().must_eq("active", true);

        for window in windows {
            let text = excerpt_window(&job.normalized, window.start, window.end);
            let embedding = self.clause_embedder.embed(&text).await?;
            let hits = self
                .vector
                .search(
                    Collection::Patterns,
                    &embedding,
                    &filter,
                    top_k,
                    self.vector_cfg.pattern_score_threshold,
                )
                .await?;

            for hit in hits {
                let Some(pattern_id) = hit
                    .payload
                    .get("pattern_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
                else {
                    continue;
                };
                let severity = hit
                    .payload
                    .get("severity")
                    .and_then(|v| v.as_str())
                    .and_then(Severity::parse)
                    .unwrap_or(Severity::Medium);
                let category = hit
                    .payload
                    .get("category")
                    .and_then(|v| v.as_str())
                    .unwrap_or("semantic")
                    .to_string();
                candidates.push(CandidateFinding {
                    category,
                    title: hit
                        .payload
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Semantic clause match")
                        .to_string(),
                    description: "Clause semantically similar to a known pattern".to_string(),
                    severity,
                    confidence: f64::from(hit.score).clamp(0.0, 1.0),
                    pattern_id: Some(pattern_id),
                    start: window.start,
                    end: window.end,
                    source: MatchSource::Semantic,
                    recommendation: None,
                    impact: None,
                });
            }
        }

        Ok(matcher::dedup_overlaps(candidates))
    }

    fn finding_preview(&self, job: &AnalysisJob, candidates: &[CandidateFinding]) -> Result<Vec<Finding>> {
        candidates
            .iter()
            .map(|c| {
                Ok(Finding {
                    id: Uuid::nil(),
                    analysis_id: job.analysis_id,
                    category: c.category.clone(),
                    title: c.title.clone(),
                    description: c.description.clone(),
                    severity: c.severity,
                    confidence: c.confidence,
                    pattern_id: c.pattern_id,
                    excerpt: excerpt(&job.normalized, c.start, c.end)?,
                    position_start: c.start as u64,
                    position_end: c.end as u64,
                    recommendation: c.recommendation.clone(),
                    impact: c.impact.clone(),
                })
            })
            .collect()
    }

    fn to_new_findings(
        &self,
        job: &AnalysisJob,
        candidates: &[CandidateFinding],
    ) -> Result<Vec<NewFinding>> {
        candidates
            .iter()
            .map(|c| {
                Ok(NewFinding {
                    category: c.category.clone(),
                    title: c.title.clone(),
                    description: c.description.clone(),
                    severity: c.severity,
                    confidence: c.confidence.min(1.0),
                    pattern_id: c.pattern_id,
                    excerpt: excerpt(&job.normalized, c.start, c.end)?,
                    position_start: c.start as u64,
                    position_end: c.end as u64,
                    recommendation: c.recommendation.clone(),
                    impact: c.impact.clone(),
                })
            })
            .collect()
    }

    async fn upsert_clause_embeddings(&self, job: &AnalysisJob, findings: &[Finding]) -> Result<()> {
        // A prior failed attempt may have left clause points behind under
        // finding ids that no longer exist; replace them wholesale.
        self.vector
            .delete_by_filter(
                Collection::Clauses,
                &Filter::new().must_eq("analysis_id", job.analysis_id.to_string()),
            )
            .await?;

        future::try_join_all(findings.iter().map(|finding| async move {
            let embedding = self.clause_embedder.embed(&finding.excerpt).await?;
            self.vector
                .upsert(
                    Collection::Clauses,
                    VectorRecord {
                        id: finding.id,
                        vector: embedding,
                        payload: json!({
                            "clause_id": finding.id.to_string(),
                            "document_id": job.document_id.to_string(),
                            "analysis_id": job.analysis_id.to_string(),
                            "owner_id": job.owner_id.to_string(),
                            "category": finding.category,
                            "severity": finding.severity.as_str(),
                            "position_start": finding.position_start,
                            "position_end": finding.position_end,
                        }),
                    },
                )
                .await
        }))
        .await?;
        Ok(())
    }

    /// Keep the document searchable: one embedding per document, replaced
    /// on every re-analysis.
    async fn upsert_document_embedding(&self, job: &AnalysisJob) -> Result<()> {
        let embedding = self.document_embedder.embed(&job.normalized).await?;
        self.vector
            .upsert(
                Collection::Documents,
                VectorRecord {
                    id: job.document_id,
                    vector: embedding,
                    payload: json!({
                        "document_id": job.document_id.to_string(),
                        "fingerprint": job.fingerprint.to_hex(),
                        "document_type": job.document_type.as_str(),
                        "owner_id": job.owner_id.to_string(),
                        "created_at": Utc::now().to_rfc3339(),
                    }),
                },
            )
            .await
    }

    async fn handoff_and_invalidate(&self, job: &AnalysisJob, analysis: &Analysis) {
        if let Err(e) = self
            .compliance_queue
            .enqueue(ComplianceJob { analysis_id: analysis.id }, Priority::Normal)
        {
            log::warn!("compliance handoff for {} failed: {e}", analysis.id);
        }

        let _ = self.cache.invalidate(&format!("analysis:{}", analysis.id)).await;
        let _ = self
            .cache
            .invalidate(&format!("doc_meta:{}", job.fingerprint))
            .await;
        let _ = self
            .cache
            .invalidate(&format!("owner:{}:dashboard", job.owner_id))
            .await;

        self.events.publish(PlatformEvent::AnalysisCompleted {
            analysis_id: analysis.id,
            document_id: analysis.document_id,
            overall_risk_score: analysis.overall_risk_score.unwrap_or(0),
            completed_at: analysis.completed_at.unwrap_or_else(Utc::now),
        });

        if let Err(e) = self.store.append_audit(
            &AuditRecord::new("analysis.completed", "analysis", analysis.id.to_string())
                .with_actor(job.owner_id)
                .with_after(json!({
                    "overall_risk_score": analysis.overall_risk_score,
                    "document_version_id": analysis.document_version_id,
                })),
        ) {
            log::warn!("audit append for analysis {} failed: {e}", analysis.id);
        }
    }

    /// Park or terminate the row according to the error class.
    fn record_failure(&self, job: &AnalysisJob, error: &Error) {
        let result = if error.is_retryable() {
            // Back to pending; the queue's retry schedule redelivers.
            self.store.transition_analysis(
                job.analysis_id,
                AnalysisStatus::Processing,
                AnalysisStatus::Pending,
                AnalysisPatch::default(),
            )
        } else {
            self.store.transition_analysis(
                job.analysis_id,
                AnalysisStatus::Processing,
                AnalysisStatus::Failed,
                AnalysisPatch {
                    error_kind: Some(error.kind_label().to_string()),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
        };
        if let Err(e) = result {
            log::error!(
                "analysis {}: failed to record {} outcome: {e}",
                job.analysis_id,
                error.kind_label()
            );
        }
    }
}

/// Window slice by char offsets (no 500-char cap, unlike excerpts).
fn excerpt_window(text: &str, start: usize, end: usize) -> String {
    text.chars().skip(start).take(end.saturating_sub(start)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clause_windows_cover_the_text_with_overlap() {
        let windows = clause_windows(5000, 2000, 200);
        assert_eq!(windows[0], ClauseWindow { start: 0, end: 2000 });
        assert_eq!(windows[1], ClauseWindow { start: 1800, end: 3800 });
        assert_eq!(windows[2], ClauseWindow { start: 3600, end: 5000 });
        assert_eq!(windows.last().unwrap().end, 5000);
    }

    #[test]
    fn short_text_is_one_window() {
        let windows = clause_windows(500, 2000, 200);
        assert_eq!(windows, vec![ClauseWindow { start: 0, end: 500 }]);
        assert!(clause_windows(0, 2000, 200).is_empty());
    }
}
