//! Shared harness for end-to-end pipeline tests.
//!
//! Wires the real components against in-process backends (SQLite in memory,
//! memory cache, memory vector index) and a scripted LLM, then drives the
//! queues by hand so tests control every step.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use fineprint::cache::{Cache, MemoryCache};
use fineprint::compliance::{default_jurisdiction_rules, ComplianceEngine, ComplianceJob};
use fineprint::config::{AnalysisConfig, CacheConfig, LlmConfig, QueueConfig, VectorConfig};
use fineprint::error::Result;
use fineprint::events::EventBus;
use fineprint::fingerprint::Normalizer;
use fineprint::llm::{LlmClient, LlmRequest, LlmResponse, StopReason};
use fineprint::model::DocumentType;
use fineprint::pipeline::{
    AnalysisJob, AnalysisPipeline, IntakeEvent, IntakeOutcome, IntakeProcessor, PipelineOutcome,
};
use fineprint::queue::JobQueue;
use fineprint::runtime::seed_pattern_embeddings;
use fineprint::store::MetadataStore;
use fineprint::vector::{Embedder, HashingEmbedder, MemoryVectorIndex};

/// LLM stub: plays back scripted outcomes, then falls back to a canned
/// summary with the configured risk score.
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Result<LlmResponse>>>,
    calls: AtomicUsize,
    default_score: u32,
}

impl ScriptedLlm {
    pub fn with_score(default_score: u32) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            default_score,
        })
    }

    pub fn push(&self, outcome: Result<LlmResponse>) {
        self.script.lock().push_back(outcome);
    }

    pub fn push_summary(&self, score: u32) {
        self.push(Ok(summary_response(score)));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn summary_response(score: u32) -> LlmResponse {
    LlmResponse {
        text: format!(
            r#"{{"executive_summary": "Scripted review.", "key_findings": ["scripted"], "recommendations": ["review the clause"], "overall_risk_score": {score}}}"#
        ),
        stop_reason: StopReason::EndTurn,
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(outcome) => outcome,
            None => Ok(summary_response(self.default_score)),
        }
    }
}

/// The assembled test plane.
pub struct TestPlane {
    pub store: Arc<MetadataStore>,
    pub cache: Cache,
    pub vector: Arc<MemoryVectorIndex>,
    pub events: EventBus,
    pub llm: Arc<ScriptedLlm>,
    pub analysis_queue: Arc<JobQueue<AnalysisJob>>,
    pub compliance_queue: Arc<JobQueue<ComplianceJob>>,
    pub intake: IntakeProcessor,
    pub pipeline: AnalysisPipeline,
    pub compliance: ComplianceEngine,
}

pub async fn plane() -> TestPlane {
    plane_with_llm(ScriptedLlm::with_score(78)).await
}

pub async fn plane_with_llm(llm: Arc<ScriptedLlm>) -> TestPlane {
    plane_with(llm, QueueConfig::default()).await
}

pub async fn plane_with(llm: Arc<ScriptedLlm>, analysis_queue_cfg: QueueConfig) -> TestPlane {
    let store = Arc::new(MetadataStore::open_in_memory().unwrap());
    store.seed_builtin_rules().unwrap();

    let cache = Cache::new(Arc::new(MemoryCache::new()));
    let vector = Arc::new(MemoryVectorIndex::new());
    let events = EventBus::new(64);

    let clause_embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(768));
    let document_embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(1536));
    seed_pattern_embeddings(&store, &*clause_embedder, &*vector)
        .await
        .unwrap();

    let analysis_queue = Arc::new(JobQueue::new("analysis", analysis_queue_cfg, events.clone()));
    let compliance_queue = Arc::new(JobQueue::new(
        "compliance",
        QueueConfig::default(),
        events.clone(),
    ));

    let intake = IntakeProcessor::new(
        store.clone(),
        cache.clone(),
        analysis_queue.clone(),
        events.clone(),
        Normalizer::default(),
        &CacheConfig::default(),
    );

    let pipeline = AnalysisPipeline::new(
        store.clone(),
        cache.clone(),
        vector.clone(),
        clause_embedder,
        document_embedder,
        llm.clone(),
        compliance_queue.clone(),
        events.clone(),
        AnalysisConfig::default(),
        VectorConfig::default(),
        LlmConfig::default(),
        CacheConfig::default(),
    );

    let by_name: HashMap<String, Uuid> = store
        .active_pattern_rules()
        .unwrap()
        .into_iter()
        .map(|rule| (rule.name.clone(), rule.id))
        .collect();
    let compliance = ComplianceEngine::new(
        store.clone(),
        cache.clone(),
        events.clone(),
        default_jurisdiction_rules(&by_name),
        &CacheConfig::default(),
    );

    TestPlane {
        store,
        cache,
        vector,
        events,
        llm,
        analysis_queue,
        compliance_queue,
        intake,
        pipeline,
        compliance,
    }
}

impl TestPlane {
    pub fn text_event(&self, owner: Uuid, text: &str) -> IntakeEvent {
        IntakeEvent {
            request_id: Uuid::new_v4(),
            owner_id: owner,
            team_id: None,
            document_id: None,
            title: "Terms of Service".into(),
            url: Some("https://example.com/tos".into()),
            document_type: DocumentType::Tos,
            language: "en".into(),
            fetched_at: Utc::now(),
            content_type: Some("text/plain".into()),
            raw_bytes: text.as_bytes().to_vec(),
        }
    }

    pub async fn run_intake(&self, event: &IntakeEvent) -> IntakeOutcome {
        self.intake.process(event).await.unwrap()
    }

    /// Drive the analysis queue to empty, acking successes and nacking
    /// failures. Returns the pipeline outcomes in order.
    pub async fn drain_analyses(&self) -> Vec<PipelineOutcome> {
        let mut outcomes = Vec::new();
        while let Some(delivery) = self.analysis_queue.try_dequeue() {
            match self.pipeline.run(&delivery.job).await {
                Ok(outcome) => {
                    self.analysis_queue.ack(delivery.receipt());
                    outcomes.push(outcome);
                }
                Err(e) => {
                    self.analysis_queue
                        .nack(delivery.receipt(), e.kind_label(), e.is_retryable());
                }
            }
        }
        outcomes
    }

    /// Drive the compliance queue to empty. Returns total alerts opened.
    pub async fn drain_compliance(&self) -> usize {
        let mut alerts = 0;
        while let Some(delivery) = self.compliance_queue.try_dequeue() {
            let report = self.compliance.process(&delivery.job).await.unwrap();
            alerts += report.alerts_opened.len();
            self.compliance_queue.ack(delivery.receipt());
        }
        alerts
    }
}
