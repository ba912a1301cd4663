//! Composition root and worker pools.
//!
//! Every process-wide resource (metadata store, cache client, vector index,
//! HTTP client, queues, event bus) is built here once and handed to workers
//! explicitly; nothing else in the crate holds global state.
//!
//! Pools are plain spawned tasks looping over their queue. Cancellation is
//! cooperative: the shutdown signal stops intake of new work and each loop
//! exits at its next suspension point; unfinished leases expire and the
//! jobs redeliver on the next start.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::{Cache, CacheClient, MemoryCache};
use crate::compliance::{default_jurisdiction_rules, ComplianceEngine, ComplianceJob};
use crate::config::Config;
use crate::crawler::Crawler;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::fingerprint::Normalizer;
use crate::llm::{HttpLlmClient, LlmClient};
use crate::model::JurisdictionRule;
use crate::monitor::{MonitorRequest, MonitorScheduler};
use crate::pipeline::{AnalysisJob, AnalysisPipeline, IntakeEvent, IntakeProcessor};
use crate::queue::JobQueue;
use crate::ratelimit::HostLimiter;
use crate::store::{MetadataStore, PurgeService};
use crate::vector::{
    Collection, Embedder, Filter, HashingEmbedder, HttpVectorIndex, MemoryVectorIndex, VectorIndex,
    VectorRecord,
};

// ─── Shutdown signal ─────────────────────────────────────────────────────────

/// Owner side of the shutdown signal.
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Fire the signal. Idempotent.
    pub fn begin(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable receiver workers select against at suspension points.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown begins. If the controller is gone without
    /// firing, this pends forever (the workers' other select arms win).
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Assembles a [`Runtime`], allowing client overrides for the external
/// collaborators (tests inject scripted LLMs and in-memory stores here).
pub struct RuntimeBuilder {
    config: Config,
    llm: Option<Arc<dyn LlmClient>>,
    vector: Option<Arc<dyn VectorIndex>>,
    cache_client: Option<Arc<dyn CacheClient>>,
    store: Option<Arc<MetadataStore>>,
    jurisdiction_rules: Option<Vec<JurisdictionRule>>,
}

impl RuntimeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            llm: None,
            vector: None,
            cache_client: None,
            store: None,
            jurisdiction_rules: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_vector(mut self, vector: Arc<dyn VectorIndex>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn with_cache_client(mut self, cache: Arc<dyn CacheClient>) -> Self {
        self.cache_client = Some(cache);
        self
    }

    pub fn with_store(mut self, store: Arc<MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_jurisdiction_rules(mut self, rules: Vec<JurisdictionRule>) -> Self {
        self.jurisdiction_rules = Some(rules);
        self
    }

    pub async fn build(self) -> Result<Runtime> {
        // Host processes may have installed their own logger already.
        let _ = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
        .try_init();

        let cfg = self.config;

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(match &cfg.runtime.database_path {
                Some(path) => MetadataStore::open(path)?,
                None => MetadataStore::open_in_memory()?,
            }),
        };
        store.seed_builtin_rules()?;

        let cache_client: Arc<dyn CacheClient> = match self.cache_client {
            Some(client) => client,
            None => Arc::new(MemoryCache::new()),
        };
        let cache = Cache::new(cache_client);

        let shared_http = crate::crawler::build_client(
            &cfg.crawler.user_agent,
            Duration::from_millis(cfg.http.timeout_ms),
        )?;
        let vector: Arc<dyn VectorIndex> = match self.vector {
            Some(vector) => vector,
            None => match &cfg.vector.endpoint {
                Some(endpoint) => {
                    let index = HttpVectorIndex::new(shared_http.clone(), endpoint.clone());
                    index.ensure_collections().await?;
                    Arc::new(index)
                }
                None => Arc::new(MemoryVectorIndex::new()),
            },
        };

        let llm: Arc<dyn LlmClient> = match self.llm {
            Some(llm) => llm,
            None => Arc::new(
                HttpLlmClient::from_config(shared_http.clone(), &cfg.llm).ok_or_else(|| {
                    Error::Internal("no LLM endpoint configured and no client injected".into())
                })?,
            ),
        };

        let events = EventBus::default();
        let limiter = Arc::new(HostLimiter::new(&cfg.rate_limit));

        let intake_queue = Arc::new(JobQueue::<IntakeEvent>::new(
            "intake",
            cfg.queue.intake.clone(),
            events.clone(),
        ));
        let analysis_queue = Arc::new(JobQueue::<AnalysisJob>::new(
            "analysis",
            cfg.queue.analysis.clone(),
            events.clone(),
        ));
        let monitor_queue = Arc::new(JobQueue::<MonitorRequest>::new(
            "monitor",
            cfg.queue.monitor.clone(),
            events.clone(),
        ));
        let compliance_queue = Arc::new(JobQueue::<ComplianceJob>::new(
            "compliance",
            cfg.queue.compliance.clone(),
            events.clone(),
        ));

        let clause_embedder: Arc<dyn Embedder> =
            Arc::new(HashingEmbedder::new(Collection::Patterns.dimensions()));
        let document_embedder: Arc<dyn Embedder> =
            Arc::new(HashingEmbedder::new(Collection::Documents.dimensions()));

        seed_pattern_embeddings(&store, &*clause_embedder, &*vector).await?;

        let crawler = Arc::new(Crawler::new(
            limiter.clone(),
            intake_queue.clone(),
            events.clone(),
            cfg.crawler.clone(),
            cfg.http.clone(),
        )?);

        let intake = Arc::new(IntakeProcessor::new(
            store.clone(),
            cache.clone(),
            analysis_queue.clone(),
            events.clone(),
            Normalizer::new(cfg.normalize.max_bytes),
            &cfg.cache,
        ));

        let pipeline = Arc::new(AnalysisPipeline::new(
            store.clone(),
            cache.clone(),
            vector.clone(),
            clause_embedder,
            document_embedder,
            llm,
            compliance_queue.clone(),
            events.clone(),
            cfg.analysis.clone(),
            cfg.vector.clone(),
            cfg.llm.clone(),
            cfg.cache.clone(),
        ));

        let jurisdiction_rules = match self.jurisdiction_rules {
            Some(rules) => rules,
            None => {
                let by_name = store
                    .active_pattern_rules()?
                    .into_iter()
                    .map(|r| (r.name.clone(), r.id))
                    .collect();
                default_jurisdiction_rules(&by_name)
            }
        };
        let compliance = Arc::new(ComplianceEngine::new(
            store.clone(),
            cache.clone(),
            events.clone(),
            jurisdiction_rules,
            &cfg.cache,
        ));

        let scheduler = Arc::new(MonitorScheduler::new(store.clone(), monitor_queue.clone()));
        let purge = Arc::new(PurgeService::new(
            store.clone(),
            cache.clone(),
            vector.clone(),
        ));

        Ok(Runtime {
            cfg,
            store,
            cache,
            vector,
            events,
            limiter,
            intake_queue,
            analysis_queue,
            monitor_queue,
            compliance_queue,
            crawler,
            intake,
            pipeline,
            compliance,
            scheduler,
            purge,
            controller: ShutdownController::new(),
            workers: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

/// Embed the active pattern library into the `patterns` collection so
/// semantic clause search has something to match against.
pub async fn seed_pattern_embeddings(
    store: &MetadataStore,
    embedder: &dyn Embedder,
    vector: &dyn VectorIndex,
) -> Result<()> {
    // Replace previous seeds wholesale; deactivated versions drop out.
    vector
        .delete_by_filter(Collection::Patterns, &Filter::new().must_eq("seeded", true))
        .await?;

    for rule in store.active_pattern_rules()? {
        let text = format!(
            "{} {} {}",
            rule.name,
            rule.description,
            rule.keywords.join(" ")
        );
        let embedding = embedder.embed(&text).await?;
        vector
            .upsert(
                Collection::Patterns,
                VectorRecord {
                    id: rule.id,
                    vector: embedding,
                    payload: serde_json::json!({
                        "pattern_id": rule.id.to_string(),
                        "name": rule.name,
                        "category": rule.category,
                        "severity": rule.severity.as_str(),
                        "active": rule.active,
                        "version": rule.version,
                        "seeded": true,
                    }),
                },
            )
            .await?;
    }
    Ok(())
}

// ─── Runtime ─────────────────────────────────────────────────────────────────

/// The assembled data plane.
pub struct Runtime {
    cfg: Config,
    store: Arc<MetadataStore>,
    cache: Cache,
    vector: Arc<dyn VectorIndex>,
    events: EventBus,
    limiter: Arc<HostLimiter>,
    intake_queue: Arc<JobQueue<IntakeEvent>>,
    analysis_queue: Arc<JobQueue<AnalysisJob>>,
    monitor_queue: Arc<JobQueue<MonitorRequest>>,
    compliance_queue: Arc<JobQueue<ComplianceJob>>,
    crawler: Arc<Crawler>,
    intake: Arc<IntakeProcessor>,
    pipeline: Arc<AnalysisPipeline>,
    compliance: Arc<ComplianceEngine>,
    scheduler: Arc<MonitorScheduler>,
    purge: Arc<PurgeService>,
    controller: ShutdownController,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub fn builder(config: Config) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    // Accessors for embedding the runtime in a host process.
    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }
    pub fn cache(&self) -> &Cache {
        &self.cache
    }
    pub fn vector(&self) -> &Arc<dyn VectorIndex> {
        &self.vector
    }
    pub fn events(&self) -> &EventBus {
        &self.events
    }
    pub fn crawler(&self) -> &Arc<Crawler> {
        &self.crawler
    }
    pub fn intake_queue(&self) -> &Arc<JobQueue<IntakeEvent>> {
        &self.intake_queue
    }
    pub fn analysis_queue(&self) -> &Arc<JobQueue<AnalysisJob>> {
        &self.analysis_queue
    }
    pub fn purge_service(&self) -> &Arc<PurgeService> {
        &self.purge
    }
    pub fn shutdown_signal(&self) -> Shutdown {
        self.controller.subscribe()
    }

    /// Spawn every worker pool. Idempotent only in the sense that calling it
    /// twice doubles the pools; call once.
    pub fn start(&self) {
        let shutdown = self.controller.subscribe();
        let mut workers = self.workers.lock();

        for i in 0..self.cfg.worker_pools.crawler {
            workers.push(tokio::spawn(crawl_worker(
                i,
                self.scheduler.clone(),
                self.crawler.clone(),
                self.monitor_queue.clone(),
                shutdown.clone(),
            )));
        }
        for i in 0..self.cfg.worker_pools.intake {
            workers.push(tokio::spawn(intake_worker(
                i,
                self.intake.clone(),
                self.intake_queue.clone(),
                shutdown.clone(),
            )));
        }
        for i in 0..self.cfg.worker_pools.analyzer {
            workers.push(tokio::spawn(analyzer_worker(
                i,
                self.pipeline.clone(),
                self.analysis_queue.clone(),
                shutdown.clone(),
            )));
        }
        for i in 0..self.cfg.worker_pools.monitor {
            workers.push(tokio::spawn(monitor_scheduler_loop(
                i,
                self.scheduler.clone(),
                shutdown.clone(),
            )));
        }
        for i in 0..self.cfg.worker_pools.compliance {
            workers.push(tokio::spawn(compliance_worker(
                i,
                self.compliance.clone(),
                self.compliance_queue.clone(),
                shutdown.clone(),
            )));
        }
        workers.push(tokio::spawn(maintenance_loop(
            self.store.clone(),
            self.limiter.clone(),
            self.intake_queue.clone(),
            self.analysis_queue.clone(),
            self.monitor_queue.clone(),
            self.compliance_queue.clone(),
            self.cfg.audit.retention_days,
            shutdown,
        )));

        log::info!(
            "runtime started: {} crawler / {} intake / {} analyzer / {} monitor / {} compliance workers",
            self.cfg.worker_pools.crawler,
            self.cfg.worker_pools.intake,
            self.cfg.worker_pools.analyzer,
            self.cfg.worker_pools.monitor,
            self.cfg.worker_pools.compliance
        );
    }

    /// Wire Ctrl-C to the shutdown signal.
    pub fn install_signal_handler(&self) -> Result<()> {
        let shutdown = self.controller.subscribe();
        let tx = self.controller.tx_clone();
        ctrlc::set_handler(move || {
            if !shutdown.is_shutdown() {
                log::info!("interrupt received; draining");
            }
            let _ = tx.send(true);
        })
        .map_err(|e| Error::Internal(format!("signal handler install failed: {e}")))
    }

    /// Stop accepting work, then drain for up to the configured grace
    /// period. Workers still running after that are aborted; their leases
    /// expire and the jobs redeliver on the next start.
    pub async fn shutdown(&self) {
        self.controller.begin();
        let grace = Duration::from_secs(self.cfg.runtime.graceful_shutdown_seconds);
        let deadline = tokio::time::Instant::now() + grace;

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let abort = worker.abort_handle();
            if tokio::time::timeout(remaining, worker).await.is_err() {
                log::warn!("worker did not drain in time; aborting");
                abort.abort();
            }
        }
        log::info!("runtime stopped");
    }
}

impl ShutdownController {
    fn tx_clone(&self) -> watch::Sender<bool> {
        self.tx.clone()
    }
}

// ─── Worker loops ────────────────────────────────────────────────────────────

async fn crawl_worker(
    id: usize,
    scheduler: Arc<MonitorScheduler>,
    crawler: Arc<Crawler>,
    queue: Arc<JobQueue<MonitorRequest>>,
    shutdown: Shutdown,
) {
    while let Some(delivery) = queue.dequeue(&shutdown).await {
        match scheduler.dispatch(&crawler, &delivery.job, &shutdown).await {
            Ok(()) => queue.ack(delivery.receipt()),
            Err(e) => {
                log::warn!("crawl worker {id}: {e}");
                queue.nack(delivery.receipt(), e.kind_label(), e.is_retryable());
            }
        }
    }
}

async fn intake_worker(
    id: usize,
    intake: Arc<IntakeProcessor>,
    queue: Arc<JobQueue<IntakeEvent>>,
    shutdown: Shutdown,
) {
    while let Some(delivery) = queue.dequeue(&shutdown).await {
        match intake.process(&delivery.job).await {
            Ok(_) => queue.ack(delivery.receipt()),
            Err(e) => {
                log::warn!("intake worker {id}: {e}");
                queue.nack(delivery.receipt(), e.kind_label(), e.is_retryable());
            }
        }
    }
}

async fn analyzer_worker(
    id: usize,
    pipeline: Arc<AnalysisPipeline>,
    queue: Arc<JobQueue<AnalysisJob>>,
    shutdown: Shutdown,
) {
    while let Some(delivery) = queue.dequeue(&shutdown).await {
        match pipeline.run(&delivery.job).await {
            Ok(_) => queue.ack(delivery.receipt()),
            Err(e) => {
                log::warn!(
                    "analyzer {id}: analysis {} attempt {} failed: {e}",
                    delivery.job.analysis_id,
                    delivery.attempt
                );
                queue.nack(delivery.receipt(), e.kind_label(), e.is_retryable());
            }
        }
    }
}

async fn compliance_worker(
    id: usize,
    engine: Arc<ComplianceEngine>,
    queue: Arc<JobQueue<ComplianceJob>>,
    shutdown: Shutdown,
) {
    while let Some(delivery) = queue.dequeue(&shutdown).await {
        match engine.process(&delivery.job).await {
            Ok(report) => {
                if !report.alerts_opened.is_empty() {
                    log::info!(
                        "compliance worker {id}: opened {} alerts for analysis {}",
                        report.alerts_opened.len(),
                        delivery.job.analysis_id
                    );
                }
                queue.ack(delivery.receipt());
            }
            Err(e) => {
                log::warn!("compliance worker {id}: {e}");
                queue.nack(delivery.receipt(), e.kind_label(), e.is_retryable());
            }
        }
    }
}

async fn monitor_scheduler_loop(id: usize, scheduler: Arc<MonitorScheduler>, shutdown: Shutdown) {
    const PASS_INTERVAL: Duration = Duration::from_secs(30);
    const PASS_LIMIT: usize = 100;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(PASS_INTERVAL) => {}
            _ = shutdown.wait() => return,
        }
        match scheduler.schedule_due(Utc::now(), PASS_LIMIT) {
            Ok(0) => {}
            Ok(n) => log::debug!("monitor scheduler {id}: queued {n} passes"),
            Err(e) => log::warn!("monitor scheduler {id}: {e}"),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn maintenance_loop(
    store: Arc<MetadataStore>,
    limiter: Arc<HostLimiter>,
    intake_queue: Arc<JobQueue<IntakeEvent>>,
    analysis_queue: Arc<JobQueue<AnalysisJob>>,
    monitor_queue: Arc<JobQueue<MonitorRequest>>,
    compliance_queue: Arc<JobQueue<ComplianceJob>>,
    audit_retention_days: u64,
    shutdown: Shutdown,
) {
    const TICK: Duration = Duration::from_secs(1);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(TICK) => {}
            _ = shutdown.wait() => return,
        }
        ticks += 1;

        // Every second: lease expiry and retry promotion.
        intake_queue.tick();
        analysis_queue.tick();
        monitor_queue.tick();
        compliance_queue.tick();

        // Every minute: retention sweep and bucket hygiene.
        if ticks % 60 == 0 {
            match store.sweep_expired_analyses(Utc::now()) {
                Ok(0) => {}
                Ok(n) => log::info!("expired {n} past-retention analyses"),
                Err(e) => log::warn!("expiry sweep failed: {e}"),
            }
            limiter.evict_idle();
        }

        // Hourly: audit retention.
        if ticks % 3_600 == 0 {
            let cutoff = Utc::now() - chrono::Duration::days(audit_retention_days as i64);
            match store.purge_audit_before(cutoff) {
                Ok(0) => {}
                Ok(n) => log::info!("purged {n} audit records past retention"),
                Err(e) => log::warn!("audit purge failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_wakes_waiters() {
        let controller = ShutdownController::new();
        let shutdown = controller.subscribe();
        assert!(!shutdown.is_shutdown());

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.wait().await;
            })
        };
        controller.begin();
        waiter.await.unwrap();
        assert!(shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn wait_is_immediate_after_begin() {
        let controller = ShutdownController::new();
        controller.begin();
        let shutdown = controller.subscribe();
        // Must not hang.
        tokio::time::timeout(Duration::from_millis(100), shutdown.wait())
            .await
            .unwrap();
    }
}
