//! Runtime configuration.
//!
//! Plain serde structs with working defaults. A config file (YAML) can
//! override the defaults, and `FINEPRINT_*` environment variables override
//! the file, so a bare `Config::default()` is always runnable (in-memory
//! store, no network services).

use serde::{Deserialize, Serialize};

use crate::fingerprint::DEFAULT_MAX_BYTES;

fn default_true() -> bool {
    true
}

/// Top-level configuration for the pipeline runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub worker_pools: WorkerPools,
    pub queue: QueueSettings,
    pub rate_limit: RateLimitConfig,
    pub http: HttpConfig,
    pub normalize: NormalizeConfig,
    pub analysis: AnalysisConfig,
    pub vector: VectorConfig,
    pub llm: LlmConfig,
    pub cache: CacheConfig,
    pub crawler: CrawlerConfig,
    pub audit: AuditConfig,
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Parse a YAML config document.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Apply `FINEPRINT_*` environment overrides on top of `self`.
    ///
    /// Only the operationally interesting knobs are env-addressable; the
    /// full surface lives in the YAML file.
    pub fn apply_env(mut self) -> Self {
        if let Some(v) = env_usize("FINEPRINT_ANALYZER_POOL_SIZE") {
            self.worker_pools.analyzer = v;
        }
        if let Some(v) = env_usize("FINEPRINT_CRAWLER_POOL_SIZE") {
            self.worker_pools.crawler = v;
        }
        if let Some(v) = env_usize("FINEPRINT_INTAKE_POOL_SIZE") {
            self.worker_pools.intake = v;
        }
        if let Some(v) = env_u64("FINEPRINT_HTTP_TIMEOUT_MS") {
            self.http.timeout_ms = v;
        }
        if let Some(v) = env_usize("FINEPRINT_HTTP_MAX_BODY_BYTES") {
            self.http.max_body_bytes = v;
        }
        if let Some(v) = env_usize("FINEPRINT_NORMALIZE_MAX_BYTES") {
            self.normalize.max_bytes = v;
        }
        if let Some(v) = env_u64("FINEPRINT_LLM_TIMEOUT_MS") {
            self.llm.timeout_ms = v;
        }
        if let Some(v) = std::env::var("FINEPRINT_LLM_ENDPOINT").ok().filter(|s| !s.is_empty()) {
            self.llm.endpoint = Some(v);
        }
        if let Some(v) = std::env::var("FINEPRINT_VECTOR_ENDPOINT").ok().filter(|s| !s.is_empty()) {
            self.vector.endpoint = Some(v);
        }
        if let Some(v) = env_u64("FINEPRINT_ANALYSIS_RETENTION_DAYS") {
            self.analysis.retention_days = v;
        }
        self
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Worker pool sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPools {
    pub crawler: usize,
    pub intake: usize,
    pub analyzer: usize,
    pub monitor: usize,
    pub compliance: usize,
}

impl Default for WorkerPools {
    fn default() -> Self {
        Self {
            crawler: 32,
            intake: 16,
            analyzer: 8,
            monitor: 2,
            compliance: 4,
        }
    }
}

/// Per-queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub visibility_seconds: u64,
    pub soft_limit: usize,
    pub hard_limit: usize,
    /// Exponential retry base, in milliseconds.
    pub retry_base_ms: u64,
    /// Retry backoff cap, in milliseconds.
    pub retry_cap_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            visibility_seconds: 120,
            soft_limit: 1_000,
            hard_limit: 5_000,
            retry_base_ms: 2_000,
            retry_cap_ms: 15 * 60 * 1_000,
        }
    }
}

/// The four job queues.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub intake: QueueConfig,
    pub analysis: QueueConfig,
    pub monitor: QueueConfig,
    pub compliance: QueueConfig,
}

/// Outbound fetch rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained tokens per second per host.
    pub per_host_rate: f64,
    /// Bucket capacity per host.
    pub per_host_burst: u32,
    /// Global in-flight cap across all hosts.
    pub global_in_flight: usize,
    /// Evict a host bucket after this long with no leases.
    pub idle_eviction_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_host_rate: 1.0,
            per_host_burst: 5,
            global_in_flight: 64,
            idle_eviction_seconds: 600,
        }
    }
}

/// HTTP fetch bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_ms: u64,
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Normalization bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    pub max_bytes: usize,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// Analysis retention and clause windowing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub retention_days: u64,
    /// Clause embedding window, in characters.
    pub clause_window_chars: usize,
    /// Overlap between consecutive clause windows, in characters.
    pub clause_overlap_chars: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            clause_window_chars: 2_000,
            clause_overlap_chars: 200,
        }
    }
}

/// Vector index tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    /// REST endpoint of the external index; `None` selects the in-memory one.
    pub endpoint: Option<String>,
    /// Minimum similarity for semantic pattern matches.
    pub pattern_score_threshold: f32,
    /// Candidates fetched per semantic query.
    pub pattern_top_k: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            pattern_score_threshold: 0.8,
            pattern_top_k: 20,
        }
    }
}

/// LLM call configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: Option<String>,
    pub model_id: String,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model_id: "fineprint-analyst-1".to_string(),
            max_tokens: 2_048,
            timeout_ms: 90_000,
        }
    }
}

/// Cache TTLs, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub session_ttl: u64,
    pub doc_meta_ttl: u64,
    pub analysis_ttl: u64,
    pub pattern_lib_ttl: u64,
    pub dedup_lock_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            session_ttl: 3_600,
            doc_meta_ttl: 3_600,
            analysis_ttl: 86_400,
            pattern_lib_ttl: 86_400,
            dedup_lock_ttl: 600,
        }
    }
}

/// Crawler behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub user_agent: String,
    pub max_consecutive_failures: u32,
    /// Exponential backoff cap for retryable fetch errors, in seconds.
    pub backoff_cap_seconds: u64,
    #[serde(default = "default_true")]
    pub respect_retry_after: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: "FinePrintMonitor/1.0 (+https://fineprint.example/bot)".to_string(),
            max_consecutive_failures: 5,
            backoff_cap_seconds: 3_600,
            respect_retry_after: true,
        }
    }
}

/// Audit retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub retention_days: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { retention_days: 365 }
    }
}

/// Runtime-wide knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub graceful_shutdown_seconds: u64,
    /// Path of the SQLite database; `None` keeps everything in memory.
    pub database_path: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            graceful_shutdown_seconds: 30,
            database_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.worker_pools.analyzer, 8);
        assert_eq!(cfg.queue.analysis.max_attempts, 8);
        assert_eq!(cfg.analysis.retention_days, 90);
        assert_eq!(cfg.vector.pattern_score_threshold, 0.8);
        assert_eq!(cfg.llm.timeout_ms, 90_000);
        assert_eq!(cfg.audit.retention_days, 365);
        assert_eq!(cfg.crawler.max_consecutive_failures, 5);
    }

    #[test]
    fn yaml_overrides_only_what_it_names() {
        let cfg = Config::from_yaml(
            "worker_pools:\n  analyzer: 2\nllm:\n  model_id: test-model\n",
        )
        .unwrap();
        assert_eq!(cfg.worker_pools.analyzer, 2);
        assert_eq!(cfg.worker_pools.crawler, 32);
        assert_eq!(cfg.llm.model_id, "test-model");
        assert_eq!(cfg.llm.timeout_ms, 90_000);
    }
}
