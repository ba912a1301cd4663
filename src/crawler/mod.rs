//! Crawling of monitoring targets.
//!
//! A target is one URL being watched for a legal document. Polling a target
//! goes through the per-host rate limiter, fetches with the configured
//! bounds, narrows HTML to the hinted region, and emits an [`IntakeEvent`].
//!
//! Failure handling per target: transient errors back off exponentially
//! (base 2 s, ±25% jitter, capped) and count toward the consecutive-failure
//! budget; fatal client errors and an exhausted budget quarantine the
//! target, which then requires operator intervention to resume.

pub mod extract;
pub mod fetch;

pub use fetch::{build_client, fetch_bounded, FetchedBody};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{CrawlerConfig, HttpConfig};
use crate::error::{Error, ErrorClass, Result};
use crate::events::{EventBus, PlatformEvent};
use crate::model::DocumentType;
use crate::pipeline::IntakeEvent;
use crate::queue::{JobQueue, Priority};
use crate::ratelimit::HostLimiter;
use crate::runtime::Shutdown;

/// Retry backoff base for transient target failures.
const BACKOFF_BASE_SECS: f64 = 2.0;

/// One URL under monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringTarget {
    pub url: String,
    /// CSS-ish hints (`#id`, `.class`, tag) naming the legal-text region.
    #[serde(default)]
    pub selector_hints: Vec<String>,
    pub document_type: DocumentType,
    pub cadence_seconds: u64,
    pub owner_id: Uuid,
    #[serde(default)]
    pub team_id: Option<Uuid>,
    pub title: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Present when the target maps to an already-known document.
    #[serde(default)]
    pub document_id: Option<Uuid>,
}

fn default_language() -> String {
    "en".to_string()
}

/// What one polling pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// An intake event was enqueued.
    Emitted { request_id: Uuid },
    /// Target is backing off after failures.
    SkippedBackoff,
    /// Target is quarantined.
    SkippedQuarantined,
    /// Intake queue is above its soft limit; polling pauses.
    PausedBackpressure,
}

#[derive(Debug, Default)]
struct TargetState {
    consecutive_failures: u32,
    quarantined: bool,
    not_before: Option<Instant>,
}

/// Fetches monitoring targets and feeds the intake queue.
pub struct Crawler {
    client: reqwest::Client,
    limiter: Arc<HostLimiter>,
    intake_queue: Arc<JobQueue<IntakeEvent>>,
    events: EventBus,
    cfg: CrawlerConfig,
    http_cfg: HttpConfig,
    states: DashMap<String, TargetState>,
}

impl Crawler {
    pub fn new(
        limiter: Arc<HostLimiter>,
        intake_queue: Arc<JobQueue<IntakeEvent>>,
        events: EventBus,
        cfg: CrawlerConfig,
        http_cfg: HttpConfig,
    ) -> Result<Self> {
        let client = build_client(&cfg.user_agent, Duration::from_millis(http_cfg.timeout_ms))?;
        Ok(Self {
            client,
            limiter,
            intake_queue,
            events,
            cfg,
            http_cfg,
            states: DashMap::new(),
        })
    }

    /// Poll one target once.
    pub async fn poll_target(
        &self,
        target: &MonitoringTarget,
        shutdown: &Shutdown,
    ) -> Result<CrawlOutcome> {
        if self.intake_queue.is_soft_limited() {
            return Ok(CrawlOutcome::PausedBackpressure);
        }
        match self.target_disposition(&target.url) {
            Disposition::Quarantined => return Ok(CrawlOutcome::SkippedQuarantined),
            Disposition::BackingOff => return Ok(CrawlOutcome::SkippedBackoff),
            Disposition::Ready => {}
        }

        let host = host_of(&target.url)?;
        let _lease = self.limiter.acquire(&host, shutdown).await?;

        match fetch_bounded(&self.client, &target.url, self.http_cfg.max_body_bytes).await {
            Ok(body) => {
                let request_id = self.emit(target, body)?;
                self.record_success(&target.url);
                Ok(CrawlOutcome::Emitted { request_id })
            }
            Err(e) => {
                self.record_failure(target, &e);
                Err(e)
            }
        }
    }

    fn emit(&self, target: &MonitoringTarget, body: FetchedBody) -> Result<Uuid> {
        let is_html = body
            .content_type
            .as_deref()
            .map(|ct| ct.contains("html"))
            .unwrap_or(false);

        let raw_bytes = if is_html && !target.selector_hints.is_empty() {
            let html = String::from_utf8_lossy(&body.bytes);
            extract::extract_with_hints(&html, &target.selector_hints).into_bytes()
        } else {
            body.bytes
        };

        let request_id = Uuid::new_v4();
        self.intake_queue.enqueue(
            IntakeEvent {
                request_id,
                owner_id: target.owner_id,
                team_id: target.team_id,
                document_id: target.document_id,
                title: target.title.clone(),
                url: Some(target.url.clone()),
                document_type: target.document_type,
                language: target.language.clone(),
                fetched_at: Utc::now(),
                content_type: body.content_type,
                raw_bytes,
            },
            Priority::Normal,
        )?;
        Ok(request_id)
    }

    // ── Target failure budget ───────────────────────────────────────

    fn target_disposition(&self, url: &str) -> Disposition {
        match self.states.get(url) {
            None => Disposition::Ready,
            Some(state) => {
                if state.quarantined {
                    Disposition::Quarantined
                } else if state.not_before.map(|t| t > Instant::now()).unwrap_or(false) {
                    Disposition::BackingOff
                } else {
                    Disposition::Ready
                }
            }
        }
    }

    fn record_success(&self, url: &str) {
        if let Some(mut state) = self.states.get_mut(url) {
            state.consecutive_failures = 0;
            state.not_before = None;
        }
    }

    fn record_failure(&self, target: &MonitoringTarget, error: &Error) {
        let mut state = self.states.entry(target.url.clone()).or_default();
        state.consecutive_failures += 1;
        let failures = state.consecutive_failures;

        let fatal = error.class() == ErrorClass::Fatal;
        if fatal || failures >= self.cfg.max_consecutive_failures {
            state.quarantined = true;
            drop(state);
            log::warn!(
                "target {} quarantined after {failures} failures ({})",
                target.url,
                error.kind_label()
            );
            self.events.publish(PlatformEvent::TargetQuarantined {
                url: target.url.clone(),
                failures,
                at: Utc::now(),
            });
            return;
        }

        let delay = match error {
            Error::RateLimited {
                retry_after: Some(after),
            } if self.cfg.respect_retry_after => *after,
            _ => backoff_delay(failures, self.cfg.backoff_cap_seconds),
        };
        state.not_before = Some(Instant::now() + delay);
        log::debug!(
            "target {} failure {failures} ({}); next attempt in {:?}",
            target.url,
            error.kind_label(),
            delay
        );
    }

    /// Clear a quarantined target so polling resumes.
    pub fn release_quarantine(&self, url: &str) {
        if let Some(mut state) = self.states.get_mut(url) {
            state.quarantined = false;
            state.consecutive_failures = 0;
            state.not_before = None;
        }
    }

    pub fn is_quarantined(&self, url: &str) -> bool {
        self.states
            .get(url)
            .map(|s| s.quarantined)
            .unwrap_or(false)
    }
}

enum Disposition {
    Ready,
    BackingOff,
    Quarantined,
}

/// Exponential backoff, base 2 s, ±25% jitter, capped.
fn backoff_delay(failures: u32, cap_seconds: u64) -> Duration {
    let exp = BACKOFF_BASE_SECS * 2f64.powi(failures.saturating_sub(1).min(24) as i32);
    let capped = exp.min(cap_seconds as f64);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(capped * jitter)
}

/// Host component of a target URL, for the rate limiter.
fn host_of(url: &str) -> Result<String> {
    let without_scheme = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| Error::Internal(format!("target url {url:?} has no scheme")))?;
    let host = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_scheme)
        .split('@')
        .last()
        .unwrap_or_default();
    if host.is_empty() {
        return Err(Error::Internal(format!("target url {url:?} has no host")));
    }
    Ok(host.to_string())
}
