//! Bounded priority job queues.
//!
//! At-least-once delivery with visibility leases: a dequeued job must be
//! acked before its lease expires or the maintenance tick redelivers it with
//! `attempt + 1`. Jobs that exhaust `max_attempts` land in the dead-letter
//! partition and emit a `dead_letter` event. FIFO within each priority band.
//!
//! A dedup index absorbs re-submissions whose key is already scheduled or
//! running; the analysis queue keys by `(document_id, fingerprint)` so the
//! same snapshot is never analyzed twice concurrently.
//!
//! Backpressure: past `soft_limit` the queue reports itself soft-limited
//! (the crawler pauses polling); past `hard_limit` enqueues fail.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, PlatformEvent};
use crate::runtime::Shutdown;

/// Priority class, selected at enqueue time and fixed thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Outcome of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job with the same dedup key is already scheduled or running; the
    /// submission was absorbed.
    Absorbed,
}

/// Work item carried by a queue.
pub trait QueueJob: Clone + Send + Sync + 'static {
    /// Key for at-most-one-scheduled-or-running deduplication. `None`
    /// disables dedup for this job.
    fn dedup_key(&self) -> Option<String> {
        None
    }
}

struct QueuedJob<T> {
    id: Uuid,
    job: T,
    priority: Priority,
    attempt: u32,
    dedup_key: Option<String>,
}

struct InFlight<T> {
    queued: QueuedJob<T>,
    lease_deadline: Instant,
}

struct Delayed<T> {
    queued: QueuedJob<T>,
    ready_at: Instant,
}

/// A dead-lettered job with its failure context.
pub struct DeadJob<T> {
    pub job_id: Uuid,
    pub job: T,
    pub attempts: u32,
    pub last_error_kind: String,
}

/// A delivered job. Must be acked or nacked before the visibility lease
/// runs out, otherwise the maintenance tick redelivers it.
pub struct Delivery<T> {
    pub job: T,
    pub attempt: u32,
    receipt: Uuid,
}

impl<T> Delivery<T> {
    pub fn receipt(&self) -> Uuid {
        self.receipt
    }
}

/// One bounded priority queue.
pub struct JobQueue<T: QueueJob> {
    name: &'static str,
    cfg: QueueConfig,
    bands: Mutex<[VecDeque<QueuedJob<T>>; 3]>,
    delayed: Mutex<Vec<Delayed<T>>>,
    in_flight: DashMap<Uuid, InFlight<T>>,
    dedup: DashMap<String, Uuid>,
    dead: Mutex<Vec<DeadJob<T>>>,
    notify: Notify,
    events: EventBus,
}

impl<T: QueueJob> JobQueue<T> {
    pub fn new(name: &'static str, cfg: QueueConfig, events: EventBus) -> Self {
        Self {
            name,
            cfg,
            bands: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            delayed: Mutex::new(Vec::new()),
            in_flight: DashMap::new(),
            dedup: DashMap::new(),
            dead: Mutex::new(Vec::new()),
            notify: Notify::new(),
            events,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Jobs waiting to run (ready + delayed), excluding in-flight ones.
    pub fn depth(&self) -> usize {
        let bands = self.bands.lock();
        let ready: usize = bands.iter().map(VecDeque::len).sum();
        ready + self.delayed.lock().len()
    }

    /// Above the soft limit: producers should pause, enqueues still succeed.
    pub fn is_soft_limited(&self) -> bool {
        self.depth() > self.cfg.soft_limit
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead.lock().len()
    }

    /// Drain the dead-letter partition.
    pub fn take_dead_letters(&self) -> Vec<DeadJob<T>> {
        std::mem::take(&mut *self.dead.lock())
    }

    /// Submit a job. Fails with `Backpressure` past the hard limit; returns
    /// `Absorbed` when the dedup key is already scheduled or running.
    pub fn enqueue(&self, job: T, priority: Priority) -> Result<EnqueueOutcome> {
        let depth = self.depth();
        if depth >= self.cfg.hard_limit {
            return Err(Error::Backpressure {
                queue: self.name,
                depth,
            });
        }

        let id = Uuid::new_v4();
        let dedup_key = job.dedup_key();
        if let Some(key) = &dedup_key {
            let entry = self.dedup.entry(key.clone());
            match entry {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    log::debug!("queue {}: absorbed duplicate {}", self.name, key);
                    return Ok(EnqueueOutcome::Absorbed);
                }
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(id);
                }
            }
        }

        self.bands.lock()[priority.index()].push_back(QueuedJob {
            id,
            job,
            priority,
            attempt: 0,
            dedup_key,
        });
        self.notify.notify_one();
        Ok(EnqueueOutcome::Enqueued)
    }

    /// Take the next ready job, waiting until one is available. Returns
    /// `None` once the shutdown signal fires.
    pub async fn dequeue(&self, shutdown: &Shutdown) -> Option<Delivery<T>> {
        loop {
            if let Some(delivery) = self.try_dequeue() {
                return Some(delivery);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                _ = shutdown.wait() => return None,
            }
        }
    }

    /// Non-blocking dequeue.
    pub fn try_dequeue(&self) -> Option<Delivery<T>> {
        let queued = {
            let mut bands = self.bands.lock();
            bands.iter_mut().find_map(VecDeque::pop_front)?
        };

        let receipt = Uuid::new_v4();
        let delivery = Delivery {
            job: queued.job.clone(),
            attempt: queued.attempt,
            receipt,
        };
        self.in_flight.insert(
            receipt,
            InFlight {
                queued,
                lease_deadline: Instant::now()
                    + Duration::from_secs(self.cfg.visibility_seconds),
            },
        );
        Some(delivery)
    }

    /// Successful completion: the job and its dedup claim are released.
    pub fn ack(&self, receipt: Uuid) {
        if let Some((_, inflight)) = self.in_flight.remove(&receipt) {
            self.release_dedup(&inflight.queued);
        }
    }

    /// Failed execution. Retryable failures go back through the retry
    /// schedule; fatal ones (or exhausted retries) dead-letter immediately.
    pub fn nack(&self, receipt: Uuid, error_kind: &str, retryable: bool) {
        let Some((_, inflight)) = self.in_flight.remove(&receipt) else {
            return;
        };
        let mut queued = inflight.queued;
        queued.attempt += 1;

        if !retryable || queued.attempt >= self.cfg.max_attempts {
            self.dead_letter(queued, error_kind);
            return;
        }

        let delay = self.retry_delay(queued.attempt);
        self.delayed.lock().push(Delayed {
            ready_at: Instant::now() + delay,
            queued,
        });
    }

    /// Exponential backoff with ±25% jitter, capped.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.cfg.retry_base_ms as f64;
        let exp = base * 2f64.powi(attempt.saturating_sub(1).min(20) as i32);
        let capped = exp.min(self.cfg.retry_cap_ms as f64);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((capped * jitter) as u64)
    }

    fn dead_letter(&self, queued: QueuedJob<T>, error_kind: &str) {
        log::warn!(
            "queue {}: dead-lettering job {} after {} attempts ({})",
            self.name,
            queued.id,
            queued.attempt,
            error_kind
        );
        self.events.publish(PlatformEvent::DeadLetter {
            queue: self.name.to_string(),
            job_id: queued.id,
            last_error_kind: error_kind.to_string(),
            attempts: queued.attempt,
        });
        self.release_dedup(&queued);
        self.dead.lock().push(DeadJob {
            job_id: queued.id,
            job: queued.job,
            attempts: queued.attempt,
            last_error_kind: error_kind.to_string(),
        });
    }

    fn release_dedup(&self, queued: &QueuedJob<T>) {
        if let Some(key) = &queued.dedup_key {
            self.dedup.remove_if(key, |_, owner| *owner == queued.id);
        }
    }

    /// Maintenance tick: requeue ripe delayed jobs and redeliver expired
    /// leases. Called periodically by the runtime.
    pub fn tick(&self) {
        let now = Instant::now();

        // Ripe retries back into their band.
        {
            let mut delayed = self.delayed.lock();
            let mut bands = self.bands.lock();
            let mut i = 0;
            while i < delayed.len() {
                if delayed[i].ready_at <= now {
                    let entry = delayed.swap_remove(i);
                    bands[entry.queued.priority.index()].push_back(entry.queued);
                    self.notify.notify_one();
                } else {
                    i += 1;
                }
            }
        }

        // Expired leases: the worker died or stalled; redeliver.
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|e| e.value().lease_deadline <= now)
            .map(|e| *e.key())
            .collect();
        for receipt in expired {
            let Some((_, inflight)) = self.in_flight.remove(&receipt) else {
                continue;
            };
            let mut queued = inflight.queued;
            queued.attempt += 1;
            if queued.attempt >= self.cfg.max_attempts {
                self.dead_letter(queued, "visibility_timeout");
            } else {
                log::warn!(
                    "queue {}: lease expired for job {}, redelivering (attempt {})",
                    self.name,
                    queued.id,
                    queued.attempt
                );
                self.bands.lock()[queued.priority.index()].push_back(queued);
                self.notify.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct TestJob {
        label: String,
        key: Option<String>,
    }

    impl QueueJob for TestJob {
        fn dedup_key(&self) -> Option<String> {
            self.key.clone()
        }
    }

    fn job(label: &str) -> TestJob {
        TestJob {
            label: label.into(),
            key: None,
        }
    }

    fn keyed(label: &str, key: &str) -> TestJob {
        TestJob {
            label: label.into(),
            key: Some(key.into()),
        }
    }

    fn queue(cfg: QueueConfig) -> JobQueue<TestJob> {
        JobQueue::new("test", cfg, EventBus::new(16))
    }

    #[tokio::test]
    async fn priority_bands_drain_high_first_fifo_within() {
        let q = queue(QueueConfig::default());
        q.enqueue(job("n1"), Priority::Normal).unwrap();
        q.enqueue(job("l1"), Priority::Low).unwrap();
        q.enqueue(job("h1"), Priority::High).unwrap();
        q.enqueue(job("h2"), Priority::High).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| {
            q.try_dequeue().map(|d| {
                q.ack(d.receipt());
                d.job.label
            })
        })
        .collect();
        assert_eq!(order, ["h1", "h2", "n1", "l1"]);
    }

    #[tokio::test]
    async fn dedup_absorbs_while_scheduled_or_running() {
        let q = queue(QueueConfig::default());
        assert_eq!(
            q.enqueue(keyed("a", "doc:fp"), Priority::Normal).unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            q.enqueue(keyed("b", "doc:fp"), Priority::Normal).unwrap(),
            EnqueueOutcome::Absorbed
        );

        let delivery = q.try_dequeue().unwrap();
        // Still running: submissions keep being absorbed.
        assert_eq!(
            q.enqueue(keyed("c", "doc:fp"), Priority::Normal).unwrap(),
            EnqueueOutcome::Absorbed
        );

        q.ack(delivery.receipt());
        assert_eq!(
            q.enqueue(keyed("d", "doc:fp"), Priority::Normal).unwrap(),
            EnqueueOutcome::Enqueued
        );
    }

    #[tokio::test]
    async fn hard_limit_rejects_soft_limit_only_reports() {
        let cfg = QueueConfig {
            soft_limit: 2,
            hard_limit: 4,
            ..QueueConfig::default()
        };
        let q = queue(cfg);

        q.enqueue(job("1"), Priority::Normal).unwrap();
        q.enqueue(job("2"), Priority::Normal).unwrap();
        assert!(!q.is_soft_limited());

        q.enqueue(job("3"), Priority::Normal).unwrap();
        assert!(q.is_soft_limited());
        q.enqueue(job("4"), Priority::Normal).unwrap();

        let err = q.enqueue(job("5"), Priority::Normal).unwrap_err();
        assert!(matches!(err, Error::Backpressure { depth: 4, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_redelivers_with_incremented_attempt() {
        let cfg = QueueConfig {
            visibility_seconds: 10,
            ..QueueConfig::default()
        };
        let q = queue(cfg);
        q.enqueue(job("slow"), Priority::Normal).unwrap();

        let first = q.try_dequeue().unwrap();
        assert_eq!(first.attempt, 0);
        // Worker never acks.
        tokio::time::sleep(Duration::from_secs(11)).await;
        q.tick();

        let second = q.try_dequeue().unwrap();
        assert_eq!(second.attempt, 1);
        assert_eq!(second.job.label, "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_nack_requeues_after_backoff() {
        let cfg = QueueConfig {
            retry_base_ms: 1_000,
            ..QueueConfig::default()
        };
        let q = queue(cfg);
        q.enqueue(job("flaky"), Priority::Normal).unwrap();

        let d = q.try_dequeue().unwrap();
        q.nack(d.receipt(), "llm_timeout", true);

        q.tick();
        assert!(q.try_dequeue().is_none(), "job must wait out its backoff");

        // Max backoff for attempt 1 is base * 1.25.
        tokio::time::sleep(Duration::from_millis(1_300)).await;
        q.tick();
        let retried = q.try_dequeue().unwrap();
        assert_eq!(retried.attempt, 1);
    }

    #[tokio::test]
    async fn fatal_nack_dead_letters_and_emits() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let q = JobQueue::new("analysis", QueueConfig::default(), events);

        q.enqueue(keyed("bad", "doc:fp"), Priority::Normal).unwrap();
        let d = q.try_dequeue().unwrap();
        q.nack(d.receipt(), "llm_refused", false);

        assert_eq!(q.dead_letter_count(), 1);
        let dead = q.take_dead_letters();
        assert_eq!(dead[0].last_error_kind, "llm_refused");
        assert_eq!(dead[0].attempts, 1);

        match rx.try_recv().unwrap() {
            PlatformEvent::DeadLetter { queue, last_error_kind, .. } => {
                assert_eq!(queue, "analysis");
                assert_eq!(last_error_kind, "llm_refused");
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Dedup claim was released with the dead letter.
        assert_eq!(
            q.enqueue(keyed("again", "doc:fp"), Priority::Normal).unwrap(),
            EnqueueOutcome::Enqueued
        );
    }

    #[tokio::test]
    async fn attempts_exhaustion_dead_letters() {
        let cfg = QueueConfig {
            max_attempts: 2,
            retry_base_ms: 1,
            ..QueueConfig::default()
        };
        let q = queue(cfg);
        q.enqueue(job("doomed"), Priority::Normal).unwrap();

        let d = q.try_dequeue().unwrap();
        q.nack(d.receipt(), "llm_timeout", true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.tick();

        let d = q.try_dequeue().unwrap();
        assert_eq!(d.attempt, 1);
        q.nack(d.receipt(), "llm_timeout", true);

        assert_eq!(q.dead_letter_count(), 1);
        assert!(q.try_dequeue().is_none());
    }
}
