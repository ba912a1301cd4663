//! Monitoring scheduler.
//!
//! Finds documents whose next check is due, records a monitor job row (the
//! store allows one active job per document), and queues the fetch. The
//! dispatch side turns the job into a crawl of the document's source URL;
//! the resulting intake event carries the document id so change detection
//! applies to the right history.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crawler::{CrawlOutcome, Crawler, MonitoringTarget};
use crate::error::{Error, Result};
use crate::model::JobState;
use crate::queue::{JobQueue, Priority, QueueJob};
use crate::runtime::Shutdown;
use crate::store::MetadataStore;

/// Queue job: run one monitoring pass for a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorRequest {
    pub monitor_job_id: Uuid,
    pub document_id: Uuid,
}

impl QueueJob for MonitorRequest {
    fn dedup_key(&self) -> Option<String> {
        Some(self.document_id.to_string())
    }
}

/// Scans for due documents and dispatches monitor passes.
pub struct MonitorScheduler {
    store: Arc<MetadataStore>,
    monitor_queue: Arc<JobQueue<MonitorRequest>>,
}

impl MonitorScheduler {
    pub fn new(store: Arc<MetadataStore>, monitor_queue: Arc<JobQueue<MonitorRequest>>) -> Self {
        Self {
            store,
            monitor_queue,
        }
    }

    /// One scheduling pass: queue a job for every due document. Returns how
    /// many new jobs were scheduled.
    pub fn schedule_due(&self, now: DateTime<Utc>, limit: usize) -> Result<usize> {
        let due = self.store.due_for_monitoring(now, limit)?;
        let mut scheduled = 0;
        for document in due {
            let job = match self.store.schedule_monitor_job(document.id) {
                Ok(job) => job,
                // Already has an active pass.
                Err(Error::Conflict(_)) => continue,
                Err(e) => return Err(e),
            };
            match self.monitor_queue.enqueue(
                MonitorRequest {
                    monitor_job_id: job.id,
                    document_id: document.id,
                },
                Priority::Normal,
            ) {
                Ok(_) => scheduled += 1,
                Err(Error::Backpressure { .. }) => {
                    // Roll the row back so the next pass can retry.
                    self.store.transition_monitor_job(
                        job.id,
                        JobState::Scheduled,
                        JobState::Canceled,
                        Some("backpressure"),
                    )?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(scheduled)
    }

    /// Execute one queued monitoring pass.
    ///
    /// Failures are recorded on the job row rather than propagated: the
    /// document stays due, so the next scheduling pass retries naturally.
    pub async fn dispatch(
        &self,
        crawler: &Crawler,
        request: &MonitorRequest,
        shutdown: &Shutdown,
    ) -> Result<()> {
        match self.store.transition_monitor_job(
            request.monitor_job_id,
            JobState::Scheduled,
            JobState::Running,
            None,
        ) {
            Ok(_) => {}
            // The row moved on without us (redelivered stale job).
            Err(Error::Conflict(_)) => return Ok(()),
            Err(e) => return Err(e),
        }

        let document = self.store.get_document(request.document_id)?;
        let Some(url) = document.source_url.clone() else {
            self.store.transition_monitor_job(
                request.monitor_job_id,
                JobState::Running,
                JobState::Canceled,
                Some("no_source_url"),
            )?;
            return Ok(());
        };

        let target = MonitoringTarget {
            url,
            selector_hints: Vec::new(),
            document_type: document.document_type,
            cadence_seconds: document.monitor_interval_seconds.unwrap_or(86_400),
            owner_id: document.owner_id,
            team_id: document.team_id,
            title: document.title.clone(),
            language: document.language.clone(),
            document_id: Some(document.id),
        };

        match crawler.poll_target(&target, shutdown).await {
            Ok(CrawlOutcome::Emitted { .. }) => {
                self.store.transition_monitor_job(
                    request.monitor_job_id,
                    JobState::Running,
                    JobState::Done,
                    None,
                )?;
            }
            Ok(_) => {
                // Backpressure or backoff: give the slot back; the document
                // stays due.
                self.store.transition_monitor_job(
                    request.monitor_job_id,
                    JobState::Running,
                    JobState::Canceled,
                    Some("deferred"),
                )?;
            }
            Err(Error::Canceled) => {
                self.store.transition_monitor_job(
                    request.monitor_job_id,
                    JobState::Running,
                    JobState::Canceled,
                    Some("canceled"),
                )?;
                return Err(Error::Canceled);
            }
            Err(e) => {
                self.store.transition_monitor_job(
                    request.monitor_job_id,
                    JobState::Running,
                    JobState::Failed,
                    Some(e.kind_label()),
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::events::EventBus;
    use crate::fingerprint;
    use crate::model::DocumentType;
    use crate::store::NewDocument;

    fn setup() -> (Arc<MetadataStore>, MonitorScheduler, Arc<JobQueue<MonitorRequest>>) {
        let store = Arc::new(MetadataStore::open_in_memory().unwrap());
        let queue = Arc::new(JobQueue::new(
            "monitor",
            QueueConfig::default(),
            EventBus::new(16),
        ));
        let scheduler = MonitorScheduler::new(store.clone(), queue.clone());
        (store, scheduler, queue)
    }

    fn add_monitored_doc(store: &MetadataStore, text: &str) -> Uuid {
        let (doc, _) = store
            .upsert_document(NewDocument {
                owner_id: Uuid::new_v4(),
                team_id: None,
                title: "TOS".into(),
                source_url: Some("https://example.com/tos".into()),
                document_type: DocumentType::Tos,
                fingerprint: fingerprint::fingerprint(text),
                content_length: text.len() as u64,
                language: "en".into(),
            })
            .unwrap();
        store
            .enable_monitoring(doc.id, chrono::Duration::seconds(60))
            .unwrap();
        doc.id
    }

    #[test]
    fn due_documents_get_one_job_each() {
        let (store, scheduler, queue) = setup();
        let doc_a = add_monitored_doc(&store, "a");
        let _doc_b = add_monitored_doc(&store, "b");

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(scheduler.schedule_due(later, 10).unwrap(), 2);
        assert_eq!(queue.depth(), 2);

        // A second pass while jobs are still active schedules nothing new.
        assert_eq!(scheduler.schedule_due(later, 10).unwrap(), 0);

        // Completing one frees its slot for the next pass.
        let job = store
            .transition_monitor_job(
                queued_job_for(&queue, doc_a),
                JobState::Scheduled,
                JobState::Running,
                None,
            )
            .unwrap();
        store
            .transition_monitor_job(job.id, JobState::Running, JobState::Done, None)
            .unwrap();
        assert_eq!(scheduler.schedule_due(later, 10).unwrap(), 1);
    }

    fn queued_job_for(queue: &JobQueue<MonitorRequest>, document_id: Uuid) -> Uuid {
        std::iter::from_fn(|| queue.try_dequeue())
            .find(|d| d.job.document_id == document_id)
            .map(|d| d.job.monitor_job_id)
            .expect("queued job")
    }
}
