//! Scheduled monitor jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a scheduled re-check of a monitored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(JobState::Scheduled),
            "running" => Some(JobState::Running),
            "done" => Some(JobState::Done),
            "failed" => Some(JobState::Failed),
            "canceled" => Some(JobState::Canceled),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Scheduled | JobState::Running)
    }
}

/// One scheduled monitoring pass over a document.
///
/// The store enforces at most one active (scheduled or running) job per
/// document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorJob {
    pub id: Uuid,
    pub document_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub state: JobState,
    pub attempt: u32,
    pub last_error_kind: Option<String>,
}
