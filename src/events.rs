//! Outbound event bus.
//!
//! The pipeline publishes lifecycle events for downstream services
//! (notification delivery, dashboards, exports — all out of process).
//! Broadcast semantics: every subscriber sees every event; with no
//! subscribers, publishing is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ChangeKind, Jurisdiction, Severity};

/// Events published to downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlatformEvent {
    AnalysisCompleted {
        analysis_id: Uuid,
        document_id: Uuid,
        overall_risk_score: u32,
        completed_at: DateTime<Utc>,
    },
    DocumentChanged {
        document_id: Uuid,
        version_seq: i64,
        change_kind: ChangeKind,
        detected_at: DateTime<Utc>,
    },
    ComplianceAlertOpened {
        alert_id: Uuid,
        document_id: Uuid,
        jurisdiction: Jurisdiction,
        severity: Severity,
        opened_at: DateTime<Utc>,
    },
    DeadLetter {
        queue: String,
        job_id: Uuid,
        last_error_kind: String,
        attempts: u32,
    },
    /// A monitoring target exceeded its consecutive-failure budget.
    TargetQuarantined {
        url: String,
        failures: u32,
        at: DateTime<Utc>,
    },
}

/// Cloneable broadcast bus.
#[derive(Clone)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<PlatformEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: PlatformEvent) {
        // No subscribers is fine; slow subscribers lag and lose the oldest.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PlatformEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
