//! Append-only audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One audit fact. Rows are never updated or deleted; the only mutation the
/// store permits is the GDPR anonymization pass, which clears the PII fields
/// and sets `anonymized` while keeping the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    /// Acting user, if any. Cleared by anonymization.
    pub actor: Option<Uuid>,
    /// Dotted action name, e.g. `intake.no_change` or `analysis.completed`.
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub correlation_id: Option<Uuid>,
    pub anonymized: bool,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: None,
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            before: None,
            after: None,
            correlation_id: None,
            anonymized: false,
            at: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor: Uuid) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_after(mut self, after: serde_json::Value) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_before(mut self, before: serde_json::Value) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }
}
