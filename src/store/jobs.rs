//! Monitor job rows.

use chrono::Utc;
use rusqlite::{named_params, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{JobState, MonitorJob};

use super::{is_unique_violation, parse_opt_ts, parse_ts, parse_uuid, ts, MetadataStore};

const JOB_COLS: &str =
    "id, document_id, scheduled_at, dispatched_at, completed_at, state, attempt, last_error_kind";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        document_id: row.get(1)?,
        scheduled_at: row.get(2)?,
        dispatched_at: row.get(3)?,
        completed_at: row.get(4)?,
        state: row.get(5)?,
        attempt: row.get(6)?,
        last_error_kind: row.get(7)?,
    })
}

struct RawJob {
    id: String,
    document_id: String,
    scheduled_at: String,
    dispatched_at: Option<String>,
    completed_at: Option<String>,
    state: String,
    attempt: i64,
    last_error_kind: Option<String>,
}

impl RawJob {
    fn into_job(self) -> Result<MonitorJob> {
        Ok(MonitorJob {
            id: parse_uuid(&self.id)?,
            document_id: parse_uuid(&self.document_id)?,
            scheduled_at: parse_ts(&self.scheduled_at)?,
            dispatched_at: parse_opt_ts(self.dispatched_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            state: JobState::parse(&self.state)
                .ok_or_else(|| Error::Storage(format!("bad job state {:?}", self.state)))?,
            attempt: self.attempt as u32,
            last_error_kind: self.last_error_kind,
        })
    }
}

impl MetadataStore {
    /// Schedule a monitor pass. The partial unique index keeps at most one
    /// scheduled-or-running job per document; a duplicate is a `Conflict`
    /// the scheduler simply skips.
    pub fn schedule_monitor_job(&self, document_id: Uuid) -> Result<MonitorJob> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let inserted = self.conn().execute(
            "INSERT INTO monitor_jobs (id, document_id, scheduled_at, state) \
             VALUES (:id, :doc, :at, 'scheduled')",
            named_params! {
                ":id": id.to_string(),
                ":doc": document_id.to_string(),
                ":at": ts(now),
            },
        );
        match inserted {
            Ok(_) => self.get_monitor_job(id),
            Err(e) if is_unique_violation(&e) => Err(Error::Conflict(format!(
                "document {document_id} already has an active monitor job"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_monitor_job(&self, id: Uuid) -> Result<MonitorJob> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {JOB_COLS} FROM monitor_jobs WHERE id = :id"))?;
        let raw = stmt
            .query_row(named_params! { ":id": id.to_string() }, job_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("monitor job {id}")),
                other => other.into(),
            })?;
        raw.into_job()
    }

    /// Conditional state change, mirroring the analysis transitions.
    pub fn transition_monitor_job(
        &self,
        id: Uuid,
        from: JobState,
        to: JobState,
        error_kind: Option<&str>,
    ) -> Result<MonitorJob> {
        let now = Utc::now();
        let dispatched = (to == JobState::Running).then(|| ts(now));
        let completed =
            matches!(to, JobState::Done | JobState::Failed | JobState::Canceled).then(|| ts(now));

        let changed = self.conn().execute(
            "UPDATE monitor_jobs SET state = :to, \
             dispatched_at = COALESCE(:dispatched, dispatched_at), \
             completed_at = COALESCE(:completed, completed_at), \
             attempt = attempt + CASE WHEN :to = 'running' THEN 1 ELSE 0 END, \
             last_error_kind = COALESCE(:error, last_error_kind) \
             WHERE id = :id AND state = :from",
            named_params! {
                ":to": to.as_str(),
                ":dispatched": dispatched,
                ":completed": completed,
                ":error": error_kind,
                ":id": id.to_string(),
                ":from": from.as_str(),
            },
        )?;
        if changed == 0 {
            return Err(Error::Conflict(format!(
                "monitor job {id} is not in state {}",
                from.as_str()
            )));
        }
        self.get_monitor_job(id)
    }
}
