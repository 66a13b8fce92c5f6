//! Upload queue persistence.
//!
//! A completed session gets exactly one queue row. The row moves
//! PENDING -> IN_FLIGHT -> COMPLETED, or back to PENDING with a later
//! `next_attempt_at` on a transient failure, or to FAILED_TERMINAL once the
//! attempt budget is exhausted or the server rejects the payload outright.
//! Terminal rows are never deleted automatically; the operator surface
//! lists and requeues them.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{SessionDb, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    InFlight,
    Completed,
    FailedTerminal,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "PENDING",
            UploadStatus::InFlight => "IN_FLIGHT",
            UploadStatus::Completed => "COMPLETED",
            UploadStatus::FailedTerminal => "FAILED_TERMINAL",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        Ok(match s {
            "PENDING" => UploadStatus::Pending,
            "IN_FLIGHT" => UploadStatus::InFlight,
            "COMPLETED" => UploadStatus::Completed,
            "FAILED_TERMINAL" => UploadStatus::FailedTerminal,
            other => {
                return Err(StoreError::Internal(format!(
                    "unknown upload status: {other}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub session_id: String,
    pub status: UploadStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: i64,
}

impl SessionDb {
    /// Add a completed session to the queue. Idempotent: re-enqueueing an
    /// already-queued session is a no-op.
    pub fn enqueue_upload(&self, session_id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO upload_queue (session_id, status, created_at)
                 VALUES (?1, 'PENDING', ?2)
                 ON CONFLICT(session_id) DO NOTHING",
                params![session_id, Utc::now().timestamp()],
            )?;
            Ok(())
        })
    }

    /// Pending rows whose retry time has arrived, oldest first.
    pub fn due_uploads(&self, now: i64) -> Result<Vec<UploadRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, status, attempts, last_error, next_attempt_at
                 FROM upload_queue
                 WHERE status = 'PENDING' AND next_attempt_at <= ?1
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map([now], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn upload_record(&self, session_id: &str) -> Result<Option<UploadRecord>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT session_id, status, attempts, last_error, next_attempt_at
                     FROM upload_queue WHERE session_id = ?1",
                    [session_id],
                    row_to_record,
                )
                .optional()?)
        })
    }

    pub fn mark_upload_in_flight(&self, session_id: &str) -> Result<(), StoreError> {
        self.set_upload_status(session_id, "IN_FLIGHT", None, None, None)
    }

    /// COMPLETED is reached at most once; a duplicate-success response from
    /// the server lands here exactly like a fresh success.
    pub fn mark_upload_completed(&self, session_id: &str) -> Result<(), StoreError> {
        self.set_upload_status(session_id, "COMPLETED", None, None, None)
    }

    /// Transient failure: schedule the next attempt.
    pub fn mark_upload_retry(
        &self,
        session_id: &str,
        attempts: u32,
        error: &str,
        next_attempt_at: i64,
    ) -> Result<(), StoreError> {
        self.set_upload_status(
            session_id,
            "PENDING",
            Some(attempts),
            Some(error),
            Some(next_attempt_at),
        )
    }

    /// Attempt budget exhausted or non-retryable rejection: surfaced to the
    /// operator, never silently dropped.
    pub fn mark_upload_terminal(
        &self,
        session_id: &str,
        attempts: u32,
        error: &str,
    ) -> Result<(), StoreError> {
        self.set_upload_status(session_id, "FAILED_TERMINAL", Some(attempts), Some(error), None)
    }

    /// Reset rows stranded IN_FLIGHT by a crash. The attempt counter is not
    /// incremented; the server-side idempotency key makes a double send
    /// harmless.
    pub fn recover_in_flight_uploads(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE upload_queue SET status = 'PENDING' WHERE status = 'IN_FLIGHT'",
                [],
            )?;
            Ok(n)
        })
    }

    /// Operator action: put a terminal record back in the queue.
    pub fn requeue_upload(&self, session_id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE upload_queue
                 SET status = 'PENDING', attempts = 0, last_error = NULL, next_attempt_at = 0
                 WHERE session_id = ?1 AND status = 'FAILED_TERMINAL'",
                [session_id],
            )?;
            Ok(n == 1)
        })
    }

    /// Full queue state for the operator status view.
    pub fn upload_report(&self) -> Result<Vec<UploadRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, status, attempts, last_error, next_attempt_at
                 FROM upload_queue ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map([], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn set_upload_status(
        &self,
        session_id: &str,
        status: &str,
        attempts: Option<u32>,
        error: Option<&str>,
        next_attempt_at: Option<i64>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE upload_queue SET
                     status = ?1,
                     attempts = COALESCE(?2, attempts),
                     last_error = COALESCE(?3, last_error),
                     next_attempt_at = COALESCE(?4, next_attempt_at)
                 WHERE session_id = ?5",
                params![status, attempts, error, next_attempt_at, session_id],
            )?;
            if updated != 1 {
                return Err(StoreError::SessionNotFound(session_id.to_string()));
            }
            Ok(())
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<UploadRecord> {
    let status_text: String = row.get(1)?;
    let status = UploadStatus::parse(&status_text).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown upload status: {status_text}").into(),
        )
    })?;
    let attempts: i64 = row.get(2)?;
    Ok(UploadRecord {
        session_id: row.get(0)?,
        status,
        attempts: attempts as u32,
        last_error: row.get(3)?,
        next_attempt_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sessions::{SessionRecord, SessionState};

    fn completed_session(db: &SessionDb, id: &str) {
        let t = Utc::now().timestamp();
        db.create_session(&SessionRecord {
            id: id.to_string(),
            subject_id: "subject".into(),
            referral_coupon: None,
            survey_version: 1,
            language: "en".into(),
            state: SessionState::Completed,
            question_index: 0,
            eligible: Some(true),
            created_at: t,
            updated_at: t,
        })
        .unwrap();
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let db = SessionDb::open_in_memory("pass").unwrap();
        completed_session(&db, "s1");

        db.enqueue_upload("s1").unwrap();
        db.enqueue_upload("s1").unwrap();

        assert_eq!(db.upload_report().unwrap().len(), 1);
    }

    #[test]
    fn test_retry_scheduling_and_terminal() {
        let db = SessionDb::open_in_memory("pass").unwrap();
        completed_session(&db, "s1");
        db.enqueue_upload("s1").unwrap();

        let now = Utc::now().timestamp();
        assert_eq!(db.due_uploads(now).unwrap().len(), 1);

        db.mark_upload_in_flight("s1").unwrap();
        assert!(db.due_uploads(now).unwrap().is_empty());

        db.mark_upload_retry("s1", 1, "connection refused", now + 60)
            .unwrap();
        assert!(db.due_uploads(now).unwrap().is_empty());
        assert_eq!(db.due_uploads(now + 61).unwrap().len(), 1);

        db.mark_upload_terminal("s1", 5, "max attempts exceeded")
            .unwrap();
        let record = db.upload_record("s1").unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::FailedTerminal);
        assert_eq!(record.attempts, 5);
        assert!(db.due_uploads(now + 3600).unwrap().is_empty());
    }

    #[test]
    fn test_recover_in_flight() {
        let db = SessionDb::open_in_memory("pass").unwrap();
        completed_session(&db, "s1");
        db.enqueue_upload("s1").unwrap();
        db.mark_upload_in_flight("s1").unwrap();

        assert_eq!(db.recover_in_flight_uploads().unwrap(), 1);
        let record = db.upload_record("s1").unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Pending);
        assert_eq!(record.attempts, 0);
    }

    #[test]
    fn test_requeue_only_touches_terminal_rows() {
        let db = SessionDb::open_in_memory("pass").unwrap();
        completed_session(&db, "s1");
        db.enqueue_upload("s1").unwrap();

        assert!(!db.requeue_upload("s1").unwrap());

        db.mark_upload_terminal("s1", 5, "server rejected payload")
            .unwrap();
        assert!(db.requeue_upload("s1").unwrap());

        let record = db.upload_record("s1").unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.last_error.is_none());
    }
}
