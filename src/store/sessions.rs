//! Session, answer, test-result, payment and template persistence.
//!
//! The invariant carried here is commit-before-advance: an answer and the
//! index move it causes are written in one transaction, so a crash
//! immediately after an answer resumes at the next question with no loss
//! and no duplication.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{SessionDb, StoreError};

/// Lifecycle state of a survey session. Only `InProgress` and later states
/// are ever persisted: a session blocked by duplicate screening is
/// discarded, not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    LanguageSelection,
    DuplicateScreening,
    InProgress,
    EligibilityCheck,
    Ineligible,
    Continuing,
    SampleCollection,
    TestResultEntry,
    PaymentConfirmation,
    CouponIssuance,
    Completed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::LanguageSelection => "LANGUAGE_SELECTION",
            SessionState::DuplicateScreening => "DUPLICATE_SCREENING",
            SessionState::InProgress => "IN_PROGRESS",
            SessionState::EligibilityCheck => "ELIGIBILITY_CHECK",
            SessionState::Ineligible => "INELIGIBLE",
            SessionState::Continuing => "CONTINUING",
            SessionState::SampleCollection => "SAMPLE_COLLECTION",
            SessionState::TestResultEntry => "TEST_RESULT_ENTRY",
            SessionState::PaymentConfirmation => "PAYMENT_CONFIRMATION",
            SessionState::CouponIssuance => "COUPON_ISSUANCE",
            SessionState::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        Ok(match s {
            "LANGUAGE_SELECTION" => SessionState::LanguageSelection,
            "DUPLICATE_SCREENING" => SessionState::DuplicateScreening,
            "IN_PROGRESS" => SessionState::InProgress,
            "ELIGIBILITY_CHECK" => SessionState::EligibilityCheck,
            "INELIGIBLE" => SessionState::Ineligible,
            "CONTINUING" => SessionState::Continuing,
            "SAMPLE_COLLECTION" => SessionState::SampleCollection,
            "TEST_RESULT_ENTRY" => SessionState::TestResultEntry,
            "PAYMENT_CONFIRMATION" => SessionState::PaymentConfirmation,
            "COUPON_ISSUANCE" => SessionState::CouponIssuance,
            "COMPLETED" => SessionState::Completed,
            other => {
                return Err(StoreError::Internal(format!(
                    "unknown session state: {other}"
                )))
            }
        })
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Ineligible)
    }
}

/// Typed answer value. The wire tag mirrors the question type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AnswerValue {
    SingleChoice(u32),
    MultiSelect(Vec<u32>),
    Numeric(f64),
    FreeText(String),
}

impl AnswerValue {
    pub fn type_tag(&self) -> &'static str {
        match self {
            AnswerValue::SingleChoice(_) => "single_choice",
            AnswerValue::MultiSelect(_) => "multi_select",
            AnswerValue::Numeric(_) => "numeric",
            AnswerValue::FreeText(_) => "free_text",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnswerRow {
    pub short_name: String,
    pub seq: u64,
    pub value: AnswerValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", content = "name", rename_all = "snake_case")]
pub enum ConfirmedBy {
    Participant,
    Admin(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub confirmed_by: ConfirmedBy,
    pub confirmed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: String,
    pub result: String,
    pub recorded_at: i64,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub subject_id: String,
    pub referral_coupon: Option<String>,
    pub survey_version: u32,
    pub language: String,
    pub state: SessionState,
    pub question_index: usize,
    pub eligible: Option<bool>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct TemplateRow {
    pub subject_id: String,
    pub role: String,
    pub template: Vec<u8>,
    pub created_at: i64,
}

fn now() -> i64 {
    Utc::now().timestamp()
}

impl SessionDb {
    pub fn create_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions
                 (id, subject_id, referral_coupon, survey_version, language, state,
                  question_index, eligible, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id,
                    record.subject_id,
                    record.referral_coupon,
                    record.survey_version,
                    record.language,
                    record.state.as_str(),
                    record.question_index as i64,
                    record.eligible,
                    record.created_at,
                    record.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn load_session(&self, id: &str) -> Result<SessionRecord, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, subject_id, referral_coupon, survey_version, language, state,
                        question_index, eligible, created_at, updated_at
                 FROM sessions WHERE id = ?1",
                [id],
                row_to_session,
            )
            .optional()?
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
        })
    }

    /// The one non-terminal session on this device, if any. Used to resume
    /// after a crash or restart.
    pub fn active_session(&self) -> Result<Option<SessionRecord>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, subject_id, referral_coupon, survey_version, language, state,
                            question_index, eligible, created_at, updated_at
                     FROM sessions
                     WHERE state NOT IN ('COMPLETED', 'INELIGIBLE')
                     ORDER BY created_at DESC LIMIT 1",
                    [],
                    row_to_session,
                )
                .optional()?)
        })
    }

    /// Commit an answer and the resulting index/state move in a single
    /// transaction. `remove` lists short names whose answers became stale
    /// because an upstream re-answer hid their questions.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_answer(
        &self,
        session_id: &str,
        short_name: &str,
        value: &AnswerValue,
        seq: u64,
        next_state: SessionState,
        next_index: usize,
        remove: &[String],
    ) -> Result<(), StoreError> {
        let sealed = self.crypto().seal(&serde_json::to_vec(value)?)?;
        let type_tag = value.type_tag();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO answers (session_id, short_name, seq, answer_type, value)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(session_id, short_name)
                 DO UPDATE SET seq = ?3, answer_type = ?4, value = ?5",
                params![session_id, short_name, seq as i64, type_tag, sealed],
            )?;
            for stale in remove {
                tx.execute(
                    "DELETE FROM answers WHERE session_id = ?1 AND short_name = ?2",
                    params![session_id, stale],
                )?;
            }
            let updated = tx.execute(
                "UPDATE sessions SET state = ?1, question_index = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![next_state.as_str(), next_index as i64, now(), session_id],
            )?;
            if updated != 1 {
                return Err(StoreError::SessionNotFound(session_id.to_string()));
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Move the session to a new state/index without touching answers.
    pub fn advance(
        &self,
        session_id: &str,
        state: SessionState,
        index: usize,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE sessions SET state = ?1, question_index = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![state.as_str(), index as i64, now(), session_id],
            )?;
            if updated != 1 {
                return Err(StoreError::SessionNotFound(session_id.to_string()));
            }
            Ok(())
        })
    }

    pub fn set_eligibility(
        &self,
        session_id: &str,
        eligible: bool,
        state: SessionState,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE sessions SET eligible = ?1, state = ?2, updated_at = ?3 WHERE id = ?4",
                params![eligible, state.as_str(), now(), session_id],
            )?;
            if updated != 1 {
                return Err(StoreError::SessionNotFound(session_id.to_string()));
            }
            Ok(())
        })
    }

    /// All committed answers in capture order, decrypted.
    pub fn answers(&self, session_id: &str) -> Result<Vec<AnswerRow>, StoreError> {
        let sealed_rows: Vec<(String, i64, Vec<u8>)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT short_name, seq, value FROM answers
                 WHERE session_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt
                .query_map([session_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        sealed_rows
            .into_iter()
            .map(|(short_name, seq, sealed)| {
                let plain = self.crypto().open(&sealed)?;
                let value: AnswerValue = serde_json::from_slice(&plain)?;
                Ok(AnswerRow {
                    short_name,
                    seq: seq as u64,
                    value,
                })
            })
            .collect()
    }

    /// Next capture sequence position for the session.
    pub fn next_seq(&self, session_id: &str) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let max: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM answers WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )?;
            Ok(max as u64 + 1)
        })
    }

    pub fn record_test_result(
        &self,
        session_id: &str,
        test_id: &str,
        result: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO test_results (session_id, test_id, result, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id, test_id) DO UPDATE SET result = ?3, recorded_at = ?4",
                params![session_id, test_id, result, now()],
            )?;
            Ok(())
        })
    }

    pub fn test_results(&self, session_id: &str) -> Result<Vec<TestResult>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT test_id, result, recorded_at FROM test_results
                 WHERE session_id = ?1 ORDER BY recorded_at ASC",
            )?;
            let rows = stmt
                .query_map([session_id], |row| {
                    Ok(TestResult {
                        test_id: row.get(0)?,
                        result: row.get(1)?,
                        recorded_at: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn record_payment(
        &self,
        session_id: &str,
        payment: &PaymentRecord,
    ) -> Result<(), StoreError> {
        let (role, name) = match &payment.confirmed_by {
            ConfirmedBy::Participant => ("participant", None),
            ConfirmedBy::Admin(name) => ("admin", Some(name.as_str())),
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO payments (session_id, confirmed_role, confirmed_by, confirmed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, role, name, payment.confirmed_at],
            )?;
            Ok(())
        })
    }

    pub fn payment(&self, session_id: &str) -> Result<Option<PaymentRecord>, StoreError> {
        self.with_conn(|conn| {
            let row: Option<(String, Option<String>, i64)> = conn
                .query_row(
                    "SELECT confirmed_role, confirmed_by, confirmed_at
                     FROM payments WHERE session_id = ?1",
                    [session_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            Ok(match row {
                Some((role, name, confirmed_at)) => {
                    let confirmed_by = if role == "admin" {
                        ConfirmedBy::Admin(name.unwrap_or_default())
                    } else {
                        ConfirmedBy::Participant
                    };
                    Some(PaymentRecord {
                        confirmed_by,
                        confirmed_at,
                    })
                }
                None => None,
            })
        })
    }

    /// Store a biometric template, encrypted. Templates are device-local by
    /// hard invariant; nothing in the upload path reads this table.
    pub fn insert_template(
        &self,
        subject_id: &str,
        role: &str,
        template: &[u8],
        created_at: i64,
    ) -> Result<(), StoreError> {
        let sealed = self.crypto().seal(template)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO templates (subject_id, role, template, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![subject_id, role, sealed, created_at],
            )?;
            Ok(())
        })
    }

    /// Participant templates created at or after `cutoff` (unix seconds),
    /// decrypted for matching.
    pub fn templates_since(&self, cutoff: i64) -> Result<Vec<TemplateRow>, StoreError> {
        self.templates_where(
            "role = 'participant' AND created_at >= ?1",
            params![cutoff],
        )
    }

    pub fn template_for_subject(&self, subject_id: &str) -> Result<Option<TemplateRow>, StoreError> {
        let mut rows = self.templates_where("subject_id = ?1", params![subject_id])?;
        Ok(rows.pop())
    }

    pub fn admin_templates(&self) -> Result<Vec<TemplateRow>, StoreError> {
        self.templates_where("role = 'admin'", params![])
    }

    fn templates_where(
        &self,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<TemplateRow>, StoreError> {
        let sealed_rows: Vec<(String, String, Vec<u8>, i64)> = self.with_conn(|conn| {
            let sql = format!(
                "SELECT subject_id, role, template, created_at FROM templates
                 WHERE {clause} ORDER BY created_at ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(args, |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        sealed_rows
            .into_iter()
            .map(|(subject_id, role, sealed, created_at)| {
                Ok(TemplateRow {
                    subject_id,
                    role,
                    template: self.crypto().open(&sealed)?,
                    created_at,
                })
            })
            .collect()
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let state_text: String = row.get(5)?;
    let state = SessionState::parse(&state_text).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown session state: {state_text}").into(),
        )
    })?;
    let index: i64 = row.get(6)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        referral_coupon: row.get(2)?,
        survey_version: row.get(3)?,
        language: row.get(4)?,
        state,
        question_index: index as usize,
        eligible: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            subject_id: format!("subject-{id}"),
            referral_coupon: None,
            survey_version: 3,
            language: "en".into(),
            state: SessionState::InProgress,
            question_index: 0,
            eligible: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    #[test]
    fn test_commit_answer_is_atomic_with_advance() {
        let db = SessionDb::open_in_memory("pass").unwrap();
        db.create_session(&test_session("s1")).unwrap();

        db.commit_answer(
            "s1",
            "consent",
            &AnswerValue::SingleChoice(1),
            1,
            SessionState::InProgress,
            1,
            &[],
        )
        .unwrap();

        let session = db.load_session("s1").unwrap();
        assert_eq!(session.question_index, 1);

        let answers = db.answers("s1").unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].value, AnswerValue::SingleChoice(1));
        assert_eq!(answers[0].seq, 1);
    }

    #[test]
    fn test_commit_answer_removes_stale_downstream_answers() {
        let db = SessionDb::open_in_memory("pass").unwrap();
        db.create_session(&test_session("s1")).unwrap();

        db.commit_answer(
            "s1",
            "hiv_status",
            &AnswerValue::FreeText("negative".into()),
            1,
            SessionState::InProgress,
            1,
            &[],
        )
        .unwrap();
        db.commit_answer(
            "s1",
            "last_negative_test",
            &AnswerValue::FreeText("2025".into()),
            2,
            SessionState::InProgress,
            2,
            &[],
        )
        .unwrap();

        // Re-answer upstream; the downstream answer is dropped in the same
        // transaction.
        db.commit_answer(
            "s1",
            "hiv_status",
            &AnswerValue::FreeText("positive".into()),
            3,
            SessionState::InProgress,
            1,
            &["last_negative_test".to_string()],
        )
        .unwrap();

        let answers = db.answers("s1").unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].short_name, "hiv_status");
    }

    #[test]
    fn test_answers_are_encrypted_at_rest() {
        let db = SessionDb::open_in_memory("pass").unwrap();
        db.create_session(&test_session("s1")).unwrap();
        db.commit_answer(
            "s1",
            "q",
            &AnswerValue::FreeText("sensitive disclosure".into()),
            1,
            SessionState::InProgress,
            1,
            &[],
        )
        .unwrap();

        let raw: Vec<u8> = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT value FROM answers WHERE session_id = 's1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        let raw_text = String::from_utf8_lossy(&raw);
        assert!(!raw_text.contains("sensitive disclosure"));
    }

    #[test]
    fn test_active_session_skips_terminal_states() {
        let db = SessionDb::open_in_memory("pass").unwrap();
        let mut done = test_session("done");
        done.state = SessionState::Completed;
        db.create_session(&done).unwrap();
        assert!(db.active_session().unwrap().is_none());

        db.create_session(&test_session("live")).unwrap();
        assert_eq!(db.active_session().unwrap().unwrap().id, "live");
    }

    #[test]
    fn test_payment_roundtrip_with_admin_override() {
        let db = SessionDb::open_in_memory("pass").unwrap();
        db.create_session(&test_session("s1")).unwrap();

        let payment = PaymentRecord {
            confirmed_by: ConfirmedBy::Admin("A. Supervisor".into()),
            confirmed_at: now(),
        };
        db.record_payment("s1", &payment).unwrap();
        assert_eq!(db.payment("s1").unwrap(), Some(payment));
    }

    #[test]
    fn test_templates_window_filter() {
        let db = SessionDb::open_in_memory("pass").unwrap();
        let day = 86_400;
        let t = now();

        db.insert_template("old", "participant", b"tpl-old", t - 100 * day)
            .unwrap();
        db.insert_template("recent", "participant", b"tpl-recent", t - 10 * day)
            .unwrap();
        db.insert_template("admin-1", "admin", b"tpl-admin", t - 10 * day)
            .unwrap();

        let within = db.templates_since(t - 90 * day).unwrap();
        assert_eq!(within.len(), 1);
        assert_eq!(within[0].subject_id, "recent");
        assert_eq!(within[0].template, b"tpl-recent");

        assert_eq!(db.admin_templates().unwrap().len(), 1);
    }
}
