//! Session upload payload.
//!
//! Assembled fresh from the store at send time, so a retried upload always
//! reflects the committed session. The session id doubles as the
//! server-side idempotency key. Biometric templates have no field here;
//! the payload type is the upload surface, so they cannot leave the device.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::SyncError;
use crate::coupon::CouponLedger;
use crate::store::{AnswerValue, ConfirmedBy, SessionDb};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpload {
    /// Client-generated id; the server deduplicates on it.
    pub session_id: String,
    pub device_id: String,
    pub subject_id: String,
    pub survey_version: u32,
    pub language: String,
    pub eligible: Option<bool>,
    pub started_at: i64,
    pub completed_at: i64,
    /// Inbound recruitment link.
    pub referral_coupon_code: Option<String>,
    /// Outbound recruitment links.
    pub issued_coupons: Vec<String>,
    pub answers: Vec<AnswerUpload>,
    pub test_results: Vec<TestResultUpload>,
    pub payment: Option<PaymentUpload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerUpload {
    pub short_name: String,
    pub seq: u64,
    #[serde(flatten)]
    pub value: AnswerValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultUpload {
    pub test_id: String,
    pub result: String,
    pub recorded_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentUpload {
    pub confirmed_role: String,
    pub confirmed_by: Option<String>,
    pub confirmed_at: i64,
}

/// Build the upload for a queued session from its committed rows.
pub fn build_upload(
    db: &SessionDb,
    ledger: &Arc<CouponLedger>,
    device_id: &str,
    session_id: &str,
) -> Result<SessionUpload, SyncError> {
    let session = db.load_session(session_id)?;

    let answers = db
        .answers(session_id)?
        .into_iter()
        .map(|row| AnswerUpload {
            short_name: row.short_name,
            seq: row.seq,
            value: row.value,
        })
        .collect();

    let test_results = db
        .test_results(session_id)?
        .into_iter()
        .map(|t| TestResultUpload {
            test_id: t.test_id,
            result: t.result,
            recorded_at: t.recorded_at,
        })
        .collect();

    let payment = db.payment(session_id)?.map(|p| {
        let (role, name) = match p.confirmed_by {
            ConfirmedBy::Participant => ("participant", None),
            ConfirmedBy::Admin(name) => ("admin", Some(name)),
        };
        PaymentUpload {
            confirmed_role: role.to_string(),
            confirmed_by: name,
            confirmed_at: p.confirmed_at,
        }
    });

    Ok(SessionUpload {
        session_id: session.id,
        device_id: device_id.to_string(),
        subject_id: session.subject_id,
        survey_version: session.survey_version,
        language: session.language,
        eligible: session.eligible,
        started_at: session.created_at,
        completed_at: session.updated_at,
        referral_coupon_code: session.referral_coupon,
        issued_coupons: ledger.issued_by(session_id)?,
        answers,
        test_results,
        payment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PaymentRecord, SessionRecord, SessionState};
    use chrono::Utc;

    fn seeded_db() -> (Arc<SessionDb>, Arc<CouponLedger>) {
        let db = Arc::new(SessionDb::open_in_memory("pass").unwrap());
        let ledger = Arc::new(CouponLedger::new(db.clone()));
        let t = Utc::now().timestamp();

        db.create_session(&SessionRecord {
            id: "s1".into(),
            subject_id: "subject-1".into(),
            referral_coupon: Some("REFCODE1".into()),
            survey_version: 3,
            language: "en".into(),
            state: SessionState::Completed,
            question_index: 5,
            eligible: Some(true),
            created_at: t - 600,
            updated_at: t,
        })
        .unwrap();

        db.commit_answer(
            "s1",
            "consent",
            &AnswerValue::SingleChoice(1),
            1,
            SessionState::Completed,
            5,
            &[],
        )
        .unwrap();
        db.commit_answer(
            "s1",
            "age",
            &AnswerValue::Numeric(25.0),
            2,
            SessionState::Completed,
            5,
            &[],
        )
        .unwrap();
        db.record_test_result("s1", "hiv_rapid", "negative").unwrap();
        db.record_payment(
            "s1",
            &PaymentRecord {
                confirmed_by: ConfirmedBy::Participant,
                confirmed_at: t,
            },
        )
        .unwrap();

        // Templates exist but must never surface in the payload.
        db.insert_template("subject-1", "participant", b"print-a", t)
            .unwrap();

        (db, ledger)
    }

    #[test]
    fn test_build_upload_collects_session_rows() {
        let (db, ledger) = seeded_db();
        let issued = ledger.issue("s1", 3).unwrap();

        let upload = build_upload(&db, &ledger, "tablet-7", "s1").unwrap();
        assert_eq!(upload.session_id, "s1");
        assert_eq!(upload.device_id, "tablet-7");
        assert_eq!(upload.referral_coupon_code.as_deref(), Some("REFCODE1"));
        assert_eq!(upload.issued_coupons.len(), 3);
        assert!(issued.iter().all(|c| upload.issued_coupons.contains(c)));
        assert_eq!(upload.answers.len(), 2);
        assert_eq!(upload.answers[0].short_name, "consent");
        assert_eq!(upload.test_results.len(), 1);
        assert_eq!(
            upload.payment.as_ref().unwrap().confirmed_role,
            "participant"
        );
    }

    #[test]
    fn test_payload_never_contains_biometric_data() {
        let (db, ledger) = seeded_db();
        let upload = build_upload(&db, &ledger, "tablet-7", "s1").unwrap();

        let json = serde_json::to_string(&upload).unwrap();
        assert!(!json.contains("template"));
        assert!(!json.contains("biometric"));
        assert!(!json.contains("print-a"));
    }

    #[test]
    fn test_answer_wire_format_is_typed() {
        let (db, ledger) = seeded_db();
        let upload = build_upload(&db, &ledger, "tablet-7", "s1").unwrap();
        let json = serde_json::to_value(&upload).unwrap();

        let answer = &json["answers"][0];
        assert_eq!(answer["shortName"], "consent");
        assert_eq!(answer["type"], "single_choice");
        assert_eq!(answer["value"], 1);
    }
}
