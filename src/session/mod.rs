//! Interview session state machine.
//!
//! Orchestrates one interview at a time: duplicate screening at entry,
//! script-driven question traversal, eligibility, sample/test collection,
//! biometric payment confirmation and coupon issuance at exit. Every
//! mutation is committed to the session store before the machine advances,
//! so a crash resumes at the last committed step with no loss and no
//! duplication.
//!
//! Failure semantics: validation failures are recoverable outcomes
//! (re-prompt), a duplicate-screening match aborts before anything is
//! persisted, and storage errors propagate — the partially written session
//! stays on disk for manual recovery.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::biometric::{ScreeningError, ScreeningGate};
use crate::config::FacilityConfig;
use crate::coupon::{CouponError, CouponLedger, CouponStatus};
use crate::definition::{
    DefinitionError, DefinitionStore, QuestionDef, QuestionType, SurveyDefinition,
};
use crate::expr::{evaluate, truthy, Context, Value};
use crate::store::{
    AnswerRow, AnswerValue, PaymentRecord, SessionDb, SessionRecord, SessionState, StoreError,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("another interview is already in progress")]
    Busy,

    #[error("no survey definition is loaded")]
    NoDefinition,

    #[error("operation not valid in state {0}")]
    InvalidState(&'static str),

    #[error("question index out of range")]
    OutOfRange,

    #[error(transparent)]
    Screening(#[from] ScreeningError),

    #[error(transparent)]
    Coupon(#[from] CouponError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

/// Non-reentrant device slot: exactly one session may be in progress on a
/// device, matching one interviewer at one tablet. Explicit object instead
/// of a process-wide singleton so tests can run slots side by side.
#[derive(Default)]
pub struct InterviewSlot {
    active: Mutex<Option<String>>,
}

impl InterviewSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, session_id: &str) -> Result<(), SessionError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.is_some() {
            return Err(SessionError::Busy);
        }
        *active = Some(session_id.to_string());
        Ok(())
    }

    fn release(&self, session_id: &str) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.as_deref() == Some(session_id) {
            *active = None;
        }
    }

    pub fn active_session(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Shared collaborators handed to the engine explicitly; no hidden global
/// state.
#[derive(Clone)]
pub struct EngineContext {
    pub db: Arc<SessionDb>,
    pub definitions: Arc<DefinitionStore>,
    pub gate: Arc<ScreeningGate>,
    pub ledger: Arc<CouponLedger>,
    pub slot: Arc<InterviewSlot>,
    pub facility: FacilityConfig,
}

/// What the UI should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Present the question at this definition index.
    Question(usize),
    /// Run the eligibility check.
    Eligibility,
    SampleCollection,
    TestResultEntry,
    PaymentConfirmation,
    CouponIssuance,
    Ineligible,
    Completed,
}

/// Result of submitting an answer. Rejections are recoverable: the UI
/// re-prompts with the message and the session does not advance.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerOutcome {
    Accepted,
    Rejected { message: String },
}

pub struct SessionEngine {
    ctx: EngineContext,
    definition: Arc<SurveyDefinition>,
    session: SessionRecord,
    answers: HashMap<String, AnswerRow>,
    next_seq: u64,
}

impl fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEngine")
            .field("session_id", &self.session.id)
            .field("state", &self.session.state)
            .field("question_index", &self.session.question_index)
            .finish_non_exhaustive()
    }
}

impl SessionEngine {
    /// Start a new interview: claim the device slot, validate the referral
    /// coupon, run duplicate screening, then persist the session. A
    /// screening match aborts before anything reaches the store.
    pub async fn begin(
        ctx: EngineContext,
        subject_id: &str,
        language: &str,
        referral_coupon: Option<&str>,
    ) -> Result<Self, SessionError> {
        let session_id = Uuid::new_v4().to_string();
        ctx.slot.claim(&session_id)?;

        match Self::begin_inner(&ctx, &session_id, subject_id, language, referral_coupon).await {
            Ok(engine) => Ok(engine),
            Err(e) => {
                ctx.slot.release(&session_id);
                Err(e)
            }
        }
    }

    async fn begin_inner(
        ctx: &EngineContext,
        session_id: &str,
        subject_id: &str,
        language: &str,
        referral_coupon: Option<&str>,
    ) -> Result<Self, SessionError> {
        let definition = ctx.definitions.current().ok_or(SessionError::NoDefinition)?;

        // Referral coupons must be in ISSUED state before we accept them.
        if let Some(code) = referral_coupon {
            let coupon = ctx.ledger.lookup(code)?;
            match coupon.status {
                CouponStatus::Issued => {}
                CouponStatus::Used => {
                    return Err(CouponError::AlreadyUsed {
                        code: code.to_string(),
                        by: coupon.used_by_session.unwrap_or_default(),
                    }
                    .into())
                }
                CouponStatus::Unused => {
                    return Err(CouponError::NotIssued(code.to_string()).into())
                }
            }
        }

        // Duplicate screening gates entry; a match discards the session
        // before any question is asked.
        ctx.gate.screen_enrollment(subject_id).await?;

        // Redeem before the session row exists: a redemption failure must
        // not leave an orphaned resumable session behind.
        if let Some(code) = referral_coupon {
            ctx.ledger.redeem(code, session_id)?;
        }

        let now = Utc::now().timestamp();
        let record = SessionRecord {
            id: session_id.to_string(),
            subject_id: subject_id.to_string(),
            referral_coupon: referral_coupon.map(str::to_string),
            survey_version: definition.version(),
            language: language.to_string(),
            state: SessionState::InProgress,
            question_index: 0,
            eligible: None,
            created_at: now,
            updated_at: now,
        };
        ctx.db.create_session(&record)?;

        info!(session_id, subject_id, version = definition.version(), "Interview started");

        Ok(Self {
            ctx: ctx.clone(),
            definition,
            session: record,
            answers: HashMap::new(),
            next_seq: 1,
        })
    }

    /// Resume the device's active session after a restart. Picks up at the
    /// last committed index against the definition version the session
    /// started with.
    pub fn resume(ctx: EngineContext) -> Result<Option<Self>, SessionError> {
        let Some(session) = ctx.db.active_session()? else {
            return Ok(None);
        };

        let definition = ctx.definitions.load_version(session.survey_version)?;
        ctx.slot.claim(&session.id)?;

        let answers: HashMap<String, AnswerRow> = match ctx.db.answers(&session.id) {
            Ok(rows) => rows
                .into_iter()
                .map(|row| (row.short_name.clone(), row))
                .collect(),
            Err(e) => {
                ctx.slot.release(&session.id);
                return Err(e.into());
            }
        };
        let next_seq = answers.values().map(|a| a.seq).max().unwrap_or(0) + 1;

        info!(
            session_id = %session.id,
            state = session.state.as_str(),
            index = session.question_index,
            "Resuming interview"
        );

        Ok(Some(Self {
            ctx,
            definition,
            session,
            answers,
            next_seq,
        }))
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn definition(&self) -> &SurveyDefinition {
        &self.definition
    }

    /// Release the device slot without completing. Persisted state stays on
    /// disk; the session can be resumed later.
    pub fn suspend(self) {
        self.ctx.slot.release(&self.session.id);
    }

    /// Resolve what the UI should show next. In `InProgress` this
    /// re-evaluates every pre-condition from the current index against the
    /// live answer context — visibility is never cached.
    pub fn present(&mut self) -> Result<Step, SessionError> {
        match self.session.state {
            SessionState::InProgress => {
                let ctx = self.script_context();
                match self.next_visible_from(self.session.question_index, &ctx) {
                    Some(idx) => {
                        if idx != self.session.question_index {
                            self.ctx
                                .db
                                .advance(&self.session.id, SessionState::InProgress, idx)?;
                            self.session.question_index = idx;
                        }
                        Ok(Step::Question(idx))
                    }
                    None => {
                        self.set_state(SessionState::EligibilityCheck, self.session.question_index)?;
                        Ok(Step::Eligibility)
                    }
                }
            }
            SessionState::EligibilityCheck => Ok(Step::Eligibility),
            SessionState::Continuing => {
                let next = self.stage_after_continuing();
                self.set_state(next, self.session.question_index)?;
                Ok(self.stage_step(next))
            }
            SessionState::SampleCollection => Ok(Step::SampleCollection),
            SessionState::TestResultEntry => Ok(Step::TestResultEntry),
            SessionState::PaymentConfirmation => Ok(Step::PaymentConfirmation),
            SessionState::CouponIssuance => Ok(Step::CouponIssuance),
            SessionState::Ineligible => Ok(Step::Ineligible),
            SessionState::Completed => Ok(Step::Completed),
            SessionState::LanguageSelection | SessionState::DuplicateScreening => {
                Err(SessionError::InvalidState(self.session.state.as_str()))
            }
        }
    }

    /// Current question definition, for rendering.
    pub fn current_question(&self) -> Result<&QuestionDef, SessionError> {
        if self.session.state != SessionState::InProgress {
            return Err(SessionError::InvalidState(self.session.state.as_str()));
        }
        self.definition
            .question(self.session.question_index)
            .ok_or(SessionError::OutOfRange)
    }

    /// Validate and commit an answer for the current question. The answer
    /// and the index move are one transaction; downstream answers whose
    /// questions just became invisible are dropped in the same transaction.
    pub fn submit_answer(&mut self, value: AnswerValue) -> Result<AnswerOutcome, SessionError> {
        let question = self.current_question()?.clone();

        if let Some(message) = self.validate_answer(&question, &value) {
            return Ok(AnswerOutcome::Rejected { message });
        }

        let short_name = question.question.short_name.clone();

        // Context as it will look after this answer, for stale-answer
        // detection downstream (re-answers change skip decisions going
        // forward only).
        let mut ctx = self.script_context();
        ctx.insert(short_name.clone(), answer_to_value(&value));

        let current = self.session.question_index;
        let mut stale: Vec<String> = Vec::new();
        for idx in (current + 1)..self.definition.question_count() {
            if let Some(q) = self.definition.question(idx) {
                let name = &q.question.short_name;
                if self.answers.contains_key(name) && !self.is_visible(q, &ctx) {
                    stale.push(name.clone());
                }
            }
        }

        let seq = self.next_seq;
        let next_index = current + 1;
        self.ctx.db.commit_answer(
            &self.session.id,
            &short_name,
            &value,
            seq,
            SessionState::InProgress,
            next_index,
            &stale,
        )?;

        // Mirror the committed state in memory only after the store write
        // succeeded.
        for name in &stale {
            self.answers.remove(name);
        }
        self.answers.insert(
            short_name.clone(),
            AnswerRow {
                short_name,
                seq,
                value,
            },
        );
        self.next_seq += 1;
        self.session.question_index = next_index;

        Ok(AnswerOutcome::Accepted)
    }

    /// Step back to the previous visible question, if any.
    pub fn go_back(&mut self) -> Result<Option<Step>, SessionError> {
        if self.session.state != SessionState::InProgress {
            return Err(SessionError::InvalidState(self.session.state.as_str()));
        }
        let ctx = self.script_context();
        let mut idx = self.session.question_index;
        while idx > 0 {
            idx -= 1;
            if let Some(q) = self.definition.question(idx) {
                if self.is_visible(q, &ctx) {
                    self.ctx
                        .db
                        .advance(&self.session.id, SessionState::InProgress, idx)?;
                    self.session.question_index = idx;
                    return Ok(Some(Step::Question(idx)));
                }
            }
        }
        Ok(None)
    }

    /// Evaluate the eligibility script over the combined context: answers
    /// keyed by short name, overridden by recorded rapid-test results keyed
    /// by test id. An absent script means always eligible; a script error
    /// means not qualifying.
    pub fn run_eligibility(&mut self) -> Result<Step, SessionError> {
        if self.session.state != SessionState::EligibilityCheck {
            return Err(SessionError::InvalidState(self.session.state.as_str()));
        }

        let eligible = match &self.definition.survey.eligibility {
            None => true,
            Some(script) => {
                let mut ctx = self.script_context();
                for result in self.ctx.db.test_results(&self.session.id)? {
                    // Test result wins on key collision.
                    ctx.insert(result.test_id, Value::Str(result.result));
                }
                match evaluate(script, &ctx) {
                    Ok(value) => truthy(&value),
                    Err(e) => {
                        warn!(session_id = %self.session.id, error = %e,
                              "Eligibility script failed, treating as not qualifying");
                        false
                    }
                }
            }
        };

        if eligible {
            self.ctx.db.set_eligibility(
                &self.session.id,
                true,
                SessionState::Continuing,
            )?;
            self.session.eligible = Some(true);
            self.session.state = SessionState::Continuing;
            self.present()
        } else {
            self.ctx
                .db
                .set_eligibility(&self.session.id, false, SessionState::Ineligible)?;
            self.session.eligible = Some(false);
            self.session.state = SessionState::Ineligible;
            info!(session_id = %self.session.id, "Participant not eligible");

            // Facility policy may still hand coupons to ineligible
            // participants to keep the recruitment chain going.
            if self.ctx.facility.issue_to_ineligible {
                let codes = self
                    .ctx
                    .ledger
                    .issue(&self.session.id, self.ctx.facility.coupons_to_issue)?;
                info!(session_id = %self.session.id, count = codes.len(),
                      "Coupons issued to ineligible participant");
            }

            self.finalize()?;
            Ok(Step::Ineligible)
        }
    }

    pub fn record_sample_collected(&mut self) -> Result<Step, SessionError> {
        if self.session.state != SessionState::SampleCollection {
            return Err(SessionError::InvalidState(self.session.state.as_str()));
        }
        self.set_state(SessionState::TestResultEntry, self.session.question_index)?;
        Ok(Step::TestResultEntry)
    }

    /// Record one rapid-test result; repeatable while in test entry.
    pub fn record_test_result(&mut self, test_id: &str, result: &str) -> Result<(), SessionError> {
        if self.session.state != SessionState::TestResultEntry {
            return Err(SessionError::InvalidState(self.session.state.as_str()));
        }
        self.ctx
            .db
            .record_test_result(&self.session.id, test_id, result)?;
        Ok(())
    }

    pub fn finish_test_results(&mut self) -> Result<Step, SessionError> {
        if self.session.state != SessionState::TestResultEntry {
            return Err(SessionError::InvalidState(self.session.state.as_str()));
        }
        let next = if self.ctx.facility.collect_samples_immediately {
            SessionState::PaymentConfirmation
        } else {
            // Deferred collection runs after payment, so tests finishing
            // means the interview is ready for coupons.
            SessionState::CouponIssuance
        };
        self.set_state(next, self.session.question_index)?;
        Ok(self.stage_step(next))
    }

    /// Confirm payment against the participant's enrollment template or an
    /// administrator override; the confirming identity is persisted with
    /// the payment.
    pub async fn confirm_payment(&mut self) -> Result<Step, SessionError> {
        if self.session.state != SessionState::PaymentConfirmation {
            return Err(SessionError::InvalidState(self.session.state.as_str()));
        }

        let confirmed_by = self
            .ctx
            .gate
            .confirm_identity(&self.session.subject_id)
            .await?;
        self.ctx.db.record_payment(
            &self.session.id,
            &PaymentRecord {
                confirmed_by,
                confirmed_at: Utc::now().timestamp(),
            },
        )?;

        let next = if self.ctx.facility.collect_samples_immediately {
            SessionState::CouponIssuance
        } else {
            SessionState::SampleCollection
        };
        self.set_state(next, self.session.question_index)?;
        Ok(self.stage_step(next))
    }

    /// Issue the facility-configured number of coupons, complete the
    /// session and hand it to the upload queue.
    pub fn issue_coupons(&mut self) -> Result<Vec<String>, SessionError> {
        if self.session.state != SessionState::CouponIssuance {
            return Err(SessionError::InvalidState(self.session.state.as_str()));
        }

        let codes = self
            .ctx
            .ledger
            .issue(&self.session.id, self.ctx.facility.coupons_to_issue)?;

        self.set_state(SessionState::Completed, self.session.question_index)?;
        self.finalize()?;
        info!(session_id = %self.session.id, coupons = codes.len(), "Interview completed");
        Ok(codes)
    }

    /// Terminal bookkeeping: queue the session for upload and free the
    /// device slot.
    fn finalize(&self) -> Result<(), SessionError> {
        self.ctx.db.enqueue_upload(&self.session.id)?;
        self.ctx.slot.release(&self.session.id);
        Ok(())
    }

    fn set_state(&mut self, state: SessionState, index: usize) -> Result<(), SessionError> {
        self.ctx.db.advance(&self.session.id, state, index)?;
        self.session.state = state;
        self.session.question_index = index;
        Ok(())
    }

    fn stage_after_continuing(&self) -> SessionState {
        if self.ctx.facility.collect_samples_immediately {
            SessionState::SampleCollection
        } else {
            SessionState::PaymentConfirmation
        }
    }

    fn stage_step(&self, state: SessionState) -> Step {
        match state {
            SessionState::SampleCollection => Step::SampleCollection,
            SessionState::TestResultEntry => Step::TestResultEntry,
            SessionState::PaymentConfirmation => Step::PaymentConfirmation,
            SessionState::CouponIssuance => Step::CouponIssuance,
            SessionState::Completed => Step::Completed,
            SessionState::Ineligible => Step::Ineligible,
            _ => Step::Eligibility,
        }
    }

    /// Pre-condition policy: error or false means skipped.
    fn is_visible(&self, question: &QuestionDef, ctx: &Context) -> bool {
        match &question.question.precondition {
            None => true,
            Some(script) => match evaluate(script, ctx) {
                Ok(value) => truthy(&value),
                Err(e) => {
                    warn!(
                        question = %question.question.short_name,
                        error = %e,
                        "Pre-condition script failed, skipping question"
                    );
                    false
                }
            },
        }
    }

    fn next_visible_from(&self, start: usize, ctx: &Context) -> Option<usize> {
        (start..self.definition.question_count())
            .find(|&idx| match self.definition.question(idx) {
                Some(q) => self.is_visible(q, ctx),
                None => false,
            })
    }

    fn script_context(&self) -> Context {
        self.answers
            .values()
            .map(|row| (row.short_name.clone(), answer_to_value(&row.value)))
            .collect()
    }

    /// Returns a rejection message when the answer fails type, selection
    /// count, or validation-script checks.
    fn validate_answer(&self, question: &QuestionDef, value: &AnswerValue) -> Option<String> {
        let q = &question.question;
        match (q.question_type, value) {
            (QuestionType::SingleChoice, AnswerValue::SingleChoice(index)) => {
                if !question.options.iter().any(|o| o.index == *index) {
                    return Some(format!("{} is not one of the options", index));
                }
            }
            (QuestionType::MultiSelect, AnswerValue::MultiSelect(indices)) => {
                let mut seen = HashSet::new();
                for index in indices {
                    if !question.options.iter().any(|o| o.index == *index) {
                        return Some(format!("{} is not one of the options", index));
                    }
                    if !seen.insert(*index) {
                        return Some(format!("option {} selected more than once", index));
                    }
                }
                let count = indices.len() as u32;
                if let Some(min) = q.min_selections {
                    if count < min {
                        return Some(format!("select at least {min} option(s)"));
                    }
                }
                if let Some(max) = q.max_selections {
                    if count > max {
                        return Some(format!("select at most {max} option(s)"));
                    }
                }
            }
            (QuestionType::Numeric, AnswerValue::Numeric(n)) => {
                if !n.is_finite() {
                    return Some("enter a valid number".to_string());
                }
            }
            (QuestionType::FreeText, AnswerValue::FreeText(_)) => {}
            _ => return Some("answer does not match the question type".to_string()),
        }

        if let Some(script) = &q.validation {
            let mut ctx = self.script_context();
            ctx.insert(q.short_name.clone(), answer_to_value(value));
            let accepted = match evaluate(script, &ctx) {
                Ok(result) => truthy(&result),
                Err(e) => {
                    warn!(
                        question = %q.short_name,
                        error = %e,
                        "Validation script failed, rejecting answer"
                    );
                    false
                }
            };
            if !accepted {
                let message = q
                    .validation_message
                    .as_deref()
                    .map(|key| self.definition.message(key, &self.session.language).to_string())
                    .unwrap_or_else(|| "answer not accepted".to_string());
                return Some(message);
            }
        }

        None
    }
}

/// Answers act as script variables keyed by short name: option indices for
/// single-choice, index lists for multi-select.
fn answer_to_value(value: &AnswerValue) -> Value {
    match value {
        AnswerValue::SingleChoice(index) => Value::Number(*index as f64),
        AnswerValue::MultiSelect(indices) => {
            Value::List(indices.iter().map(u32::to_string).collect())
        }
        AnswerValue::Numeric(n) => Value::Number(*n),
        AnswerValue::FreeText(s) => Value::Str(s.clone()),
    }
}
