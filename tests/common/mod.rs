//! Shared fixtures for integration tests: a small survey bundle, a
//! deterministic capture device, and an engine context wired over a
//! file-backed store so tests can simulate restarts.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use tracelink::biometric::{BiometricDevice, ScreeningGate};
use tracelink::config::FacilityConfig;
use tracelink::coupon::CouponLedger;
use tracelink::definition::{
    BundleMetadata, DefinitionBundle, DefinitionStore, Message, Question, QuestionOption,
    QuestionType, Section, SurveyMeta,
};
use tracelink::session::{EngineContext, InterviewSlot};
use tracelink::store::SessionDb;

/// Device that always captures the same template and scores 100 for
/// byte-equal templates.
pub struct StaticDevice {
    template: Vec<u8>,
}

impl StaticDevice {
    pub fn new(template: &[u8]) -> Self {
        Self {
            template: template.to_vec(),
        }
    }
}

#[async_trait]
impl BiometricDevice for StaticDevice {
    async fn initialize(&self) -> bool {
        true
    }

    async fn capture(&self, _timeout: Duration, _min_quality: u8) -> Option<Vec<u8>> {
        Some(self.template.clone())
    }

    fn match_score(&self, a: &[u8], b: &[u8]) -> u32 {
        if a == b {
            100
        } else {
            0
        }
    }

    async fn close(&self) {}
}

/// Survey with a consent gate, a validated numeric question, and a
/// question skipped unless the prior answer is "negative".
pub fn survey_bundle(version: u32) -> DefinitionBundle {
    let survey = SurveyMeta {
        id: "survey-itest".into(),
        name: "Link-Tracing Behavioral Survey".into(),
        version,
        eligibility: Some("age >= 18 && consent == '1'".into()),
    };
    let sections = vec![Section {
        id: "core".into(),
        title: "Core".into(),
        order: 1,
    }];
    let questions = vec![
        Question {
            short_name: "consent".into(),
            section_id: "core".into(),
            statement: "Do you consent to participate?".into(),
            question_type: QuestionType::SingleChoice,
            precondition: None,
            validation: None,
            validation_message: None,
            min_selections: None,
            max_selections: None,
            audio: None,
            order: 1,
        },
        Question {
            short_name: "age".into(),
            section_id: "core".into(),
            statement: "How old are you?".into(),
            question_type: QuestionType::Numeric,
            precondition: None,
            validation: Some("age >= 10 && age <= 99".into()),
            validation_message: Some("msg.age_range".into()),
            min_selections: None,
            max_selections: None,
            audio: None,
            order: 2,
        },
        Question {
            short_name: "hiv_status".into(),
            section_id: "core".into(),
            statement: "What was the result of your last HIV test?".into(),
            question_type: QuestionType::FreeText,
            precondition: None,
            validation: None,
            validation_message: None,
            min_selections: None,
            max_selections: None,
            audio: None,
            order: 3,
        },
        Question {
            short_name: "last_negative_test".into(),
            section_id: "core".into(),
            statement: "When was your last negative test?".into(),
            question_type: QuestionType::FreeText,
            precondition: Some("hiv_status == 'negative'".into()),
            validation: None,
            validation_message: None,
            min_selections: None,
            max_selections: None,
            audio: None,
            order: 4,
        },
    ];
    let options = vec![
        QuestionOption {
            question: "consent".into(),
            index: 1,
            text: "Yes".into(),
            audio: None,
        },
        QuestionOption {
            question: "consent".into(),
            index: 2,
            text: "No".into(),
            audio: None,
        },
    ];
    let messages = vec![Message {
        key: "msg.age_range".into(),
        language: "en".into(),
        text: "Please enter an age between 10 and 99.".into(),
    }];

    let mut bundle = DefinitionBundle {
        survey,
        sections,
        questions,
        options,
        messages,
        metadata: BundleMetadata {
            checksum: String::new(),
            updated_at: Utc::now(),
        },
    };
    bundle.metadata.checksum = bundle.content_checksum().unwrap();
    bundle
}

/// Build an engine context over a file-backed store rooted at `dir`, so a
/// test can drop it and rebuild to simulate a device restart.
pub fn open_context(dir: &Path, facility: FacilityConfig, template: &[u8]) -> EngineContext {
    let db = Arc::new(SessionDb::open(dir, "itest-passphrase").unwrap());
    let definitions = Arc::new(DefinitionStore::open(&dir.join("definitions")).unwrap());
    let gate = Arc::new(ScreeningGate::new(
        Arc::new(StaticDevice::new(template)),
        db.clone(),
        Duration::from_millis(50),
        40,
        90,
    ));
    let ledger = Arc::new(CouponLedger::new(db.clone()));

    EngineContext {
        db,
        definitions,
        gate,
        ledger,
        slot: Arc::new(InterviewSlot::new()),
        facility,
    }
}
