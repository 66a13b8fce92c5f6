//! Survey definition model and local cache.
//!
//! A definition is immutable once fetched: the sync manager replaces the
//! whole bundle on a checksum mismatch, never patches it in place. An
//! in-progress session pins the `Arc` it started with (by version) and keeps
//! using it until the session completes, even if a newer version lands
//! mid-interview.

pub mod checksum;
pub mod store;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use store::DefinitionStore;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("definition version {0} is not cached")]
    VersionNotCached(u32),

    #[error("option references unknown question: {0}")]
    UnknownQuestion(String),
}

/// Survey metadata as served by the definition endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurveyMeta {
    pub id: String,
    pub name: String,
    pub version: u32,
    /// Eligibility / lab-qualification script, evaluated after the core
    /// questions. Absent means every participant is eligible.
    #[serde(default)]
    pub eligibility: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub title: String,
    pub order: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    SingleChoice,
    MultiSelect,
    Numeric,
    FreeText,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    /// Unique within a survey; the join key for the script context.
    pub short_name: String,
    pub section_id: String,
    pub statement: String,
    pub question_type: QuestionType,
    /// Pre-condition (skip) script: error or false means the question is
    /// not shown and requires no answer.
    #[serde(default)]
    pub precondition: Option<String>,
    /// Validation script applied to a candidate answer before advancing.
    #[serde(default)]
    pub validation: Option<String>,
    /// Message key shown when validation rejects the answer.
    #[serde(default)]
    pub validation_message: Option<String>,
    #[serde(default)]
    pub min_selections: Option<u32>,
    #[serde(default)]
    pub max_selections: Option<u32>,
    /// Opaque audio reference for ACASI playback (handled by the UI layer).
    #[serde(default)]
    pub audio: Option<String>,
    pub order: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOption {
    /// Short name of the owning question.
    pub question: String,
    /// Stable index, used as the answer value for single/multi-select.
    pub index: u32,
    pub text: String,
    #[serde(default)]
    pub audio: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub key: String,
    pub language: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub checksum: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Full survey graph as downloaded from the server. The checksum in
/// `metadata` is computed over the canonical JSON of the five content
/// fields, identically on both sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionBundle {
    pub survey: SurveyMeta,
    pub sections: Vec<Section>,
    pub questions: Vec<Question>,
    pub options: Vec<QuestionOption>,
    pub messages: Vec<Message>,
    pub metadata: BundleMetadata,
}

impl DefinitionBundle {
    /// Recompute the content checksum client-side.
    pub fn content_checksum(&self) -> Result<String, DefinitionError> {
        checksum::content_checksum(
            &self.survey,
            &self.sections,
            &self.questions,
            &self.options,
            &self.messages,
        )
    }
}

/// A question with its options resolved, in presentation order.
#[derive(Debug, Clone)]
pub struct QuestionDef {
    pub question: Question,
    pub options: Vec<QuestionOption>,
}

/// Assembled, immutable view of one survey version.
#[derive(Debug)]
pub struct SurveyDefinition {
    pub survey: SurveyMeta,
    pub checksum: String,
    pub sections: Vec<Section>,
    questions: Vec<QuestionDef>,
    by_name: HashMap<String, usize>,
    messages: HashMap<(String, String), String>,
}

impl SurveyDefinition {
    /// Assemble from a bundle, verifying the checksum first.
    pub fn from_bundle(bundle: DefinitionBundle) -> Result<Self, DefinitionError> {
        let actual = bundle.content_checksum()?;
        if actual != bundle.metadata.checksum {
            return Err(DefinitionError::ChecksumMismatch {
                expected: bundle.metadata.checksum,
                actual,
            });
        }

        let mut sections = bundle.sections;
        sections.sort_by_key(|s| s.order);

        let mut questions = bundle.questions;
        questions.sort_by_key(|q| q.order);

        let mut defs: Vec<QuestionDef> = questions
            .into_iter()
            .map(|question| QuestionDef {
                question,
                options: Vec::new(),
            })
            .collect();

        let by_name: HashMap<String, usize> = defs
            .iter()
            .enumerate()
            .map(|(i, d)| (d.question.short_name.clone(), i))
            .collect();

        for option in bundle.options {
            let idx = by_name
                .get(&option.question)
                .copied()
                .ok_or_else(|| DefinitionError::UnknownQuestion(option.question.clone()))?;
            defs[idx].options.push(option);
        }
        for def in &mut defs {
            def.options.sort_by_key(|o| o.index);
        }

        let messages = bundle
            .messages
            .into_iter()
            .map(|m| ((m.key, m.language), m.text))
            .collect();

        Ok(Self {
            survey: bundle.survey,
            checksum: bundle.metadata.checksum,
            sections,
            questions: defs,
            by_name,
            messages,
        })
    }

    pub fn version(&self) -> u32 {
        self.survey.version
    }

    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    pub fn question(&self, index: usize) -> Option<&QuestionDef> {
        self.questions.get(index)
    }

    pub fn question_by_name(&self, short_name: &str) -> Option<&QuestionDef> {
        self.by_name
            .get(short_name)
            .and_then(|&i| self.questions.get(i))
    }

    pub fn questions(&self) -> &[QuestionDef] {
        &self.questions
    }

    /// Localized message lookup; falls back to the key itself so a missing
    /// translation is visible rather than blank.
    pub fn message<'a>(&'a self, key: &'a str, language: &str) -> &'a str {
        self.messages
            .get(&(key.to_string(), language.to_string()))
            .map(String::as_str)
            .unwrap_or(key)
    }
}
