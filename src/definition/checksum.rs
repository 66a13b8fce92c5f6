//! Canonical content checksum for survey definitions.
//!
//! Staleness is decided by content, not by a version counter: the server and
//! the client both hash the canonical JSON of
//! `{survey, sections, questions, options, messages}`. Canonical means
//! object keys are emitted in sorted order at every nesting level, so the
//! same content hashes identically regardless of how a serializer ordered
//! its maps.

use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use super::{DefinitionError, Message, Question, QuestionOption, Section, SurveyMeta};

/// SHA-256 over the canonical JSON of the definition content.
pub fn content_checksum(
    survey: &SurveyMeta,
    sections: &[Section],
    questions: &[Question],
    options: &[QuestionOption],
    messages: &[Message],
) -> Result<String, DefinitionError> {
    let content = serde_json::json!({
        "survey": to_json(survey)?,
        "sections": to_json(sections)?,
        "questions": to_json(questions)?,
        "options": to_json(options)?,
        "messages": to_json(messages)?,
    });

    let mut canonical = String::new();
    write_canonical(&content, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<JsonValue, DefinitionError> {
    Ok(serde_json::to_value(value)?)
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        JsonValue::Number(n) => out.push_str(&n.to_string()),
        JsonValue::String(s) => {
            // serde_json handles escaping; a String never fails to serialize.
            out.push_str(&serde_json::to_string(s).unwrap_or_default());
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::testutil::sample_bundle;

    #[test]
    fn test_checksum_is_deterministic() {
        let bundle = sample_bundle();
        let a = bundle.content_checksum().unwrap();
        let b = bundle.content_checksum().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_checksum_ignores_key_ordering() {
        // Two objects with the same content but different key insertion
        // order must canonicalize identically.
        let a: JsonValue = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: JsonValue = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();

        let mut ca = String::new();
        write_canonical(&a, &mut ca);
        let mut cb = String::new();
        write_canonical(&b, &mut cb);
        assert_eq!(ca, cb);
        assert_eq!(ca, r#"{"a":{"x":3,"y":2},"b":1}"#);
    }

    #[test]
    fn test_any_content_change_changes_checksum() {
        let base = sample_bundle();
        let baseline = base.content_checksum().unwrap();

        let mut changed_question = base.clone();
        changed_question.questions[2].statement = "Different wording".into();
        assert_ne!(changed_question.content_checksum().unwrap(), baseline);

        let mut changed_option = base.clone();
        changed_option.options[0].text = "Yes, definitely".into();
        assert_ne!(changed_option.content_checksum().unwrap(), baseline);

        let mut changed_message = base.clone();
        changed_message.messages[0].text = "Other text".into();
        assert_ne!(changed_message.content_checksum().unwrap(), baseline);
    }
}
