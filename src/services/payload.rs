use std::collections::BTreeMap;

use serde_json::Value;

use crate::core::errors::SessionError;
use crate::domain::models::{AnswerPayload, Question};
use crate::domain::types::QuestionKind;

/// Turns raw UI input into the payload variant for the question's kind.
///
/// Spoken answers are never edited by hand and are always rejected here.
pub fn encode(question: &Question, raw: &Value) -> Result<AnswerPayload, SessionError> {
    match question.kind {
        QuestionKind::SingleChoice => encode_selected_option(question, raw),
        QuestionKind::StructuredMapping => encode_mapping(raw),
        QuestionKind::OrderedStructure => encode_ordered(question, raw),
        QuestionKind::FreeText => match raw {
            Value::String(text) => Ok(AnswerPayload::FreeText(text.clone())),
            Value::Null => Ok(AnswerPayload::FreeText(String::new())),
            other => Err(mismatch(question.kind, other)),
        },
        QuestionKind::SpokenAudio => Err(SessionError::validation(
            "spoken answers can only be recorded, not edited",
        )),
    }
}

fn encode_selected_option(question: &Question, raw: &Value) -> Result<AnswerPayload, SessionError> {
    let option = match raw {
        Value::String(value) => value.trim().to_string(),
        Value::Number(value) => value.to_string(),
        other => return Err(mismatch(question.kind, other)),
    };
    if option.is_empty() {
        return Err(SessionError::validation("selected option is empty"));
    }

    let allowed = &question.constraints.allowed_options;
    if !allowed.is_empty() && !allowed.iter().any(|candidate| candidate == &option) {
        return Err(SessionError::validation(format!("unknown option '{option}'")));
    }

    Ok(AnswerPayload::SelectedOption(option))
}

fn encode_mapping(raw: &Value) -> Result<AnswerPayload, SessionError> {
    let Value::Object(entries) = raw else {
        return Err(mismatch(QuestionKind::StructuredMapping, raw));
    };

    let mut mapping = BTreeMap::new();
    for (key, value) in entries {
        let value = match value {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => {
                return Err(SessionError::validation(format!(
                    "mapping value for '{key}' must be text, got {}",
                    json_type(other)
                )))
            }
        };
        mapping.insert(key.clone(), value);
    }

    Ok(AnswerPayload::Mapping(mapping))
}

fn encode_ordered(question: &Question, raw: &Value) -> Result<AnswerPayload, SessionError> {
    let Value::Array(items) = raw else {
        return Err(mismatch(question.kind, raw));
    };

    let mut slots = items
        .iter()
        .map(|item| match item {
            Value::String(text) if text.trim().is_empty() => Ok(None),
            Value::String(text) => Ok(Some(text.clone())),
            Value::Null => Ok(None),
            other => Err(SessionError::validation(format!(
                "ordered slot must be text or empty, got {}",
                json_type(other)
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(slot_count) = question.constraints.slot_count {
        if slots.len() > slot_count {
            return Err(SessionError::validation(format!(
                "expected at most {slot_count} slots, got {}",
                slots.len()
            )));
        }
        slots.resize(slot_count, None);
    }

    Ok(AnswerPayload::OrderedStructure(slots))
}

fn mismatch(kind: QuestionKind, raw: &Value) -> SessionError {
    SessionError::validation(format!(
        "{} answer cannot be built from {}",
        kind.as_str(),
        json_type(raw)
    ))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "text",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
