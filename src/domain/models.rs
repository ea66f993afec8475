use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::core::config::CaptureSettings;
use crate::domain::types::{AttemptStatus, AttemptType, QuestionKind, Skill, SyncState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub id: String,
    pub exam_id: String,
    pub attempt_type: AttemptType,
    pub selected_skill: Option<Skill>,
    pub status: AttemptStatus,
    pub time_remaining_seconds: u64,
    /// Set once the remaining time came from the server. The countdown never
    /// runs before this is true.
    pub timer_initialized: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestionConstraints {
    #[serde(default)]
    pub max_score: Option<f64>,
    #[serde(default)]
    pub time_limit_seconds: Option<u64>,
    #[serde(default)]
    pub prep_seconds: Option<u64>,
    #[serde(default)]
    pub min_duration_seconds: Option<u64>,
    #[serde(default)]
    pub max_duration_seconds: Option<u64>,
    /// Number of positions an ordered structure must fill.
    #[serde(default)]
    pub slot_count: Option<usize>,
    /// Option ids a single-choice answer may reference; empty means unchecked.
    #[serde(default)]
    pub allowed_options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub order_index: u32,
    pub kind: QuestionKind,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub constraints: QuestionConstraints,
}

/// Timing of one spoken-answer capture after per-question overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    pub prep_seconds: u64,
    pub min_duration_seconds: u64,
    pub max_duration_seconds: u64,
    pub min_bytes: u64,
    pub max_bytes: u64,
}

impl Question {
    pub fn capture_limits(&self, defaults: &CaptureSettings) -> CaptureLimits {
        let max_duration_seconds =
            self.constraints.max_duration_seconds.unwrap_or(defaults.max_duration_seconds).max(1);
        let min_duration_seconds = self
            .constraints
            .min_duration_seconds
            .unwrap_or(defaults.min_duration_seconds)
            .min(max_duration_seconds);
        CaptureLimits {
            prep_seconds: self.constraints.prep_seconds.unwrap_or(defaults.prep_seconds),
            min_duration_seconds,
            max_duration_seconds,
            min_bytes: defaults.min_bytes,
            max_bytes: defaults.max_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "answer_type", content = "payload")]
pub enum AnswerPayload {
    SelectedOption(String),
    Mapping(BTreeMap<String, String>),
    OrderedStructure(Vec<Option<String>>),
    FreeText(String),
    AudioRef(String),
}

impl AnswerPayload {
    pub fn answer_type(&self) -> &'static str {
        match self {
            AnswerPayload::SelectedOption(_) => "selected_option",
            AnswerPayload::Mapping(_) => "mapping",
            AnswerPayload::OrderedStructure(_) => "ordered_structure",
            AnswerPayload::FreeText(_) => "free_text",
            AnswerPayload::AudioRef(_) => "audio_ref",
        }
    }

    /// The question kind this payload variant belongs to.
    pub fn kind(&self) -> QuestionKind {
        match self {
            AnswerPayload::SelectedOption(_) => QuestionKind::SingleChoice,
            AnswerPayload::Mapping(_) => QuestionKind::StructuredMapping,
            AnswerPayload::OrderedStructure(_) => QuestionKind::OrderedStructure,
            AnswerPayload::FreeText(_) => QuestionKind::FreeText,
            AnswerPayload::AudioRef(_) => QuestionKind::SpokenAudio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Answer {
    pub question_id: String,
    pub payload: AnswerPayload,
    pub sync_state: SyncState,
    #[serde(with = "time::serde::rfc3339")]
    pub answered_at: OffsetDateTime,
    /// Latest local edit counter; responses carrying an older value are stale.
    pub freshness_token: u64,
    /// Actionable message while `sync_state` is `Error`.
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spoken(constraints: QuestionConstraints) -> Question {
        Question {
            id: "q1".into(),
            order_index: 1,
            kind: QuestionKind::SpokenAudio,
            content: json!({"prompt": "Describe your town"}),
            constraints,
        }
    }

    #[test]
    fn capture_limits_fall_back_to_settings() {
        let limits = spoken(QuestionConstraints::default()).capture_limits(&CaptureSettings::default());
        assert_eq!(limits.prep_seconds, 5);
        assert_eq!(limits.min_duration_seconds, 10);
        assert_eq!(limits.max_duration_seconds, 30);
    }

    #[test]
    fn capture_limits_clamp_min_to_max() {
        let question = spoken(QuestionConstraints {
            min_duration_seconds: Some(45),
            max_duration_seconds: Some(20),
            prep_seconds: Some(0),
            ..QuestionConstraints::default()
        });
        let limits = question.capture_limits(&CaptureSettings::default());
        assert_eq!(limits.prep_seconds, 0);
        assert_eq!(limits.max_duration_seconds, 20);
        assert_eq!(limits.min_duration_seconds, 20);
    }

    #[test]
    fn payload_serializes_with_answer_type_tag() {
        let payload = AnswerPayload::Mapping(BTreeMap::from([("a".to_string(), "x".to_string())]));
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"answer_type": "mapping", "payload": {"a": "x"}})
        );
        assert_eq!(payload.kind(), QuestionKind::StructuredMapping);
    }

    #[test]
    fn question_deserializes_without_constraints() {
        let question: Question = serde_json::from_value(json!({
            "id": "q7",
            "order_index": 7,
            "kind": "free-text",
        }))
        .unwrap();
        assert_eq!(question.kind, QuestionKind::FreeText);
        assert!(question.constraints.allowed_options.is_empty());
    }
}
