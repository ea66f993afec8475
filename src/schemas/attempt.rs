use serde::{Deserialize, Serialize};

use crate::domain::models::{AnswerPayload, Question};
use crate::domain::types::{AttemptMode, AttemptType, Skill};

#[derive(Debug, Clone, Serialize)]
pub struct CreateAttemptRequest {
    pub exam_id: String,
    pub attempt_type: AttemptType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<Skill>,
}

impl CreateAttemptRequest {
    pub fn new(exam_id: &str, mode: AttemptMode) -> Self {
        Self { exam_id: exam_id.to_string(), attempt_type: mode.attempt_type(), skill: mode.skill() }
    }
}

/// Server-side status of an attempt, as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteAttemptStatus {
    Active,
    Submitted,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedAnswerRecord {
    pub question_id: String,
    #[serde(flatten)]
    pub answer: AnswerPayload,
    #[serde(default)]
    pub saved_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: String,
    pub exam_id: String,
    pub attempt_type: AttemptType,
    #[serde(default)]
    pub skill: Option<Skill>,
    pub status: RemoteAttemptStatus,
    /// Absent when the service could not compute the deadline yet.
    #[serde(default)]
    pub time_remaining_seconds: Option<u64>,
    #[serde(default)]
    pub saved_answers: Vec<SavedAnswerRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionPage {
    pub items: Vec<Question>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistAnswerRequest {
    pub question_id: String,
    #[serde(flatten)]
    pub answer: AnswerPayload,
    pub freshness_token: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistAnswerAck {
    pub question_id: String,
    /// Echo of the request's token; older services omit it.
    #[serde(default)]
    pub freshness_token: Option<u64>,
    #[serde(default)]
    pub saved_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioUploadResponse {
    pub audio_ref: String,
    #[serde(default)]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub attempt_id: String,
    pub result_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsResponse {
    pub skills: Vec<Skill>,
}
