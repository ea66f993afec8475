use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptType {
    FullExam,
    SingleSkill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Skill {
    Listening,
    Reading,
    Writing,
    Speaking,
}

impl Skill {
    pub fn as_str(self) -> &'static str {
        match self {
            Skill::Listening => "listening",
            Skill::Reading => "reading",
            Skill::Writing => "writing",
            Skill::Speaking => "speaking",
        }
    }
}

/// How the student chose to take the exam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "attempt_type", content = "skill")]
pub enum AttemptMode {
    FullExam,
    SingleSkill(Skill),
}

impl AttemptMode {
    pub fn attempt_type(self) -> AttemptType {
        match self {
            AttemptMode::FullExam => AttemptType::FullExam,
            AttemptMode::SingleSkill(_) => AttemptType::SingleSkill,
        }
    }

    pub fn skill(self) -> Option<Skill> {
        match self {
            AttemptMode::FullExam => None,
            AttemptMode::SingleSkill(skill) => Some(skill),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    AwaitingStart,
    Active,
    TimeExpired,
    Submitting,
    Submitted,
    Error,
}

/// Lifecycle of the session controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Uninitialized,
    AwaitingModeSelection,
    Initializing,
    Active,
    TimeExpired,
    Submitting,
    Submitted,
    Error,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Submitted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionKind {
    SingleChoice,
    StructuredMapping,
    OrderedStructure,
    FreeText,
    SpokenAudio,
}

impl QuestionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionKind::SingleChoice => "single-choice",
            QuestionKind::StructuredMapping => "structured-mapping",
            QuestionKind::OrderedStructure => "ordered-structure",
            QuestionKind::FreeText => "free-text",
            QuestionKind::SpokenAudio => "spoken-audio",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    LocalOnly,
    Saving,
    Saved,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    #[default]
    Idle,
    Preparing,
    Recording,
    Uploading,
    Completed,
    Failed,
}

impl CaptureState {
    /// A timed capture is running; the student may not leave the question.
    pub fn blocks_navigation(self) -> bool {
        matches!(self, CaptureState::Preparing | CaptureState::Recording)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, CaptureState::Completed | CaptureState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Unanswered,
    Partial,
    Answered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitTrigger {
    Manual,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavTarget {
    Next,
    Previous,
    Index(usize),
}
