use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::models::{Answer, AnswerPayload, Question};
use crate::domain::types::{AnswerStatus, QuestionKind};

/// Progress classification of an answer. Never used for scoring.
///
/// A payload whose variant does not belong to `kind` counts as unanswered.
pub fn status(kind: QuestionKind, answer: Option<&AnswerPayload>) -> AnswerStatus {
    let Some(payload) = answer else {
        return AnswerStatus::Unanswered;
    };
    if payload.kind() != kind {
        return AnswerStatus::Unanswered;
    }

    match payload {
        AnswerPayload::SelectedOption(option) => present(!option.trim().is_empty()),
        AnswerPayload::Mapping(mapping) => {
            present(mapping.values().any(|value| !value.trim().is_empty()))
        }
        AnswerPayload::OrderedStructure(slots) => {
            let filled = slots.iter().filter(|slot| slot.is_some()).count();
            if filled == 0 {
                AnswerStatus::Unanswered
            } else if filled == slots.len() {
                AnswerStatus::Answered
            } else {
                AnswerStatus::Partial
            }
        }
        AnswerPayload::FreeText(text) => present(!text.trim().is_empty()),
        AnswerPayload::AudioRef(audio_ref) => present(!audio_ref.is_empty()),
    }
}

fn present(has_content: bool) -> AnswerStatus {
    if has_content {
        AnswerStatus::Answered
    } else {
        AnswerStatus::Unanswered
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSummary {
    pub answered: usize,
    pub partial: usize,
    pub unanswered: usize,
}

impl ProgressSummary {
    pub fn total(&self) -> usize {
        self.answered + self.partial + self.unanswered
    }
}

pub fn summarize(questions: &[Question], answers: &BTreeMap<String, Answer>) -> ProgressSummary {
    questions.iter().fold(ProgressSummary::default(), |mut summary, question| {
        let payload = answers.get(&question.id).map(|answer| &answer.payload);
        match status(question.kind, payload) {
            AnswerStatus::Answered => summary.answered += 1,
            AnswerStatus::Partial => summary.partial += 1,
            AnswerStatus::Unanswered => summary.unanswered += 1,
        }
        summary
    })
}
