use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::core::errors::{ErrorClass, SessionError};
use crate::domain::models::{Answer, AnswerPayload, Attempt, Question};
use crate::domain::types::{AttemptStatus, CaptureState, SessionPhase, Skill, SyncState};
use crate::session::navigation;

/// A user-facing failure kept in the state so subscribers can render it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionFailure {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&SessionError> for SessionFailure {
    fn from(err: &SessionError) -> Self {
        Self { class: err.class(), message: err.user_message() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub sent: u64,
    pub total: u64,
}

/// Observable view of one spoken-answer capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureSnapshot {
    pub question_id: String,
    pub state: CaptureState,
    pub prep_remaining_seconds: u64,
    pub elapsed_seconds: u64,
    pub min_duration_seconds: u64,
    pub max_duration_seconds: u64,
    pub recorded_bytes: u64,
    pub upload_attempt_count: u32,
    pub upload_progress: Option<TransferProgress>,
    pub error: Option<SessionFailure>,
}

impl CaptureSnapshot {
    /// Whether a stop control may be offered right now.
    pub fn can_stop(&self) -> bool {
        self.state == CaptureState::Recording && self.elapsed_seconds >= self.min_duration_seconds
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub exam_id: Option<String>,
    pub available_skills: Vec<Skill>,
    pub attempt: Option<Attempt>,
    pub questions: Vec<Question>,
    pub current_index: usize,
    pub answers: BTreeMap<String, Answer>,
    pub captures: BTreeMap<String, CaptureSnapshot>,
    pub error: Option<SessionFailure>,
    /// Set after a failed submit; a manual submit may be tried again.
    pub retry_submit_available: bool,
    pub result_ref: Option<String>,
}

impl SessionState {
    pub fn current_question(&self) -> Option<&Question> {
        self.questions.get(self.current_index)
    }

    pub fn question(&self, question_id: &str) -> Option<&Question> {
        self.questions.iter().find(|question| question.id == question_id)
    }

    pub fn question_index(&self, question_id: &str) -> Option<usize> {
        self.questions.iter().position(|question| question.id == question_id)
    }

    pub fn answer(&self, question_id: &str) -> Option<&Answer> {
        self.answers.get(question_id)
    }

    pub fn capture(&self, question_id: &str) -> Option<&CaptureSnapshot> {
        self.captures.get(question_id)
    }

    pub fn attempt_id(&self) -> Option<&str> {
        self.attempt.as_ref().map(|attempt| attempt.id.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    AwaitModeSelection { exam_id: String, skills: Vec<Skill> },
    BeginInitialization { exam_id: String },
    AttemptLoaded {
        attempt: Attempt,
        questions: Vec<Question>,
        answers: BTreeMap<String, Answer>,
        current_index: usize,
    },
    Tick,
    Navigate { index: usize },
    LocalEdit { question_id: String, payload: AnswerPayload, at: OffsetDateTime },
    Resave { question_id: String },
    PersistStarted { question_id: String, token: u64 },
    PersistSucceeded { question_id: String, token: u64 },
    PersistFailed { question_id: String, token: u64, message: String },
    AnswerFinalized { question_id: String, audio_ref: String, at: OffsetDateTime },
    CaptureUpdated(CaptureSnapshot),
    CaptureProgress { question_id: String, progress: TransferProgress },
    CapturesCleared,
    SubmitStarted,
    Submitted { result_ref: String },
    SubmitFailed(SessionFailure),
    Failed(SessionFailure),
    Reset,
}

/// Single owner of [`SessionState`]. Every mutation goes through [`dispatch`].
///
/// [`dispatch`]: SessionStore::dispatch
#[derive(Clone)]
pub struct SessionStore {
    sender: Arc<watch::Sender<SessionState>>,
}

impl SessionStore {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(SessionState::default());
        Self { sender: Arc::new(sender) }
    }

    /// Applies `action` and returns the state it produced.
    ///
    /// Subscribers are only woken when the action changed something.
    pub fn dispatch(&self, action: Action) -> SessionState {
        let mut next = SessionState::default();
        self.sender.send_if_modified(|state| {
            let changed = reduce(state, action);
            next = state.clone();
            changed
        });
        next
    }

    pub fn state(&self) -> SessionState {
        self.sender.borrow().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.sender.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.sender.subscribe()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.sender.borrow();
        f.debug_struct("SessionStore")
            .field("phase", &state.phase)
            .field("attempt_id", &state.attempt_id())
            .finish()
    }
}

pub(crate) fn reduce(state: &mut SessionState, action: Action) -> bool {
    match action {
        Action::AwaitModeSelection { exam_id, skills } => {
            state.phase = SessionPhase::AwaitingModeSelection;
            state.exam_id = Some(exam_id);
            state.available_skills = skills;
            state.error = None;
            true
        }
        Action::BeginInitialization { exam_id } => {
            state.phase = SessionPhase::Initializing;
            state.exam_id = Some(exam_id);
            state.error = None;
            true
        }
        Action::AttemptLoaded { mut attempt, questions, answers, current_index } => {
            attempt.status = AttemptStatus::Active;
            state.phase = SessionPhase::Active;
            state.attempt = Some(attempt);
            state.current_index = current_index.min(questions.len().saturating_sub(1));
            state.questions = questions;
            state.answers = answers;
            state.captures.clear();
            state.error = None;
            state.retry_submit_available = false;
            state.result_ref = None;
            true
        }
        Action::Tick => tick(state),
        Action::Navigate { index } => {
            if state.phase != SessionPhase::Active
                || index == state.current_index
                || !navigation::can_navigate(state, state.current_index, index)
            {
                return false;
            }
            state.current_index = index;
            true
        }
        Action::LocalEdit { question_id, payload, at } => {
            if state.phase != SessionPhase::Active {
                return false;
            }
            let token = state.answers.get(&question_id).map_or(1, |answer| answer.freshness_token + 1);
            state.answers.insert(
                question_id.clone(),
                Answer {
                    question_id,
                    payload,
                    sync_state: SyncState::LocalOnly,
                    answered_at: at,
                    freshness_token: token,
                    error: None,
                },
            );
            true
        }
        Action::Resave { question_id } => {
            let Some(answer) = state.answers.get_mut(&question_id) else {
                return false;
            };
            answer.freshness_token += 1;
            answer.sync_state = SyncState::LocalOnly;
            answer.error = None;
            true
        }
        Action::PersistStarted { question_id, token } => {
            update_current(state, &question_id, token, |answer| {
                answer.sync_state = SyncState::Saving;
            })
        }
        Action::PersistSucceeded { question_id, token } => {
            update_current(state, &question_id, token, |answer| {
                answer.sync_state = SyncState::Saved;
                answer.error = None;
            })
        }
        Action::PersistFailed { question_id, token, message } => {
            update_current(state, &question_id, token, |answer| {
                answer.sync_state = SyncState::Error;
                answer.error = Some(message);
            })
        }
        Action::AnswerFinalized { question_id, audio_ref, at } => {
            let previous = state.answers.get(&question_id);
            if previous.is_some_and(|answer| answer.sync_state == SyncState::Saved) {
                return false;
            }
            let token = previous.map_or(1, |answer| answer.freshness_token + 1);
            state.answers.insert(
                question_id.clone(),
                Answer {
                    question_id,
                    payload: AnswerPayload::AudioRef(audio_ref),
                    sync_state: SyncState::Saved,
                    answered_at: at,
                    freshness_token: token,
                    error: None,
                },
            );
            true
        }
        Action::CaptureUpdated(snapshot) => {
            if state.attempt.is_none() || state.phase.is_terminal() {
                return false;
            }
            state.captures.insert(snapshot.question_id.clone(), snapshot);
            true
        }
        Action::CaptureProgress { question_id, progress } => {
            match state.captures.get_mut(&question_id) {
                Some(snapshot) if snapshot.state == CaptureState::Uploading => {
                    snapshot.upload_progress = Some(progress);
                    true
                }
                _ => false,
            }
        }
        Action::CapturesCleared => {
            let changed = !state.captures.is_empty();
            state.captures.clear();
            changed
        }
        Action::SubmitStarted => {
            state.phase = SessionPhase::Submitting;
            set_status(state, AttemptStatus::Submitting);
            state.error = None;
            state.retry_submit_available = false;
            true
        }
        Action::Submitted { result_ref } => {
            state.phase = SessionPhase::Submitted;
            set_status(state, AttemptStatus::Submitted);
            state.result_ref = Some(result_ref);
            state.retry_submit_available = false;
            true
        }
        Action::SubmitFailed(failure) => {
            state.phase = SessionPhase::Error;
            set_status(state, AttemptStatus::Error);
            state.error = Some(failure);
            state.retry_submit_available = true;
            true
        }
        Action::Failed(failure) => {
            state.phase = SessionPhase::Error;
            state.attempt = None;
            state.questions.clear();
            state.answers.clear();
            state.captures.clear();
            state.current_index = 0;
            state.error = Some(failure);
            state.retry_submit_available = false;
            true
        }
        Action::Reset => {
            *state = SessionState::default();
            true
        }
    }
}

fn tick(state: &mut SessionState) -> bool {
    if state.phase != SessionPhase::Active {
        return false;
    }
    let Some(attempt) = state.attempt.as_mut() else {
        return false;
    };
    if !attempt.timer_initialized {
        return false;
    }

    attempt.time_remaining_seconds = attempt.time_remaining_seconds.saturating_sub(1);
    if attempt.time_remaining_seconds == 0 {
        attempt.status = AttemptStatus::TimeExpired;
        state.phase = SessionPhase::TimeExpired;
    }
    true
}

/// Applies `f` only while `token` is still the latest edit for the question.
fn update_current(
    state: &mut SessionState,
    question_id: &str,
    token: u64,
    f: impl FnOnce(&mut Answer),
) -> bool {
    match state.answers.get_mut(question_id) {
        Some(answer) if answer.freshness_token == token => {
            f(answer);
            true
        }
        _ => false,
    }
}

fn set_status(state: &mut SessionState, status: AttemptStatus) {
    if let Some(attempt) = state.attempt.as_mut() {
        attempt.status = status;
    }
}
