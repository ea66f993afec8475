use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;

use crate::core::config::Settings;
use crate::core::errors::SessionError;
use crate::core::{metrics, time};
use crate::domain::models::{Answer, Attempt, Question};
use crate::domain::types::{
    AnswerStatus, AttemptMode, AttemptStatus, NavTarget, QuestionKind, SessionPhase, Skill,
    SubmitTrigger, SyncState,
};
use crate::schemas::attempt::{AttemptRecord, CreateAttemptRequest, RemoteAttemptStatus, SavedAnswerRecord};
use crate::services::attempt_api::{AttemptService, HttpAttemptService};
use crate::services::flags::{FileFlagStore, FlagStore};
use crate::services::retry::RetryPolicy;
use crate::services::status::{self, ProgressSummary};
use crate::session::capture::{CaptureContext, CaptureHandle, CaptureRequest, CompletionHook};
use crate::session::device::{DeviceGate, RecordingDevice};
use crate::session::navigation;
use crate::session::store::{Action, CaptureSnapshot, SessionFailure, SessionState, SessionStore};
use crate::session::sync::AnswerSynchronizer;
use crate::session::timer::CountdownTimer;

/// Drives one exam attempt from entry to submission.
///
/// Cheap to clone; all clones share the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    settings: Settings,
    api: Arc<dyn AttemptService>,
    flags: Arc<dyn FlagStore>,
    store: SessionStore,
    timer: CountdownTimer,
    sync: AnswerSynchronizer,
    capture_ctx: CaptureContext,
    captures: Mutex<HashMap<String, CaptureHandle>>,
    submit_lock: tokio::sync::Mutex<()>,
}

impl SessionController {
    pub fn new(
        settings: Settings,
        api: Arc<dyn AttemptService>,
        flags: Arc<dyn FlagStore>,
        device: Arc<dyn RecordingDevice>,
    ) -> Self {
        let store = SessionStore::new();
        let retry = RetryPolicy::from_settings(settings.retry());
        let sync = AnswerSynchronizer::new(store.clone(), api.clone(), retry);
        let capture_ctx = CaptureContext {
            store: store.clone(),
            api: api.clone(),
            gate: DeviceGate::new(device),
            sync: sync.clone(),
            retry,
            auto_advance_delay: settings.capture().auto_advance_delay(),
        };

        Self {
            inner: Arc::new(ControllerInner {
                timer: CountdownTimer::new(store.clone()),
                settings,
                api,
                flags,
                store,
                sync,
                capture_ctx,
                captures: Mutex::new(HashMap::new()),
                submit_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// HTTP attempt service and JSON flag file, both taken from `settings`.
    pub fn from_settings(
        settings: Settings,
        device: Arc<dyn RecordingDevice>,
    ) -> Result<Self, SessionError> {
        let api = Arc::new(HttpAttemptService::from_settings(&settings)?);
        let flags = Arc::new(FileFlagStore::new(settings.flags().path.clone()));
        Ok(Self::new(settings, api, flags, device))
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn state(&self) -> SessionState {
        self.inner.store.state()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<SessionState> {
        self.inner.store.subscribe()
    }

    /// Entry point: resume `attempt_id`, start `preset` right away, or wait
    /// for the student to pick a mode.
    pub async fn resolve_entry(
        &self,
        exam_id: &str,
        attempt_id: Option<&str>,
        preset: Option<AttemptMode>,
    ) -> Result<SessionState, SessionError> {
        let phase = self.inner.store.read(|state| state.phase);
        if phase != SessionPhase::Uninitialized {
            return Err(SessionError::invalid_state("an attempt is already open; exit it first"));
        }

        if let Some(attempt_id) = attempt_id {
            self.inner.store.dispatch(Action::BeginInitialization { exam_id: exam_id.to_string() });
            let resumed = self.resume(exam_id, attempt_id).await;
            return resumed.map_err(|err| self.fail_initialization(err));
        }

        if let Some(mode) = preset {
            self.inner.store.dispatch(Action::BeginInitialization { exam_id: exam_id.to_string() });
            return self.create(exam_id, mode).await.map_err(|err| self.fail_initialization(err));
        }

        let skills = self
            .inner
            .api
            .list_skills(exam_id)
            .await
            .map_err(|err| self.fail_initialization(err))?;
        tracing::info!(exam_id, skills = skills.len(), "Awaiting mode selection");
        Ok(self.inner.store.dispatch(Action::AwaitModeSelection {
            exam_id: exam_id.to_string(),
            skills,
        }))
    }

    pub async fn start_attempt(&self, mode: AttemptMode) -> Result<SessionState, SessionError> {
        let (phase, exam_id, skills) = self.inner.store.read(|state| {
            (state.phase, state.exam_id.clone(), state.available_skills.clone())
        });
        if phase != SessionPhase::AwaitingModeSelection {
            return Err(SessionError::invalid_state("choose a mode from the exam entry screen"));
        }
        let exam_id = exam_id.ok_or_else(|| SessionError::invalid_state("no exam selected"))?;
        if let AttemptMode::SingleSkill(skill) = mode {
            if !skills.is_empty() && !skills.contains(&skill) {
                return Err(SessionError::validation(format!(
                    "{} is not offered for this exam",
                    skill.as_str()
                )));
            }
        }

        self.inner.store.dispatch(Action::BeginInitialization { exam_id: exam_id.clone() });
        self.create(&exam_id, mode).await.map_err(|err| self.fail_initialization(err))
    }

    async fn create(&self, exam_id: &str, mode: AttemptMode) -> Result<SessionState, SessionError> {
        let created =
            self.inner.api.create_attempt(&CreateAttemptRequest::new(exam_id, mode)).await?;
        let record = if created.time_remaining_seconds.is_some() {
            created
        } else {
            tracing::debug!(attempt_id = %created.id, "Create response had no remaining time; fetching attempt");
            self.inner.api.fetch_attempt(&created.id).await?
        };
        self.load(exam_id, record).await
    }

    async fn resume(&self, exam_id: &str, attempt_id: &str) -> Result<SessionState, SessionError> {
        let record = self.inner.api.fetch_attempt(attempt_id).await?;
        if record.exam_id != exam_id {
            return Err(SessionError::Initialization(format!(
                "attempt {attempt_id} belongs to another exam"
            )));
        }
        self.load(exam_id, record).await
    }

    async fn load(&self, exam_id: &str, record: AttemptRecord) -> Result<SessionState, SessionError> {
        match record.status {
            RemoteAttemptStatus::Active => {}
            RemoteAttemptStatus::Submitted => {
                return Err(SessionError::Initialization("attempt was already submitted".into()))
            }
            RemoteAttemptStatus::Expired => {
                return Err(SessionError::Initialization("attempt time has run out".into()))
            }
        }
        let remaining = record.time_remaining_seconds.ok_or_else(|| {
            SessionError::Initialization("service did not report the remaining time".into())
        })?;

        let mut questions = self.inner.api.list_questions(&record.id).await?;
        if questions.is_empty() {
            return Err(SessionError::Initialization("attempt has no questions".into()));
        }
        questions.sort_by_key(|question| question.order_index);

        let answers = restore_answers(&questions, record.saved_answers);
        let current_index = resume_index(&questions, &answers);
        let attempt = Attempt {
            id: record.id,
            exam_id: exam_id.to_string(),
            attempt_type: record.attempt_type,
            selected_skill: record.skill,
            status: AttemptStatus::Active,
            time_remaining_seconds: remaining,
            timer_initialized: true,
        };
        tracing::info!(
            attempt_id = %attempt.id,
            exam_id,
            questions = questions.len(),
            restored_answers = answers.len(),
            remaining_seconds = remaining,
            "Attempt active"
        );

        let state = self.inner.store.dispatch(Action::AttemptLoaded {
            attempt,
            questions,
            answers,
            current_index,
        });
        self.start_timer()?;
        Ok(state)
    }

    fn fail_initialization(&self, err: SessionError) -> SessionError {
        tracing::error!(error = %err, "Attempt initialization failed");
        self.inner.timer.cancel();
        self.inner.store.dispatch(Action::Failed(SessionFailure::from(&err)));
        err
    }

    fn start_timer(&self) -> Result<(), SessionError> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.timer.start(Box::new(move || {
            let Some(controller) = upgrade(&weak) else {
                return;
            };
            tokio::spawn(async move {
                if let Err(err) = controller.submit(SubmitTrigger::Timeout).await {
                    tracing::error!(error = %err, "Forced submit failed");
                }
            });
        }))?;
        Ok(())
    }

    pub fn can_navigate(&self, to: usize) -> bool {
        self.inner.store.read(|state| {
            state.phase == SessionPhase::Active
                && navigation::can_navigate(state, state.current_index, to)
        })
    }

    pub fn navigate(&self, target: NavTarget) -> Result<usize, SessionError> {
        let (phase, from, len) =
            self.inner.store.read(|state| (state.phase, state.current_index, state.questions.len()));
        if phase != SessionPhase::Active {
            return Err(SessionError::invalid_state("navigation is only possible during the attempt"));
        }
        let to = navigation::resolve_target(from, target, len)
            .ok_or_else(|| SessionError::invalid_state("there is no question there"))?;
        if to == from {
            return Ok(to);
        }

        let moved = self.inner.store.dispatch(Action::Navigate { index: to });
        if moved.current_index != to {
            return Err(SessionError::invalid_state("navigation is locked for this question"));
        }

        self.captures().retain(|_, handle| !handle.is_finished());
        tracing::debug!(from, to, "Navigated");
        Ok(to)
    }

    pub fn edit_answer(&self, question_id: &str, raw: &Value) -> Result<Answer, SessionError> {
        self.inner.sync.apply_local_edit(question_id, raw)
    }

    pub fn retry_answer(&self, question_id: &str) -> Result<(), SessionError> {
        self.inner.sync.retry_answer(question_id)
    }

    /// Starts the prep countdown for the current spoken question.
    pub fn start_capture(&self) -> Result<CaptureSnapshot, SessionError> {
        let state = self.inner.store.state();
        if state.phase != SessionPhase::Active {
            return Err(SessionError::invalid_state("recording is only possible during the attempt"));
        }
        let attempt_id = state
            .attempt_id()
            .map(str::to_string)
            .ok_or_else(|| SessionError::invalid_state("no attempt loaded"))?;
        let question = state
            .current_question()
            .ok_or_else(|| SessionError::invalid_state("no current question"))?;
        if question.kind != QuestionKind::SpokenAudio {
            return Err(SessionError::invalid_state("the current question is not a spoken answer"));
        }
        if state.answer(&question.id).is_some_and(|answer| answer.sync_state == SyncState::Saved) {
            return Err(SessionError::invalid_state("this answer was already recorded"));
        }

        let mut captures = self.captures();
        if captures.values().any(CaptureHandle::is_active) {
            return Err(SessionError::invalid_state("another recording is still in progress"));
        }

        let weak = Arc::downgrade(&self.inner);
        let on_complete: CompletionHook = Box::new(move |question_id| {
            if let Some(controller) = upgrade(&weak) {
                controller.advance_after_capture(&question_id);
            }
        });
        let request = CaptureRequest {
            attempt_id,
            question_id: question.id.clone(),
            limits: question.capture_limits(self.inner.settings.capture()),
        };
        let handle = CaptureHandle::spawn(self.inner.capture_ctx.clone(), request, on_complete);
        let snapshot = handle
            .snapshot()
            .ok_or_else(|| SessionError::invalid_state("attempt closed while starting the recording"))?;
        captures.insert(question.id.clone(), handle);
        Ok(snapshot)
    }

    /// Manual stop of the current recording; refused before the minimum
    /// duration.
    pub fn stop_capture(&self) -> Result<(), SessionError> {
        let question_id = self
            .inner
            .store
            .read(|state| state.current_question().map(|question| question.id.clone()))
            .ok_or_else(|| SessionError::invalid_state("no current question"))?;
        let captures = self.captures();
        let handle = captures
            .get(&question_id)
            .ok_or_else(|| SessionError::invalid_state("nothing is being recorded"))?;
        handle.request_stop()
    }

    fn advance_after_capture(&self, question_id: &str) {
        let still_current = self.inner.store.read(|state| {
            state.phase == SessionPhase::Active
                && state.current_question().is_some_and(|question| question.id == question_id)
        });
        if !still_current {
            tracing::debug!(question_id, "Skipping auto-advance; student already moved on");
            return;
        }
        match self.navigate(NavTarget::Next) {
            Ok(index) => tracing::info!(question_id, index, "Auto-advanced after recording"),
            Err(err) => tracing::debug!(question_id, error = %err, "No question to auto-advance to"),
        }
    }

    pub async fn submit(&self, trigger: SubmitTrigger) -> Result<SessionState, SessionError> {
        let _guard = self.inner.submit_lock.lock().await;
        let state = self.inner.store.state();
        let allowed = match state.phase {
            SessionPhase::Active | SessionPhase::TimeExpired => true,
            SessionPhase::Error => trigger == SubmitTrigger::Manual && state.retry_submit_available,
            SessionPhase::Submitted => {
                tracing::debug!(trigger = ?trigger, "Attempt already submitted");
                return Ok(state);
            }
            _ => false,
        };
        if !allowed {
            return Err(SessionError::invalid_state("the attempt cannot be submitted now"));
        }
        if trigger == SubmitTrigger::Manual && self.captures().values().any(CaptureHandle::is_active) {
            return Err(SessionError::invalid_state("finish the current recording before submitting"));
        }
        let attempt_id = state
            .attempt_id()
            .map(str::to_string)
            .ok_or_else(|| SessionError::invalid_state("no attempt loaded"))?;

        if trigger == SubmitTrigger::Manual && state.phase == SessionPhase::Active {
            self.inner.sync.flush().await;
            let unsaved = self.inner.sync.failed_answers();
            if !unsaved.is_empty() {
                tracing::warn!(attempt_id = %attempt_id, unsaved = ?unsaved, "Submit refused; answers not saved");
                return Err(SessionError::invalid_state(format!(
                    "answers to {} were not saved; press Retry on them before submitting",
                    unsaved.join(", ")
                )));
            }
        }

        self.inner.timer.cancel();
        let uploads = self.stop_captures();
        if trigger == SubmitTrigger::Timeout {
            metrics::record_forced_submit();
        }
        tracing::info!(attempt_id = %attempt_id, trigger = ?trigger, "Submitting attempt");
        self.inner.store.dispatch(Action::SubmitStarted);
        for upload in uploads {
            tracing::info!(question_id = %upload.question_id(), "Waiting for recording upload before submit");
            upload.settle().await;
        }
        self.inner.store.dispatch(Action::CapturesCleared);
        self.inner.sync.flush().await;
        if trigger == SubmitTrigger::Timeout {
            let unsaved = self.inner.sync.resave_failed().await;
            if !unsaved.is_empty() {
                tracing::error!(attempt_id = %attempt_id, unsaved = ?unsaved, "Submitting with answers that could not be saved");
            }
        }

        let mut result = self.inner.api.submit_attempt(&attempt_id).await;
        if trigger == SubmitTrigger::Timeout {
            if let Err(err) = &result {
                let delay = self.inner.settings.submit().timeout_retry_delay();
                tracing::warn!(
                    attempt_id = %attempt_id,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Forced submit failed; retrying once"
                );
                tokio::time::sleep(delay).await;
                result = self.inner.api.submit_attempt(&attempt_id).await;
            }
        }

        match result {
            Ok(response) => {
                metrics::record_submit("submitted");
                tracing::info!(attempt_id = %attempt_id, result_ref = %response.result_ref, "Attempt submitted");
                Ok(self.inner.store.dispatch(Action::Submitted { result_ref: response.result_ref }))
            }
            Err(err) => {
                metrics::record_submit("failed");
                tracing::error!(attempt_id = %attempt_id, error = %err, "Attempt submit failed");
                self.inner.store.dispatch(Action::SubmitFailed(SessionFailure::from(&err)));
                Err(err)
            }
        }
    }

    /// Whether the one-time device check should run before this attempt.
    pub fn calibration_required(&self) -> Result<bool, SessionError> {
        let (exam_id, skill, has_spoken) = self.attempt_scope()?;
        if !has_spoken {
            return Ok(false);
        }
        Ok(!self.inner.flags.is_calibrated(&exam_id, skill)?)
    }

    pub fn complete_calibration(&self) -> Result<(), SessionError> {
        let (exam_id, skill, _) = self.attempt_scope()?;
        self.inner.flags.mark_calibrated(&exam_id, skill)
    }

    fn attempt_scope(&self) -> Result<(String, Option<Skill>, bool), SessionError> {
        self.inner.store.read(|state| {
            let attempt =
                state.attempt.as_ref().ok_or_else(|| SessionError::invalid_state("no attempt loaded"))?;
            let has_spoken =
                state.questions.iter().any(|question| question.kind == QuestionKind::SpokenAudio);
            Ok((attempt.exam_id.clone(), attempt.selected_skill, has_spoken))
        })
    }

    pub fn progress(&self) -> ProgressSummary {
        self.inner.store.read(|state| status::summarize(&state.questions, &state.answers))
    }

    /// Stops every background process and forgets the attempt.
    pub fn exit(&self) {
        let attempt_id = self.inner.store.read(|state| state.attempt_id().map(str::to_string));
        self.inner.teardown();
        self.inner.store.dispatch(Action::Reset);
        tracing::info!(attempt_id = attempt_id.as_deref().unwrap_or_default(), "Session closed");
    }

    /// Cancels captures still preparing or recording. Captures whose audio is
    /// already uploading are handed back to be waited on.
    fn stop_captures(&self) -> Vec<CaptureHandle> {
        let (uploading, cancelled): (Vec<CaptureHandle>, Vec<CaptureHandle>) =
            self.captures().drain().map(|(_, handle)| handle).partition(CaptureHandle::is_uploading);
        if !cancelled.is_empty() {
            tracing::debug!(count = cancelled.len(), "Cancelling captures");
        }
        drop(cancelled);
        uploading
    }

    fn captures(&self) -> std::sync::MutexGuard<'_, HashMap<String, CaptureHandle>> {
        self.inner.captures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ControllerInner {
    fn teardown(&self) {
        self.timer.cancel();
        self.captures.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.sync.abort_all();
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn upgrade(weak: &Weak<ControllerInner>) -> Option<SessionController> {
    weak.upgrade().map(|inner| SessionController { inner })
}

fn restore_answers(questions: &[Question], saved: Vec<SavedAnswerRecord>) -> BTreeMap<String, Answer> {
    saved
        .into_iter()
        .filter_map(|record| {
            let Some(question) = questions.iter().find(|question| question.id == record.question_id)
            else {
                tracing::warn!(question_id = %record.question_id, "Saved answer for unknown question ignored");
                return None;
            };
            if record.answer.kind() != question.kind {
                tracing::warn!(
                    question_id = %record.question_id,
                    answer_type = record.answer.answer_type(),
                    "Saved answer does not match question kind"
                );
                return None;
            }
            let answered_at =
                record.saved_at.as_deref().and_then(time::parse_offset).unwrap_or_else(time::now_utc);
            let answer = Answer {
                question_id: record.question_id.clone(),
                payload: record.answer,
                sync_state: SyncState::Saved,
                answered_at,
                freshness_token: 0,
                error: None,
            };
            Some((record.question_id, answer))
        })
        .collect()
}

/// First question not fully answered, or the last one when all are.
fn resume_index(questions: &[Question], answers: &BTreeMap<String, Answer>) -> usize {
    questions
        .iter()
        .position(|question| {
            let payload = answers.get(&question.id).map(|answer| &answer.payload);
            status::status(question.kind, payload) != AnswerStatus::Answered
        })
        .unwrap_or(questions.len().saturating_sub(1))
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController").field("store", &self.inner.store).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::AnswerPayload;
    use crate::test_support::question;

    #[test]
    fn restore_skips_unknown_and_mismatched_answers() {
        let questions = vec![
            question("q1", 1, QuestionKind::SingleChoice),
            question("q2", 2, QuestionKind::FreeText),
        ];
        let saved = vec![
            SavedAnswerRecord {
                question_id: "q1".into(),
                answer: AnswerPayload::SelectedOption("b".into()),
                saved_at: Some("2026-03-01T10:00:00Z".into()),
            },
            SavedAnswerRecord {
                question_id: "q2".into(),
                answer: AnswerPayload::SelectedOption("c".into()),
                saved_at: None,
            },
            SavedAnswerRecord {
                question_id: "q9".into(),
                answer: AnswerPayload::FreeText("x".into()),
                saved_at: None,
            },
        ];

        let answers = restore_answers(&questions, saved);
        assert_eq!(answers.len(), 1);
        let restored = &answers["q1"];
        assert_eq!(restored.sync_state, SyncState::Saved);
        assert_eq!(restored.freshness_token, 0);
        assert_eq!(restored.answered_at.year(), 2026);
        assert_eq!(resume_index(&questions, &answers), 1);
    }

    #[test]
    fn resume_index_falls_back_to_last_question() {
        let questions = vec![question("q1", 1, QuestionKind::FreeText)];
        let mut answers = BTreeMap::new();
        answers.insert(
            "q1".to_string(),
            Answer {
                question_id: "q1".into(),
                payload: AnswerPayload::FreeText("done".into()),
                sync_state: SyncState::Saved,
                answered_at: ::time::OffsetDateTime::UNIX_EPOCH,
                freshness_token: 0,
                error: None,
            },
        );
        assert_eq!(resume_index(&questions, &answers), 0);
    }
}
