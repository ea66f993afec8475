use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::config::{CaptureSettings, RetrySettings, Settings, SubmitSettings};
use crate::core::errors::{DeviceFailure, SessionError};
use crate::domain::models::{AnswerPayload, Attempt, Question, QuestionConstraints};
use crate::domain::types::{AttemptStatus, AttemptType, QuestionKind, Skill};
use crate::schemas::attempt::{
    AttemptRecord, AudioUploadResponse, CreateAttemptRequest, PersistAnswerAck,
    PersistAnswerRequest, RemoteAttemptStatus, SubmitResponse,
};
use crate::services::attempt_api::{AttemptService, UploadProgress};
use crate::session::device::{DeviceEvent, DeviceEvents, RecordingDevice};
use crate::session::store::{Action, SessionStore};

pub(crate) const TEST_ATTEMPT_ID: &str = "att-1";
pub(crate) const TEST_EXAM_ID: &str = "exam-1";

pub(crate) fn attempt(id: &str, remaining: u64) -> Attempt {
    Attempt {
        id: id.to_string(),
        exam_id: TEST_EXAM_ID.to_string(),
        attempt_type: AttemptType::SingleSkill,
        selected_skill: Some(Skill::Speaking),
        status: AttemptStatus::Active,
        time_remaining_seconds: remaining,
        timer_initialized: true,
    }
}

pub(crate) fn question(id: &str, order_index: u32, kind: QuestionKind) -> Question {
    Question {
        id: id.to_string(),
        order_index,
        kind,
        content: json!({ "prompt": format!("Prompt for {id}") }),
        constraints: QuestionConstraints::default(),
    }
}

/// Store holding an active attempt over `questions`, positioned on the first.
pub(crate) fn active_store(questions: Vec<Question>) -> SessionStore {
    let store = SessionStore::new();
    store.dispatch(Action::AttemptLoaded {
        attempt: attempt(TEST_ATTEMPT_ID, 600),
        questions,
        answers: BTreeMap::new(),
        current_index: 0,
    });
    store
}

pub(crate) fn attempt_record(remaining: Option<u64>) -> AttemptRecord {
    AttemptRecord {
        id: TEST_ATTEMPT_ID.to_string(),
        exam_id: TEST_EXAM_ID.to_string(),
        attempt_type: AttemptType::SingleSkill,
        skill: Some(Skill::Speaking),
        status: RemoteAttemptStatus::Active,
        time_remaining_seconds: remaining,
        saved_answers: Vec::new(),
    }
}

/// Local settings with the stock capture timings and a short retry ladder.
pub(crate) fn test_settings() -> Settings {
    Settings::local("http://127.0.0.1:9/api/v1")
        .expect("local settings")
        .with_retry(RetrySettings { max_attempts: 4, base_delay_ms: 1000, max_delay_ms: 16_000 })
        .with_submit(SubmitSettings { timeout_retry_delay_ms: 1000 })
        .with_capture(CaptureSettings::default())
        .expect("capture settings")
}

struct ScriptedStep<T> {
    delay: Duration,
    result: Result<T, SessionError>,
}

#[derive(Debug, Clone)]
pub(crate) struct PersistCall {
    pub(crate) question_id: String,
    pub(crate) freshness_token: u64,
    pub(crate) payload: AnswerPayload,
    pub(crate) at: Instant,
}

#[derive(Debug, Clone)]
pub(crate) struct UploadCall {
    pub(crate) question_id: String,
    pub(crate) bytes: usize,
    pub(crate) at: Instant,
}

#[derive(Debug, Clone)]
pub(crate) struct SubmitCall {
    pub(crate) attempt_id: String,
    pub(crate) at: Instant,
}

/// In-process attempt service. Unscripted calls succeed immediately.
#[derive(Default)]
pub(crate) struct FakeAttemptService {
    created: Mutex<Option<AttemptRecord>>,
    fetched: Mutex<Option<AttemptRecord>>,
    create_error: Mutex<Option<SessionError>>,
    questions: Mutex<Vec<Question>>,
    skills: Mutex<Vec<Skill>>,
    persist_script: Mutex<VecDeque<ScriptedStep<()>>>,
    upload_script: Mutex<VecDeque<ScriptedStep<()>>>,
    submit_script: Mutex<VecDeque<ScriptedStep<()>>>,
    ack_tokens: Mutex<VecDeque<u64>>,
    persist_calls: Mutex<Vec<PersistCall>>,
    upload_calls: Mutex<Vec<UploadCall>>,
    submit_calls: Mutex<Vec<SubmitCall>>,
    fetch_calls: AtomicUsize,
}

impl FakeAttemptService {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_created(&self, record: AttemptRecord) {
        *self.created.lock().unwrap() = Some(record);
    }

    pub(crate) fn with_fetched(&self, record: AttemptRecord) {
        *self.fetched.lock().unwrap() = Some(record);
    }

    pub(crate) fn fail_create(&self, err: SessionError) {
        *self.create_error.lock().unwrap() = Some(err);
    }

    pub(crate) fn with_questions(&self, questions: Vec<Question>) {
        *self.questions.lock().unwrap() = questions;
    }

    pub(crate) fn with_skills(&self, skills: Vec<Skill>) {
        *self.skills.lock().unwrap() = skills;
    }

    /// Next persist call succeeds after `delay`.
    pub(crate) fn delay_persist(&self, delay: Duration) {
        self.persist_script.lock().unwrap().push_back(ScriptedStep { delay, result: Ok(()) });
    }

    pub(crate) fn fail_persist(&self, err: SessionError) {
        self.persist_script
            .lock()
            .unwrap()
            .push_back(ScriptedStep { delay: Duration::ZERO, result: Err(err) });
    }

    /// Next persist acknowledgement echoes `token` instead of the request's.
    pub(crate) fn echo_persist_token(&self, token: u64) {
        self.ack_tokens.lock().unwrap().push_back(token);
    }

    pub(crate) fn fail_upload(&self, err: SessionError) {
        self.upload_script
            .lock()
            .unwrap()
            .push_back(ScriptedStep { delay: Duration::ZERO, result: Err(err) });
    }

    pub(crate) fn fail_submit(&self, err: SessionError) {
        self.submit_script
            .lock()
            .unwrap()
            .push_back(ScriptedStep { delay: Duration::ZERO, result: Err(err) });
    }

    pub(crate) fn persist_calls(&self) -> Vec<PersistCall> {
        self.persist_calls.lock().unwrap().clone()
    }

    pub(crate) fn upload_calls(&self) -> Vec<UploadCall> {
        self.upload_calls.lock().unwrap().clone()
    }

    pub(crate) fn submit_calls(&self) -> Vec<SubmitCall> {
        self.submit_calls.lock().unwrap().clone()
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    async fn play(script: &Mutex<VecDeque<ScriptedStep<()>>>) -> Result<(), SessionError> {
        let step = script.lock().unwrap().pop_front();
        match step {
            Some(step) => {
                if !step.delay.is_zero() {
                    tokio::time::sleep(step.delay).await;
                }
                step.result
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AttemptService for FakeAttemptService {
    async fn create_attempt(
        &self,
        request: &CreateAttemptRequest,
    ) -> Result<AttemptRecord, SessionError> {
        if let Some(err) = self.create_error.lock().unwrap().take() {
            return Err(err);
        }
        let created = self.created.lock().unwrap().clone();
        Ok(created.unwrap_or_else(|| AttemptRecord {
            exam_id: request.exam_id.clone(),
            attempt_type: request.attempt_type,
            skill: request.skill,
            ..attempt_record(Some(600))
        }))
    }

    async fn fetch_attempt(&self, attempt_id: &str) -> Result<AttemptRecord, SessionError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetched
            .lock()
            .unwrap()
            .clone()
            .filter(|record| record.id == attempt_id)
            .ok_or_else(|| SessionError::from_status(404, "attempt not found"))
    }

    async fn list_questions(&self, _attempt_id: &str) -> Result<Vec<Question>, SessionError> {
        Ok(self.questions.lock().unwrap().clone())
    }

    async fn persist_answer(
        &self,
        _attempt_id: &str,
        request: &PersistAnswerRequest,
    ) -> Result<PersistAnswerAck, SessionError> {
        self.persist_calls.lock().unwrap().push(PersistCall {
            question_id: request.question_id.clone(),
            freshness_token: request.freshness_token,
            payload: request.answer.clone(),
            at: Instant::now(),
        });
        let echoed = self.ack_tokens.lock().unwrap().pop_front();
        Self::play(&self.persist_script).await?;
        Ok(PersistAnswerAck {
            question_id: request.question_id.clone(),
            freshness_token: Some(echoed.unwrap_or(request.freshness_token)),
            saved_at: None,
        })
    }

    async fn upload_audio(
        &self,
        _attempt_id: &str,
        question_id: &str,
        audio: &[u8],
        progress: UploadProgress,
    ) -> Result<AudioUploadResponse, SessionError> {
        self.upload_calls.lock().unwrap().push(UploadCall {
            question_id: question_id.to_string(),
            bytes: audio.len(),
            at: Instant::now(),
        });
        let total = audio.len() as u64;
        progress(0, total);
        Self::play(&self.upload_script).await?;
        progress(total, total);
        Ok(AudioUploadResponse { audio_ref: format!("aud-{question_id}"), duration: Some(30.0) })
    }

    async fn submit_attempt(&self, attempt_id: &str) -> Result<SubmitResponse, SessionError> {
        self.submit_calls
            .lock()
            .unwrap()
            .push(SubmitCall { attempt_id: attempt_id.to_string(), at: Instant::now() });
        Self::play(&self.submit_script).await?;
        Ok(SubmitResponse {
            attempt_id: attempt_id.to_string(),
            result_ref: format!("result-{attempt_id}"),
        })
    }

    async fn list_skills(&self, _exam_id: &str) -> Result<Vec<Skill>, SessionError> {
        Ok(self.skills.lock().unwrap().clone())
    }
}

/// Recording device that queues a fixed recording on every start.
pub(crate) struct FakeDevice {
    audio_bytes: usize,
    denied: AtomicBool,
    sender: Mutex<Option<mpsc::UnboundedSender<DeviceEvent>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl FakeDevice {
    pub(crate) fn with_audio(audio_bytes: usize) -> Self {
        Self {
            audio_bytes,
            denied: AtomicBool::new(false),
            sender: Mutex::new(None),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub(crate) fn denied() -> Self {
        let device = Self::with_audio(0);
        device.denied.store(true, Ordering::SeqCst);
        device
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn emit_failure(&self, failure: DeviceFailure) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            let _ = sender.send(DeviceEvent::Failed(failure));
        }
    }
}

impl RecordingDevice for FakeDevice {
    fn start(&self) -> Result<DeviceEvents, DeviceFailure> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(DeviceFailure::PermissionDenied);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();
        let half = self.audio_bytes / 2;
        let _ = sender.send(DeviceEvent::Chunk(vec![1; half]));
        let _ = sender.send(DeviceEvent::Chunk(vec![2; self.audio_bytes - half]));
        *self.sender.lock().unwrap() = Some(sender);
        Ok(receiver)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.sender.lock().unwrap().take();
    }
}
