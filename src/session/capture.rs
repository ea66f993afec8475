use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use crate::core::errors::{DeviceFailure, SessionError};
use crate::core::metrics;
use crate::domain::models::CaptureLimits;
use crate::domain::types::CaptureState;
use crate::services::attempt_api::{AttemptService, UploadProgress};
use crate::services::retry::RetryPolicy;
use crate::session::device::{DeviceEvent, DeviceGate};
use crate::session::store::{Action, CaptureSnapshot, SessionFailure, SessionStore, TransferProgress};
use crate::session::sync::AnswerSynchronizer;

const TICK: Duration = Duration::from_secs(1);

/// Called with the question id once the answer is saved and the
/// auto-advance delay has passed.
pub type CompletionHook = Box<dyn FnOnce(String) + Send + 'static>;

/// Collaborators shared by every capture of a session.
#[derive(Clone)]
pub struct CaptureContext {
    pub store: SessionStore,
    pub api: Arc<dyn AttemptService>,
    pub gate: DeviceGate,
    pub sync: AnswerSynchronizer,
    pub retry: RetryPolicy,
    pub auto_advance_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub attempt_id: String,
    pub question_id: String,
    pub limits: CaptureLimits,
}

#[derive(Debug)]
enum CaptureCommand {
    Stop,
}

enum RecordingEnd {
    MaxDuration,
    Manual,
}

/// One running capture cycle. Dropping the handle cancels the cycle and
/// releases the device if it is held.
pub struct CaptureHandle {
    question_id: String,
    store: SessionStore,
    commands: mpsc::UnboundedSender<CaptureCommand>,
    task: JoinHandle<()>,
}

impl CaptureHandle {
    pub fn spawn(ctx: CaptureContext, request: CaptureRequest, on_complete: CompletionHook) -> Self {
        let snapshot = CaptureSnapshot {
            question_id: request.question_id.clone(),
            state: if request.limits.prep_seconds > 0 {
                CaptureState::Preparing
            } else {
                CaptureState::Idle
            },
            prep_remaining_seconds: request.limits.prep_seconds,
            elapsed_seconds: 0,
            min_duration_seconds: request.limits.min_duration_seconds,
            max_duration_seconds: request.limits.max_duration_seconds,
            recorded_bytes: 0,
            upload_attempt_count: 0,
            upload_progress: None,
            error: None,
        };
        ctx.store.dispatch(Action::CaptureUpdated(snapshot.clone()));
        tracing::info!(question_id = %request.question_id, "Capture started");

        let (commands, receiver) = mpsc::unbounded_channel();
        let store = ctx.store.clone();
        let question_id = request.question_id.clone();
        let cycle = CaptureCycle { ctx, request, snapshot, commands: receiver };
        let task = tokio::spawn(cycle.run(on_complete));

        Self { question_id, store, commands, task }
    }

    pub fn question_id(&self) -> &str {
        &self.question_id
    }

    pub fn snapshot(&self) -> Option<CaptureSnapshot> {
        self.store.read(|state| state.capture(&self.question_id).cloned())
    }

    /// Manual stop. Rejected until the minimum duration has been recorded.
    pub fn request_stop(&self) -> Result<(), SessionError> {
        let snapshot = self
            .snapshot()
            .ok_or_else(|| SessionError::invalid_state("no capture for this question"))?;
        if snapshot.state != CaptureState::Recording {
            return Err(SessionError::invalid_state("recording is not in progress"));
        }
        if !snapshot.can_stop() {
            return Err(SessionError::validation(format!(
                "recording must last at least {} seconds",
                snapshot.min_duration_seconds
            )));
        }
        self.commands
            .send(CaptureCommand::Stop)
            .map_err(|_| SessionError::invalid_state("capture already finished"))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn is_uploading(&self) -> bool {
        !self.is_finished()
            && self.snapshot().is_some_and(|snapshot| snapshot.state == CaptureState::Uploading)
    }

    /// Waits until the upload under way has completed or failed. The
    /// auto-advance step is cancelled.
    pub async fn settle(mut self) {
        let question_id = self.question_id.clone();
        let mut updates = self.store.subscribe();
        tokio::select! {
            _ = updates.wait_for(|state| {
                state.capture(&question_id).map_or(true, |snapshot| snapshot.state.is_finished())
            }) => {}
            _ = &mut self.task => {}
        }
    }

    /// Still preparing, recording or uploading.
    pub fn is_active(&self) -> bool {
        !self.is_finished()
            && self.snapshot().is_some_and(|snapshot| !snapshot.state.is_finished())
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            tracing::debug!(question_id = %self.question_id, "Capture cancelled");
            self.task.abort();
        }
    }
}

struct CaptureCycle {
    ctx: CaptureContext,
    request: CaptureRequest,
    snapshot: CaptureSnapshot,
    commands: mpsc::UnboundedReceiver<CaptureCommand>,
}

impl CaptureCycle {
    fn publish(&self) {
        self.ctx.store.dispatch(Action::CaptureUpdated(self.snapshot.clone()));
    }

    fn fail(&mut self, err: SessionError) {
        tracing::warn!(
            question_id = %self.request.question_id,
            state = ?self.snapshot.state,
            error = %err,
            "Capture failed"
        );
        self.snapshot.state = CaptureState::Failed;
        self.snapshot.error = Some(SessionFailure::from(&err));
        self.publish();
    }

    async fn run(mut self, on_complete: CompletionHook) {
        self.prepare().await;

        let audio = match self.record().await {
            Ok(audio) => audio,
            Err(failure) => return self.fail(SessionError::Device(failure)),
        };

        let size = audio.len() as u64;
        let limits = self.request.limits;
        if size < limits.min_bytes || size > limits.max_bytes {
            return self.fail(SessionError::validation(format!(
                "recording size {size} bytes is outside {}..={} bytes",
                limits.min_bytes, limits.max_bytes
            )));
        }

        let audio_ref = match self.upload(&audio).await {
            Ok(audio_ref) => audio_ref,
            Err(err) => {
                metrics::record_upload_failure();
                return self.fail(err);
            }
        };

        if let Err(err) = self.ctx.sync.write_finalized(&self.request.question_id, audio_ref) {
            return self.fail(err);
        }
        self.snapshot.state = CaptureState::Completed;
        self.snapshot.error = None;
        self.publish();

        tokio::time::sleep(self.ctx.auto_advance_delay).await;
        on_complete(self.request.question_id.clone());
    }

    async fn prepare(&mut self) {
        if self.snapshot.prep_remaining_seconds == 0 {
            return;
        }
        let mut ticker = interval_at(Instant::now() + TICK, TICK);
        while self.snapshot.prep_remaining_seconds > 0 {
            ticker.tick().await;
            self.snapshot.prep_remaining_seconds -= 1;
            self.publish();
        }
    }

    async fn record(&mut self) -> Result<Vec<u8>, DeviceFailure> {
        let mut lease = self.ctx.gate.acquire()?;
        self.snapshot.state = CaptureState::Recording;
        self.snapshot.elapsed_seconds = 0;
        self.publish();

        let limits = self.request.limits;
        let mut audio = Vec::new();
        let mut ticker = interval_at(Instant::now() + TICK, TICK);
        let end = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.snapshot.elapsed_seconds += 1;
                    self.snapshot.recorded_bytes = audio.len() as u64;
                    if self.snapshot.elapsed_seconds >= limits.max_duration_seconds {
                        break RecordingEnd::MaxDuration;
                    }
                    self.publish();
                }
                event = lease.next_event() => match event {
                    Some(DeviceEvent::Chunk(bytes)) => audio.extend_from_slice(&bytes),
                    Some(DeviceEvent::Failed(failure)) => return Err(failure),
                    None => return Err(DeviceFailure::Unavailable),
                },
                Some(CaptureCommand::Stop) = self.commands.recv() => {
                    if self.snapshot.elapsed_seconds >= limits.min_duration_seconds {
                        break RecordingEnd::Manual;
                    }
                }
            }
        };

        lease.finish(&mut audio);
        self.snapshot.recorded_bytes = audio.len() as u64;
        tracing::info!(
            question_id = %self.request.question_id,
            elapsed_seconds = self.snapshot.elapsed_seconds,
            bytes = audio.len(),
            auto_stopped = matches!(end, RecordingEnd::MaxDuration),
            "Recording stopped"
        );
        Ok(audio)
    }

    async fn upload(&mut self, audio: &[u8]) -> Result<String, SessionError> {
        self.snapshot.state = CaptureState::Uploading;
        self.snapshot.upload_progress = None;
        self.publish();

        let store = self.ctx.store.clone();
        let question_id = self.request.question_id.clone();
        let progress: UploadProgress = Arc::new(move |sent, total| {
            store.dispatch(Action::CaptureProgress {
                question_id: question_id.clone(),
                progress: TransferProgress { sent, total },
            });
        });

        let retry = self.ctx.retry;
        let api = self.ctx.api.clone();
        let attempt_id = self.request.attempt_id.clone();
        let question_id = self.request.question_id.clone();
        let uploaded = retry
            .run("upload_audio", |attempt| {
                self.snapshot.upload_attempt_count = attempt;
                self.snapshot.upload_progress = None;
                self.publish();
                metrics::record_upload_attempt();

                let api = api.clone();
                let progress = progress.clone();
                let (attempt_id, question_id) = (attempt_id.as_str(), question_id.as_str());
                async move { api.upload_audio(attempt_id, question_id, audio, progress).await }
            })
            .await?;

        tracing::info!(
            question_id = %self.request.question_id,
            attempts = self.snapshot.upload_attempt_count,
            duration = uploaded.duration,
            "Recording uploaded"
        );
        Ok(uploaded.audio_ref)
    }
}
