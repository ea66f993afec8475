use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use ::time::OffsetDateTime;
use tokio::task::JoinSet;

use crate::core::errors::SessionError;
use crate::core::{metrics, time};
use crate::domain::models::{Answer, AnswerPayload};
use crate::domain::types::{QuestionKind, SessionPhase, SyncState};
use crate::schemas::attempt::PersistAnswerRequest;
use crate::services::attempt_api::AttemptService;
use crate::services::payload;
use crate::services::retry::RetryPolicy;
use crate::session::store::{Action, SessionState, SessionStore};

/// Optimistic answer cache reconciled against the remote service.
///
/// Every edit is written to the store before its persist request leaves.
/// Responses are applied only while their freshness token is still the
/// latest for the question.
#[derive(Clone)]
pub struct AnswerSynchronizer {
    worker: PersistWorker,
    in_flight: Arc<Mutex<JoinSet<()>>>,
}

#[derive(Clone)]
struct PersistWorker {
    store: SessionStore,
    api: Arc<dyn AttemptService>,
    retry: RetryPolicy,
}

impl AnswerSynchronizer {
    pub fn new(store: SessionStore, api: Arc<dyn AttemptService>, retry: RetryPolicy) -> Self {
        Self {
            worker: PersistWorker { store, api, retry },
            in_flight: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    pub fn apply_local_edit(&self, question_id: &str, raw: &Value) -> Result<Answer, SessionError> {
        let state = self.worker.store.state();
        let attempt_id = editable_attempt(&state)?;
        let question = state
            .question(question_id)
            .ok_or_else(|| SessionError::validation(format!("unknown question '{question_id}'")))?;
        let payload = payload::encode(question, raw)?;

        let at = time::now_utc();
        let edited = self.worker.store.dispatch(Action::LocalEdit {
            question_id: question_id.to_string(),
            payload: payload.clone(),
            at,
        });
        let answer = own_edit(&edited, question_id, &payload, at)?;

        self.dispatch_persist(attempt_id, answer.clone());
        Ok(answer)
    }

    /// Re-sends an answer whose last save failed.
    pub fn retry_answer(&self, question_id: &str) -> Result<(), SessionError> {
        let state = self.worker.store.state();
        let attempt_id = editable_attempt(&state)?;
        match state.answer(question_id) {
            Some(answer) if answer.sync_state == SyncState::Error => {}
            Some(_) => return Err(SessionError::invalid_state("answer has no failed save to retry")),
            None => return Err(SessionError::invalid_state("question has no answer yet")),
        }

        let resaved = self.worker.store.dispatch(Action::Resave { question_id: question_id.to_string() });
        if let Some(answer) = resaved.answer(question_id).cloned() {
            tracing::info!(question_id, token = answer.freshness_token, "Retrying answer save");
            self.dispatch_persist(attempt_id, answer);
        }
        Ok(())
    }

    /// Questions whose latest save ended in an error.
    pub fn failed_answers(&self) -> Vec<String> {
        self.worker.store.read(|state| {
            state
                .answers
                .values()
                .filter(|answer| answer.sync_state == SyncState::Error)
                .map(|answer| answer.question_id.clone())
                .collect()
        })
    }

    /// Re-sends every failed answer once the attempt is closing and waits
    /// for the outcome. Returns the questions that still failed.
    pub async fn resave_failed(&self) -> Vec<String> {
        let failed = self.failed_answers();
        let Some(attempt_id) = self.worker.store.read(|state| state.attempt_id().map(str::to_string))
        else {
            return failed;
        };
        for question_id in &failed {
            let resaved = self.worker.store.dispatch(Action::Resave { question_id: question_id.clone() });
            if let Some(answer) = resaved.answer(question_id).cloned() {
                tracing::info!(question_id = %question_id, token = answer.freshness_token, "Resaving failed answer before submit");
                self.dispatch_persist(attempt_id.clone(), answer);
            }
        }
        self.flush().await;
        self.failed_answers()
    }

    /// Writes the recorded audio reference as a saved answer. Only the
    /// capture machine calls this, once per question.
    pub fn write_finalized(&self, question_id: &str, audio_ref: String) -> Result<Answer, SessionError> {
        let state = self.worker.store.state();
        let question = state
            .question(question_id)
            .ok_or_else(|| SessionError::validation(format!("unknown question '{question_id}'")))?;
        if question.kind != QuestionKind::SpokenAudio {
            return Err(SessionError::invalid_state("only spoken answers are finalized directly"));
        }
        if state.answer(question_id).is_some_and(|answer| answer.sync_state == SyncState::Saved) {
            return Err(SessionError::invalid_state("spoken answer was already recorded"));
        }

        let finalized = self.worker.store.dispatch(Action::AnswerFinalized {
            question_id: question_id.to_string(),
            audio_ref,
            at: time::now_utc(),
        });
        tracing::info!(question_id, "Spoken answer finalized");
        finalized
            .answer(question_id)
            .cloned()
            .ok_or_else(|| SessionError::invalid_state("attempt was closed before the answer was saved"))
    }

    /// Waits until every dispatched persist has settled.
    pub async fn flush(&self) {
        let mut pending = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *in_flight)
        };
        while let Some(joined) = pending.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    tracing::error!(error = %err, "Answer persist task panicked");
                }
            }
        }
    }

    pub fn abort_all(&self) {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).abort_all();
    }

    fn dispatch_persist(&self, attempt_id: String, answer: Answer) {
        self.worker.store.dispatch(Action::PersistStarted {
            question_id: answer.question_id.clone(),
            token: answer.freshness_token,
        });

        let worker = self.worker.clone();
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move { worker.persist(attempt_id, answer).await });
    }
}

/// The answer `LocalEdit` wrote, or an error when the reducer refused it
/// because the attempt left `Active` in the meantime.
fn own_edit(
    edited: &SessionState,
    question_id: &str,
    payload: &AnswerPayload,
    at: OffsetDateTime,
) -> Result<Answer, SessionError> {
    edited
        .answer(question_id)
        .filter(|answer| {
            answer.sync_state == SyncState::LocalOnly
                && answer.answered_at == at
                && &answer.payload == payload
        })
        .cloned()
        .ok_or_else(|| SessionError::invalid_state("answers can no longer be edited"))
}

fn editable_attempt(state: &SessionState) -> Result<String, SessionError> {
    if state.phase != SessionPhase::Active {
        return Err(SessionError::invalid_state("answers can only be changed during an active attempt"));
    }
    state
        .attempt_id()
        .map(str::to_string)
        .ok_or_else(|| SessionError::invalid_state("no attempt loaded"))
}

impl PersistWorker {
    fn latest_token(&self, question_id: &str) -> Option<u64> {
        self.store.read(|state| state.answer(question_id).map(|answer| answer.freshness_token))
    }

    async fn persist(self, attempt_id: String, answer: Answer) {
        let question_id = answer.question_id.clone();
        let token = answer.freshness_token;
        let request = PersistAnswerRequest {
            question_id: question_id.clone(),
            answer: answer.payload,
            freshness_token: token,
        };

        let worker = &self;
        let request = &request;
        let attempt_id = attempt_id.as_str();
        let result = self
            .retry
            .run("persist_answer", move |attempt| async move {
                if attempt > 1 && worker.latest_token(&request.question_id) != Some(token) {
                    return Err(SessionError::StaleResponse {
                        question_id: request.question_id.clone(),
                        token,
                    });
                }
                worker.api.persist_answer(attempt_id, request).await
            })
            .await;

        let result = result.and_then(|ack| match ack.freshness_token {
            Some(echoed) if echoed != token => Err(SessionError::invalid_state(format!(
                "the service confirmed revision {echoed} instead of {token}; press Retry"
            ))),
            _ => Ok(ack),
        });

        let (action, outcome) = match result {
            Ok(_) => (Action::PersistSucceeded { question_id: question_id.clone(), token }, "saved"),
            Err(err) if err.is_silent() => {
                self.discard_stale(&question_id, token);
                return;
            }
            Err(err) => {
                tracing::warn!(question_id = %question_id, token, error = %err, "Answer save failed");
                (
                    Action::PersistFailed {
                        question_id: question_id.clone(),
                        token,
                        message: err.user_message(),
                    },
                    "failed",
                )
            }
        };

        let applied = self.store.dispatch(action).answer(&question_id).is_some_and(|current| {
            current.freshness_token == token
                && matches!(current.sync_state, SyncState::Saved | SyncState::Error)
        });
        if applied {
            metrics::record_persist(outcome);
            tracing::debug!(question_id = %question_id, token, outcome, "Answer save settled");
        } else {
            self.discard_stale(&question_id, token);
        }
    }

    fn discard_stale(&self, question_id: &str, token: u64) {
        metrics::record_stale_response();
        tracing::debug!(
            question_id,
            token,
            latest = self.latest_token(question_id).unwrap_or_default(),
            "Discarding superseded answer response"
        );
    }
}
