use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::errors::SessionError;
use crate::domain::models::Question;
use crate::domain::types::Skill;
use crate::schemas::attempt::{
    AttemptRecord, AudioUploadResponse, CreateAttemptRequest, PersistAnswerAck,
    PersistAnswerRequest, QuestionPage, SkillsResponse, SubmitResponse,
};

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;
const AUDIO_CONTENT_TYPE: &str = "audio/webm";

/// Receives `(bytes_sent, bytes_total)` while an upload is in flight.
pub type UploadProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Remote persistence for attempts, answers and recordings.
#[async_trait]
pub trait AttemptService: Send + Sync {
    async fn create_attempt(
        &self,
        request: &CreateAttemptRequest,
    ) -> Result<AttemptRecord, SessionError>;

    async fn fetch_attempt(&self, attempt_id: &str) -> Result<AttemptRecord, SessionError>;

    /// All questions of the attempt, in any order.
    async fn list_questions(&self, attempt_id: &str) -> Result<Vec<Question>, SessionError>;

    async fn persist_answer(
        &self,
        attempt_id: &str,
        request: &PersistAnswerRequest,
    ) -> Result<PersistAnswerAck, SessionError>;

    async fn upload_audio(
        &self,
        attempt_id: &str,
        question_id: &str,
        audio: &[u8],
        progress: UploadProgress,
    ) -> Result<AudioUploadResponse, SessionError>;

    async fn submit_attempt(&self, attempt_id: &str) -> Result<SubmitResponse, SessionError>;

    async fn list_skills(&self, exam_id: &str) -> Result<Vec<Skill>, SessionError>;
}

#[derive(Debug, Clone)]
pub struct HttpAttemptService {
    client: Client,
    base_url: String,
    token: String,
    page_size: u32,
}

impl HttpAttemptService {
    pub fn from_settings(settings: &Settings) -> Result<Self, SessionError> {
        let client = Client::builder()
            .connect_timeout(settings.api().connect_timeout())
            .timeout(settings.api().request_timeout())
            .build()
            .map_err(|err| {
                SessionError::Initialization(format!("failed to build HTTP client: {err}"))
            })?;

        Ok(Self {
            client,
            base_url: settings.api().base_url.as_str().to_string(),
            token: settings.api().token.clone(),
            page_size: settings.api().questions_page_size,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.header("X-Request-Id", Uuid::new_v4().to_string());
        if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        context: &'static str,
    ) -> Result<T, SessionError> {
        let response = self.authorized(builder).send().await.map_err(SessionError::from)?;
        read_json(response, context).await
    }
}

#[async_trait]
impl AttemptService for HttpAttemptService {
    async fn create_attempt(
        &self,
        request: &CreateAttemptRequest,
    ) -> Result<AttemptRecord, SessionError> {
        let url = self.url(&format!("exams/{}/attempts", request.exam_id));
        self.send_json(self.client.post(url).json(request), "create attempt").await
    }

    async fn fetch_attempt(&self, attempt_id: &str) -> Result<AttemptRecord, SessionError> {
        let url = self.url(&format!("attempts/{attempt_id}"));
        self.send_json(self.client.get(url), "fetch attempt").await
    }

    async fn list_questions(&self, attempt_id: &str) -> Result<Vec<Question>, SessionError> {
        let url = self.url(&format!("attempts/{attempt_id}/questions"));
        let mut questions = Vec::new();
        let mut page = 1_u32;

        loop {
            let builder = self
                .client
                .get(&url)
                .query(&[("page", page.to_string()), ("page_size", self.page_size.to_string())]);
            let batch: QuestionPage = self.send_json(builder, "list questions").await?;
            let received = batch.items.len();
            questions.extend(batch.items);

            if !batch.has_more || received == 0 {
                break;
            }
            page += 1;
        }

        tracing::debug!(attempt_id, count = questions.len(), pages = page, "Questions fetched");
        Ok(questions)
    }

    async fn persist_answer(
        &self,
        attempt_id: &str,
        request: &PersistAnswerRequest,
    ) -> Result<PersistAnswerAck, SessionError> {
        let url = self.url(&format!("attempts/{attempt_id}/answers/{}", request.question_id));
        self.send_json(self.client.put(url).json(request), "persist answer").await
    }

    async fn upload_audio(
        &self,
        attempt_id: &str,
        question_id: &str,
        audio: &[u8],
        progress: UploadProgress,
    ) -> Result<AudioUploadResponse, SessionError> {
        let url = self.url(&format!("attempts/{attempt_id}/answers/{question_id}/audio"));
        let total = audio.len() as u64;
        progress(0, total);

        let chunks: Vec<Vec<u8>> = audio.chunks(UPLOAD_CHUNK_SIZE).map(<[u8]>::to_vec).collect();
        let sent = Arc::new(AtomicU64::new(0));
        let progress_cb = progress.clone();
        let stream = futures_util::stream::iter(chunks).map(move |chunk| {
            let new_total =
                sent.fetch_add(chunk.len() as u64, Ordering::SeqCst) + chunk.len() as u64;
            progress_cb(new_total, total);
            Ok::<_, std::io::Error>(chunk)
        });

        let builder = self
            .client
            .post(url)
            .header(CONTENT_TYPE, AUDIO_CONTENT_TYPE)
            .header(CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(stream));
        let uploaded: AudioUploadResponse = self.send_json(builder, "upload audio").await?;

        progress(total, total);
        Ok(uploaded)
    }

    async fn submit_attempt(&self, attempt_id: &str) -> Result<SubmitResponse, SessionError> {
        let url = self.url(&format!("attempts/{attempt_id}/submit"));
        self.send_json(self.client.post(url), "submit attempt").await
    }

    async fn list_skills(&self, exam_id: &str) -> Result<Vec<Skill>, SessionError> {
        let url = self.url(&format!("exams/{exam_id}/skills"));
        let response: SkillsResponse = self.send_json(self.client.get(url), "list skills").await?;
        Ok(response.skills)
    }
}

async fn read_json<T: DeserializeOwned>(
    response: Response,
    context: &'static str,
) -> Result<T, SessionError> {
    let status = response.status();
    let raw_body = response.text().await.map_err(SessionError::from)?;

    if !status.is_success() {
        let detail = serde_json::from_str::<Value>(&raw_body)
            .map(|parsed| extract_error_message(&parsed))
            .unwrap_or_else(|_| {
                let trimmed = raw_body.trim();
                if trimmed.is_empty() {
                    status.canonical_reason().unwrap_or("unknown_error").to_string()
                } else {
                    trimmed.chars().take(200).collect()
                }
            });
        return Err(SessionError::from_status(status.as_u16(), format!("{context}: {detail}")));
    }

    serde_json::from_str(&raw_body).map_err(|err| SessionError::Server {
        status: status.as_u16(),
        detail: format!("{context} returned malformed JSON: {err}"),
    })
}

fn extract_error_message(payload: &Value) -> String {
    if let Some(detail) = payload.get("detail") {
        if let Some(text) = detail.as_str() {
            return text.to_string();
        }
        if let Some(items) = detail.as_array() {
            let joined = items
                .iter()
                .filter_map(|item| {
                    item.get("msg")
                        .and_then(Value::as_str)
                        .or_else(|| item.get("message").and_then(Value::as_str))
                })
                .collect::<Vec<_>>()
                .join("; ");
            if !joined.is_empty() {
                return joined;
            }
        }
    }

    payload
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| payload.get("error").and_then(Value::as_str))
        .unwrap_or("unknown_error")
        .to_string()
}
