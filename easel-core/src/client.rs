//! Stateless HTTP adapter for one remote generation backend.
//!
//! Speaks the `forge` dialect: submission goes through the scheduler queue
//! endpoint and returns an opaque task id (the *session*); progress is
//! polled; finished artifacts are fetched separately.  The adapter holds
//! no shared mutable state — the inner [`reqwest::Client`] pools
//! connections internally and is thread-safe.

use base64::Engine as _;
use serde::Deserialize;
use thiserror::Error;

use crate::job::AppType;
use crate::registry::{Backend, BasicAuth};

/// Classified backend-communication failures.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// TCP/DNS/TLS/timeout failures.  Retryable.
    #[error("backend transport error: {0}")]
    Transport(String),

    /// Well-formed response saying the backend is warming up or holding a
    /// queue.  Retryable, treated like transport.
    #[error("backend busy: {0}")]
    Busy(String),

    /// 4xx with a parseable message.  Not retryable.
    #[error("backend rejected request: {0}")]
    BadRequest(String),

    /// 5xx or malformed response.  Retryable a bounded number of times.
    #[error("backend error: {0}")]
    Remote(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BackendError::BadRequest(_))
    }
}

/// One decoded progress poll.
#[derive(Debug, Clone)]
pub struct ProgressPoll {
    /// In `[0, 100]`.
    pub percent: f64,
    /// Decoded preview image bytes, when the backend sent one.
    pub preview: Option<Vec<u8>>,
    pub current_step: i64,
    pub total_steps: i64,
    /// `false` once the backend considers the generation finished.
    pub active: bool,
}

/// One generated artifact.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    /// File extension implied by the returned format (`png`, `jpg`).
    pub ext: String,
}

/// Final artifacts for a finished session.
#[derive(Debug, Clone)]
pub struct GenerationResults {
    pub images: Vec<GeneratedImage>,
    pub info: serde_json::Value,
}

/// Adapter bound to a single backend.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    auth: Option<BasicAuth>,
    app_type: AppType,
}

impl BackendClient {
    pub fn new(backend: &Backend, app_type: AppType) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("easel/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: backend.base_url.trim_end_matches('/').to_owned(),
            auth: backend.auth.clone(),
            app_type,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, self.url(path));
        if let Some(auth) = &self.auth {
            req = req.basic_auth(&auth.username, Some(&auth.password));
        }
        req
    }

    /// Submit normalized generation parameters; returns the session
    /// handle.
    pub async fn submit(&self, params: &serde_json::Value) -> Result<String, BackendError> {
        let AppType::Forge = self.app_type;
        let resp = self
            .request(reqwest::Method::POST, "agent-scheduler/v1/queue/txt2img")
            .json(params)
            .send()
            .await
            .map_err(transport)?;
        let resp = check_status(resp).await?;

        let body: SubmitBody = resp
            .json()
            .await
            .map_err(|e| BackendError::Remote(format!("malformed submit response: {e}")))?;
        match body.task_id {
            Some(id) if !id.is_empty() => Ok(id),
            // Synchronous-only dialects answer without a handle.
            Some(_) | None => Ok(String::new()),
        }
    }

    /// Poll generation progress for `session`.
    pub async fn poll_progress(&self, session: &str) -> Result<ProgressPoll, BackendError> {
        let resp = self
            .request(reqwest::Method::POST, "internal/progress")
            .json(&serde_json::json!({ "id_task": session, "live_preview": true }))
            .send()
            .await
            .map_err(transport)?;
        let resp = check_status(resp).await?;

        let body: ProgressBody = resp
            .json()
            .await
            .map_err(|e| BackendError::Remote(format!("malformed progress response: {e}")))?;

        let percent = (body.progress.unwrap_or(0.0) * 100.0).clamp(0.0, 100.0);
        let preview = body
            .live_preview
            .as_deref()
            .and_then(|raw| decode_image_payload(raw).ok());
        Ok(ProgressPoll {
            percent,
            preview,
            current_step: body.sampling_step,
            total_steps: body.sampling_steps,
            // A queued task has not started but is not finished either.
            active: !body.completed && (body.active || body.queued),
        })
    }

    /// Fetch final artifacts for a finished session.  Idempotent.
    pub async fn fetch_results(&self, session: &str) -> Result<GenerationResults, BackendError> {
        let path = format!("agent-scheduler/v1/results/{session}");
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(transport)?;
        let resp = check_status(resp).await?;

        let body: ResultsBody = resp
            .json()
            .await
            .map_err(|e| BackendError::Remote(format!("malformed results response: {e}")))?;
        if !body.success {
            return Err(BackendError::Remote(
                body.message
                    .unwrap_or_else(|| "backend reported failure without a message".to_owned()),
            ));
        }

        let mut images = Vec::with_capacity(body.data.len());
        let mut infotexts = Vec::new();
        for item in body.data {
            let bytes = decode_image_payload(&item.image)
                .map_err(|e| BackendError::Remote(format!("undecodable result image: {e}")))?;
            let ext = sniff_extension(&bytes);
            images.push(GeneratedImage { bytes, ext });
            if let Some(text) = item.infotext {
                infotexts.push(serde_json::Value::String(text));
            }
        }
        Ok(GenerationResults {
            images,
            info: serde_json::json!({ "infotexts": infotexts }),
        })
    }

    /// Best-effort cancellation; never fails on an unknown session.
    pub async fn cancel(&self, session: &str) {
        let path = format!("agent-scheduler/v1/task/{session}/cancel");
        match self.request(reqwest::Method::POST, &path).send().await {
            Ok(resp) if !resp.status().is_success() => {
                tracing::debug!(session, status = %resp.status(), "backend cancel ignored");
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(session, error = %e, "backend cancel failed"),
        }
    }
}

fn transport(e: reqwest::Error) -> BackendError {
    BackendError::Transport(e.to_string())
}

/// Map non-success statuses onto the error taxonomy.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = extract_message(resp).await;
    if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
        Err(BackendError::Busy(message))
    } else if status.is_client_error() {
        Err(BackendError::BadRequest(message))
    } else {
        Err(BackendError::Remote(format!("{status}: {message}")))
    }
}

async fn extract_message(resp: reqwest::Response) -> String {
    let raw = resp.text().await.unwrap_or_default();
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&raw) {
        for key in ["detail", "error", "message"] {
            if let Some(msg) = v.get(key).and_then(|m| m.as_str()) {
                return msg.to_owned();
            }
        }
    }
    if raw.is_empty() {
        "no response body".to_owned()
    } else {
        raw
    }
}

/// Decode a raw or `data:image/...;base64,` payload into bytes.
fn decode_image_payload(raw: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let b64 = match raw.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => raw,
    };
    base64::engine::general_purpose::STANDARD.decode(b64.trim())
}

/// Best-effort extension from magic bytes; backends overwhelmingly return
/// PNG, so that is the fallback.
fn sniff_extension(bytes: &[u8]) -> String {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Jpeg) => "jpg".to_owned(),
        _ => "png".to_owned(),
    }
}

#[derive(Deserialize)]
struct SubmitBody {
    task_id: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ProgressBody {
    active: bool,
    queued: bool,
    completed: bool,
    progress: Option<f64>,
    live_preview: Option<String>,
    sampling_step: i64,
    sampling_steps: i64,
}

#[derive(Deserialize)]
struct ResultsBody {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Vec<ResultItem>,
}

#[derive(Deserialize)]
struct ResultItem {
    image: String,
    #[serde(default)]
    infotext: Option<String>,
}
