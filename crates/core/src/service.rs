use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use vox_transport::{Category, MixParams, TrackId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("not signed in")]
    Auth,

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ServiceError::InvalidResponse(err.to_string())
        } else {
            ServiceError::Network(err.to_string())
        }
    }
}

/// One raw vocal sent off for processing.
#[derive(Debug, Clone)]
pub struct MixRequest {
    pub track: TrackId,
    pub file_name: String,
    pub bytes: Arc<[u8]>,
    pub category: Category,
    pub params: MixParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MixSubmission {
    /// The service answered with the processed audio straight away.
    Done(String),
    Job(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Running { percent: f64 },
    Done { url: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterTrackSpec {
    pub category: Category,
    pub gain: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mixed_track_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MasterRequest {
    pub specs: Vec<MasterTrackSpec>,
    /// `(file name, bytes)` of every track without a `mixed_track_id`, in
    /// the order of `specs`. The backend pairs them up by position.
    pub files: Vec<(String, Arc<[u8]>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterResult {
    pub mix_url: String,
    pub master_url: String,
}

/// The external mixing and mastering backend.
pub trait MixService: Send + Sync {
    fn submit<'a>(
        &'a self,
        request: &'a MixRequest,
    ) -> BoxFuture<'a, Result<MixSubmission, ServiceError>>;

    fn status<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<JobStatus, ServiceError>>;

    fn master<'a>(
        &'a self,
        request: &'a MasterRequest,
    ) -> BoxFuture<'a, Result<MasterResult, ServiceError>>;

    /// Bounce every track into one file. Returns the reference of the result.
    fn render_mix<'a>(
        &'a self,
        request: &'a MasterRequest,
    ) -> BoxFuture<'a, Result<String, ServiceError>>;

    /// Bearer token for subsequent requests; `None` signs out.
    fn set_token(&self, token: Option<String>);
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    job_id: Option<String>,
    mixed_track_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    status: String,
    #[serde(default)]
    percent: Option<f64>,
    mixed_track_url: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MasterBody {
    mix_url: Option<String>,
    master_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenderBody {
    mix_url: Option<String>,
}

impl SubmitBody {
    fn into_submission(self) -> Result<MixSubmission, ServiceError> {
        match (self.mixed_track_url, self.job_id) {
            (Some(url), _) => Ok(MixSubmission::Done(url)),
            (None, Some(job)) => Ok(MixSubmission::Job(job)),
            (None, None) => Err(ServiceError::InvalidResponse(
                "neither a job id nor a mixed track".into(),
            )),
        }
    }
}

impl StatusBody {
    fn into_status(self) -> Result<JobStatus, ServiceError> {
        match self.status.as_str() {
            "done" | "completed" => match self.mixed_track_url {
                Some(url) => Ok(JobStatus::Done { url }),
                None => Err(ServiceError::InvalidResponse("finished job without a result".into())),
            },
            "error" | "failed" => Ok(JobStatus::Failed {
                message: self.error.unwrap_or_default(),
            }),
            _ => Ok(JobStatus::Running {
                percent: self.percent.unwrap_or(0.0),
            }),
        }
    }
}

/// Pull a readable message out of an error body: `{"detail": "..."}` or a
/// validation list `{"detail": [{"msg": "..."}]}`.
fn error_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        serde_json::Value::String(message) => Some(message.clone()),
        serde_json::Value::Array(items) => {
            let messages: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                .collect();
            (!messages.is_empty()).then(|| messages.join("; "))
        }
        _ => None,
    }
}

/// [`MixService`] over the backend's HTTP API.
#[derive(Debug)]
pub struct HttpMixService {
    client: reqwest::Client,
    api_base: String,
    token: Mutex<Option<String>>,
}

impl HttpMixService {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.lock().as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ServiceError> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            log::warn!("backend rejected credentials, signing out");
            *self.token.lock() = None;
            return Err(ServiceError::Auth);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_detail(&body).unwrap_or_else(|| {
                if status == StatusCode::PAYMENT_REQUIRED {
                    "No credits left for this operation.".to_string()
                } else {
                    body
                }
            });
            return Err(ServiceError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}

fn flag(value: bool) -> String {
    value.to_string()
}

fn mix_form(request: &MixRequest) -> Form {
    let params = &request.params;
    let file = Part::bytes(request.bytes.to_vec()).file_name(request.file_name.clone());
    Form::new()
        .part("file", file)
        .text("category", request.category.as_str())
        .text("deesser", flag(params.deesser))
        .text("deesser_mode", params.deesser_mode.to_string())
        .text("delay", flag(params.delay))
        .text("delay_intensity", params.delay_intensity.to_string())
        .text("delay_division", params.delay_division.as_str())
        .text("reverb", flag(params.reverb))
        .text("reverb_mode", params.reverb_mode.to_string())
        .text("bpm", params.bpm.to_string())
        .text("tone_low", params.tone_low.to_string())
        .text("tone_mid", params.tone_mid.to_string())
        .text("tone_high", params.tone_high.to_string())
        .text("air", flag(params.air))
        .text("phone_fx", flag(params.phone_fx))
        .text("doubler", flag(params.doubler))
        .text("robot", flag(params.robot))
}

fn track_form(request: &MasterRequest) -> Result<Form, ServiceError> {
    let specs = serde_json::to_string(&request.specs)
        .map_err(|err| ServiceError::InvalidResponse(err.to_string()))?;
    let mut form = Form::new().text("track_specs", specs);
    for (name, bytes) in &request.files {
        form = form.part("files", Part::bytes(bytes.to_vec()).file_name(name.clone()));
    }
    Ok(form)
}

impl MixService for HttpMixService {
    fn submit<'a>(
        &'a self,
        request: &'a MixRequest,
    ) -> BoxFuture<'a, Result<MixSubmission, ServiceError>> {
        Box::pin(async move {
            log::info!("submitting mix for track {}", request.track);
            let body: SubmitBody = self
                .send(self.client.post(self.url("/api/track/mix")).multipart(mix_form(request)))
                .await?;
            body.into_submission()
        })
    }

    fn status<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<JobStatus, ServiceError>> {
        Box::pin(async move {
            let body: StatusBody = self
                .send(
                    self.client
                        .get(self.url("/api/track/mix/status"))
                        .query(&[("job_id", job_id)]),
                )
                .await?;
            body.into_status()
        })
    }

    fn master<'a>(
        &'a self,
        request: &'a MasterRequest,
    ) -> BoxFuture<'a, Result<MasterResult, ServiceError>> {
        Box::pin(async move {
            let form = track_form(request)?;
            let body: MasterBody = self
                .send(self.client.post(self.url("/api/master")).multipart(form))
                .await?;
            match (body.mix_url, body.master_url) {
                (Some(mix_url), Some(master_url)) => Ok(MasterResult { mix_url, master_url }),
                _ => Err(ServiceError::InvalidResponse("master response is missing a url".into())),
            }
        })
    }

    fn render_mix<'a>(
        &'a self,
        request: &'a MasterRequest,
    ) -> BoxFuture<'a, Result<String, ServiceError>> {
        Box::pin(async move {
            log::info!("rendering mix of {} tracks", request.specs.len());
            let form = track_form(request)?;
            let body: RenderBody = self
                .send(self.client.post(self.url("/api/render/mix")).multipart(form))
                .await?;
            body.mix_url.ok_or_else(|| {
                ServiceError::InvalidResponse("render response is missing a url".into())
            })
        })
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.lock() = token;
    }
}
