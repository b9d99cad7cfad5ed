//! reqwest-backed collaborators talking to the video backend.
//!
//! - `POST {base}/api/videos/upload` multipart form: `video`, `title`, `description`,
//!   `visibility`, `tags` (JSON array). Answers `{ "id": "..." }`.
//! - `GET {base}/api/videos/{id}/status` answers `{ "status": "...", "error": "..." }`.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use url::Url;
use super::channel::{
    CredentialProvider, ProcessingStatus, StatusOracle, Subscription, TransferChannel, TransferReporter,
};
use super::errors::ChannelError;
use super::progress_stream::ProgressStream;
use super::types::{Payload, VideoMetadata};

/// 256KB
const BODY_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Clone)]
struct ApiEndpoint {
    client: Client,
    base: Url,
    credentials: Arc<dyn CredentialProvider>,
}

impl ApiEndpoint {
    fn new(base_url: &str, credentials: Arc<dyn CredentialProvider>) -> Result<Self, ChannelError> {
        let mut base = Url::parse(base_url)?;
        // join() 会替换最后一段路径, 先补上结尾的 '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base,
            credentials,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ChannelError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ChannelError::InvalidResponse(format!("Invalid base url: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Turn a non-2xx response into a server error, preferring the body's `message`/`error`.
async fn error_from_response(response: Response) -> ChannelError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|body| {
            ["message", "error"]
                .iter()
                .find_map(|key| body.get(key).and_then(Value::as_str).map(String::from))
        })
        .unwrap_or_else(|| match text.trim() {
            "" => status.to_string(),
            text => text.to_string(),
        });

    ChannelError::server_error(status.as_u16(), message)
}

#[derive(Clone)]
pub struct HttpTransferChannel {
    endpoint: ApiEndpoint,
}

impl HttpTransferChannel {
    pub fn new(base_url: &str, credentials: Arc<dyn CredentialProvider>) -> Result<Self, ChannelError> {
        Ok(Self {
            endpoint: ApiEndpoint::new(base_url, credentials)?,
        })
    }

    async fn build_form(payload: Payload, metadata: &VideoMetadata, progress_tx: watch::Sender<u64>) -> Result<Form, ChannelError> {
        let length = payload.content_length();
        let reader = payload.open().await?;
        let body = ProgressStream::new(ReaderStream::with_capacity(reader, BODY_CHUNK_SIZE), progress_tx);
        let video = Part::stream_with_length(Body::wrap_stream(body), length)
            .file_name(payload.file_name)
            .mime_str(&payload.media_type)?;

        let form = Form::new()
            .part("video", video)
            .text("title", metadata.title.clone())
            .text("description", metadata.description.clone())
            .text("visibility", metadata.visibility.as_str())
            .text("tags", serde_json::json!(metadata.tags).to_string());

        Ok(form)
    }

    async fn parse_upload_response(response: Response) -> Result<String, ChannelError> {
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: Value = response.json().await?;
        ["id", "videoId"]
            .iter()
            .find_map(|key| match body.get(key) {
                Some(Value::String(id)) => Some(id.clone()),
                Some(Value::Number(id)) => Some(id.to_string()),
                _ => None,
            })
            .ok_or_else(|| ChannelError::InvalidResponse(format!("No video id in response: {}", body)))
    }

    async fn drive(request: RequestBuilder, mut progress_rx: watch::Receiver<u64>, total: u64, reporter: TransferReporter) {
        let send = request.send();
        tokio::pin!(send);
        let mut progress_open = true;

        let result = loop {
            tokio::select! {
                // 丢弃请求 future 即中断上传
                _ = reporter.cancelled() => {
                    debug!("upload request cancelled");
                    return;
                }
                changed = progress_rx.changed(), if progress_open => {
                    if changed.is_err() {
                        progress_open = false;
                        continue;
                    }
                    let sent = *progress_rx.borrow_and_update();
                    if total > 0 {
                        reporter.progress(sent as f64 / total as f64 * 100.0).await;
                    }
                }
                result = &mut send => break result,
            }
        };

        let outcome = match result {
            Ok(response) => Self::parse_upload_response(response).await,
            Err(err) => Err(ChannelError::Http(err)),
        };

        match outcome {
            Ok(remote_id) => reporter.succeed(remote_id).await,
            Err(err) => {
                warn!(error = %err, "upload request failed");
                reporter.fail(err.to_string()).await;
            }
        }
    }
}

#[async_trait]
impl TransferChannel for HttpTransferChannel {
    async fn submit(&self, payload: Payload, metadata: VideoMetadata) -> Result<Subscription, ChannelError> {
        let url = self.endpoint.url(&["api", "videos", "upload"])?;
        let total = payload.content_length();
        let (progress_tx, progress_rx) = watch::channel(0);
        let form = Self::build_form(payload, &metadata, progress_tx).await?;

        debug!(%url, total, "starting upload request");
        let request = self.endpoint
            .authorized(self.endpoint.client.post(url))
            .multipart(form);

        let (reporter, subscription) = Subscription::pair(32);
        tokio::spawn(Self::drive(request, progress_rx, total, reporter));

        Ok(subscription)
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl StatusBody {
    fn into_status(self) -> ProcessingStatus {
        match self.status.to_ascii_lowercase().as_str() {
            "completed" | "ready" | "processed" => ProcessingStatus::Completed,
            "failed" | "error" => ProcessingStatus::Failed(
                self.error
                    .or(self.message)
                    .unwrap_or_else(|| "processing failed".to_string()),
            ),
            // 未知状态按处理中对待
            _ => ProcessingStatus::Processing,
        }
    }
}

#[derive(Clone)]
pub struct HttpStatusOracle {
    endpoint: ApiEndpoint,
}

impl HttpStatusOracle {
    pub fn new(base_url: &str, credentials: Arc<dyn CredentialProvider>) -> Result<Self, ChannelError> {
        Ok(Self {
            endpoint: ApiEndpoint::new(base_url, credentials)?,
        })
    }
}

#[async_trait]
impl StatusOracle for HttpStatusOracle {
    async fn query(&self, remote_id: &str) -> Result<ProcessingStatus, ChannelError> {
        let url = self.endpoint.url(&["api", "videos", remote_id, "status"])?;
        let response = self.endpoint
            .authorized(self.endpoint.client.get(url))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: StatusBody = response.json().await?;
        Ok(body.into_status())
    }
}
