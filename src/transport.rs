//! Request descriptors and the network seam.
//!
//! The [`RequestGateway`](crate::gateway::RequestGateway) never talks to the
//! network directly; it hands an immutable [`RequestDescriptor`] to a
//! [`Transport`]. [`HttpTransport`] is the `reqwest` implementation used in
//! production. Tests substitute scripted transports.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};

/// Size of the pieces an upload body is streamed in.
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Upload progress callback: `(bytes_sent, bytes_total)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// A file ready to be sent as `multipart/form-data`.
#[derive(Clone)]
pub struct UploadFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Arc<Vec<u8>>,
    pub tags: Vec<String>,
}

impl UploadFile {
    pub fn from_bytes(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        Self {
            content_type: content_type_for(&file_name).to_string(),
            file_name,
            bytes: Arc::new(bytes),
            tags: Vec::new(),
        }
    }

    pub async fn from_path(path: &Path) -> ApiResult<Self> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self::from_bytes(file_name, bytes))
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadFile")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .field("tags", &self.tags)
            .finish()
    }
}

/// MIME type from a file extension.
pub fn content_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "md" | "markdown" => "text/markdown",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "ogg" => "video/ogg",
        _ => "application/octet-stream",
    }
}

#[derive(Clone)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Multipart {
        file: UploadFile,
        on_progress: Option<ProgressFn>,
    },
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Multipart { file, .. } => f.debug_tuple("Multipart").field(file).finish(),
        }
    }
}

/// One logical request. Retried attempts reuse the same descriptor.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Path relative to the configured base URL, or an absolute URL.
    pub url: String,
    pub body: RequestBody,
    pub headers: Vec<(String, String)>,
    /// Whether a bearer token was attached.
    pub authenticated: bool,
    /// Login or registration: a 401 means rejected credentials.
    pub credential_request: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: RequestBody::Empty,
            headers: Vec::new(),
            authenticated: false,
            credential_request: false,
        }
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn multipart(mut self, file: UploadFile, on_progress: Option<ProgressFn>) -> Self {
        self.body = RequestBody::Multipart { file, on_progress };
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        let mut this = self.header("Authorization", format!("Bearer {}", token));
        this.authenticated = true;
        this
    }

    /// Mark the request as carrying credentials instead of a session.
    pub fn credentials(mut self) -> Self {
        self.credential_request = true;
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            body: serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Sends one attempt of a request and returns the raw response.
///
/// Implementations report network failures as [`ApiError::Transport`] and
/// return every HTTP response, successful or not, as a [`RawResponse`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestDescriptor) -> ApiResult<RawResponse>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &ApiConfig) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &RequestDescriptor) -> ApiResult<RawResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.resolve(&request.url))
            .header("Accept", "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart { file, on_progress } => {
                builder.multipart(multipart_form(file, on_progress.clone())?)
            }
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(RawResponse { status, body })
    }
}

/// Build the form, streaming the file so progress tracks bytes handed to the
/// connection.
fn multipart_form(file: &UploadFile, on_progress: Option<ProgressFn>) -> ApiResult<Form> {
    let total = file.len();
    let chunks: Vec<Vec<u8>> = file
        .bytes
        .chunks(UPLOAD_CHUNK_BYTES)
        .map(|c| c.to_vec())
        .collect();
    let mut sent = 0u64;
    let stream = futures_util::stream::iter(chunks.into_iter().map(move |chunk| {
        sent += chunk.len() as u64;
        if let Some(cb) = &on_progress {
            cb(sent, total);
        }
        Ok::<_, std::io::Error>(chunk)
    }));

    let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
        .file_name(file.file_name.clone())
        .mime_str(&file.content_type)?;

    let mut form = Form::new().part("file", part);
    if !file.tags.is_empty() {
        let tags = serde_json::to_string(&file.tags).map_err(|e| ApiError::Decode(e.to_string()))?;
        form = form.text("tags", tags);
    }
    Ok(form)
}
