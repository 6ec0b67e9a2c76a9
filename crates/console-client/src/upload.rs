//! Multipart file uploads
//!
//! Files are checked against the size limit and extension allow-list before
//! anything touches the network, including credential renewal. Accepted files
//! go through the executor's attempt loop with the upload retry budget, as a
//! streamed multipart body that reports progress as chunks are handed to the
//! transport.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::HeaderValue;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::classify::parse_payload;
use crate::client::{ApiClient, IDEMPOTENCY_KEY};
use crate::error::{ApiError, Result};
use crate::metrics;
use crate::retry::RetryPolicy;

/// 10 MiB.
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "txt", "md", "jpg", "jpeg", "png", "gif", "svg", "zip", "tar", "gz",
    "xml", "json", "csv",
];

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Called with the fraction of the file sent so far, in `0.0..=1.0`.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    pub max_bytes: u64,
    /// Lowercase, without the leading dot.
    pub allowed_extensions: Vec<String>,
    pub retry: RetryPolicy,
    /// Per-attempt deadline; uploads get longer than ordinary calls.
    pub timeout: Duration,
    pub chunk_size: usize,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_bytes: MAX_UPLOAD_BYTES,
            allowed_extensions: ALLOWED_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            retry: RetryPolicy::uploads(),
            timeout: Duration::from_secs(120),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl UploadPolicy {
    /// Pre-flight check. Violations are `UploadRejected`.
    pub fn validate(&self, file: &UploadFile) -> Result<()> {
        self.check(&file.name, file.size())
    }

    fn check(&self, name: &str, size: u64) -> Result<()> {
        if size > self.max_bytes {
            return Err(ApiError::UploadRejected {
                message: format!(
                    "{name} is {size} bytes; the limit is {} bytes",
                    self.max_bytes
                ),
            });
        }

        match extension_of(name) {
            Some(ext) if self.allowed_extensions.iter().any(|allowed| *allowed == ext) => Ok(()),
            Some(ext) => Err(ApiError::UploadRejected {
                message: format!("{name}: file type .{ext} is not allowed"),
            }),
            None => Err(ApiError::UploadRejected {
                message: format!("{name}: file has no extension"),
            }),
        }
    }
}

/// File contents held in memory, as sent.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Bytes,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    /// Read a file from disk; the upload name is its final path component.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = file_name(path)?;
        Self::read(path, name).await
    }

    /// Like `from_path`, but the size on disk and the extension are checked
    /// against `policy` first. A rejected file is never read.
    pub async fn from_path_checked(path: impl AsRef<Path>, policy: &UploadPolicy) -> Result<Self> {
        let path = path.as_ref();
        let name = file_name(path)?;
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| read_error(path, e))?;
        if let Err(e) = policy.check(&name, metadata.len()) {
            warn!(error = %e, "upload rejected before reading");
            metrics::record_upload(e.kind().label());
            return Err(e);
        }
        Self::read(path, name).await
    }

    async fn read(path: &Path, name: String) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| read_error(path, e))?;
        Ok(Self::new(name, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Lowercased extension, if the name has one.
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.name)
    }
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| ApiError::InvalidRequest {
            message: format!("{} has no file name", path.display()),
        })
}

fn read_error(path: &Path, e: std::io::Error) -> ApiError {
    ApiError::InvalidRequest {
        message: format!("reading {}: {e}", path.display()),
    }
}

/// One upload call: target path, the file, extra form fields and an optional
/// progress callback.
pub struct UploadDescriptor {
    pub path: String,
    pub file: UploadFile,
    pub fields: Vec<(String, String)>,
    pub on_progress: Option<ProgressCallback>,
}

impl UploadDescriptor {
    pub fn new(path: impl Into<String>, file: UploadFile) -> Self {
        Self {
            path: path.into(),
            file,
            fields: Vec::new(),
            on_progress: None,
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

impl ApiClient {
    /// Validate, then POST the file as multipart field `file`.
    #[instrument(skip_all, fields(path = %upload.path, file = %upload.file.name, size = upload.file.size()))]
    pub async fn upload(&self, upload: UploadDescriptor) -> Result<Value> {
        let policy = &self.config().upload;
        if let Err(e) = policy.validate(&upload.file) {
            warn!(error = %e, "upload rejected before sending");
            metrics::record_upload(e.kind().label());
            return Err(e);
        }

        let key = HeaderValue::from_str(&Uuid::new_v4().to_string()).map_err(|e| {
            ApiError::InvalidRequest {
                message: format!("idempotency key: {e}"),
            }
        })?;

        let started = Instant::now();
        let result = self
            .dispatch(
                &Method::POST,
                &upload.path,
                &policy.retry,
                policy.timeout,
                |request| {
                    let form = build_form(&upload, policy.chunk_size)?;
                    Ok(request.header(IDEMPOTENCY_KEY, key.clone()).multipart(form))
                },
            )
            .await
            .map(|raw| parse_payload(&String::from_utf8_lossy(&raw.body)));

        let outcome = metrics::outcome(&result);
        metrics::record_upload(outcome);
        metrics::record_request("POST", outcome, started.elapsed().as_secs_f64());
        if result.is_ok() {
            info!("upload complete");
        }
        result
    }
}

fn build_form(upload: &UploadDescriptor, chunk_size: usize) -> Result<Form> {
    let file = &upload.file;
    let body = progress_body(file.bytes.clone(), chunk_size, upload.on_progress.clone());
    let mime = file.extension().map_or("application/octet-stream", |ext| mime_for(&ext));
    let part = Part::stream_with_length(body, file.size())
        .file_name(file.name.clone())
        .mime_str(mime)
        .map_err(|e| ApiError::InvalidRequest {
            message: format!("content type {mime}: {e}"),
        })?;

    let mut form = Form::new().part("file", part);
    for (name, value) in &upload.fields {
        form = form.text(name.clone(), value.clone());
    }
    Ok(form)
}

/// Split `bytes` into chunks, reporting cumulative progress as each one is
/// pulled by the transport.
fn progress_body(
    bytes: Bytes,
    chunk_size: usize,
    on_progress: Option<ProgressCallback>,
) -> reqwest::Body {
    let total = bytes.len();
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<Bytes> = if total == 0 {
        // One empty chunk so an empty file still reports completion
        vec![Bytes::new()]
    } else {
        (0..total)
            .step_by(chunk_size)
            .map(|start| bytes.slice(start..(start + chunk_size).min(total)))
            .collect()
    };

    let mut sent = 0usize;
    let stream = futures_util::stream::iter(chunks.into_iter().map(move |chunk| {
        sent += chunk.len();
        if let Some(callback) = &on_progress {
            let fraction = if total == 0 {
                1.0
            } else {
                sent as f64 / total as f64
            };
            callback(fraction);
        }
        Ok::<_, std::io::Error>(chunk)
    }));
    reqwest::Body::wrap_stream(stream)
}

fn mime_for(ext: &str) -> &'static str {
    match ext {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        "xml" => "application/xml",
        "json" => "application/json",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}
