//! Blob downloads (report exports, attachments)

use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_DISPOSITION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;
use tracing::{info, instrument};

use crate::client::{ApiClient, RawResponse};
use crate::error::Result;
use crate::metrics;
use crate::request::RequestDescriptor;

const FALLBACK_FILENAME: &str = "download";

/// A downloaded body with the name the server suggested for it.
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Bytes,
    /// Bare file name, never a path.
    pub filename: String,
    pub content_type: Option<String>,
}

impl Download {
    fn from_response(path: &str, raw: RawResponse) -> Self {
        let filename = raw
            .headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename)
            .or_else(|| sanitize_filename(path.split('?').next().unwrap_or(path)))
            .unwrap_or_else(|| FALLBACK_FILENAME.to_string());
        Self {
            content_type: content_type(&raw.headers),
            bytes: raw.body,
            filename,
        }
    }

    /// Write the body into `dir` under `filename`, creating `dir` if needed.
    pub async fn save_to(&self, dir: impl AsRef<Path>) -> std::io::Result<PathBuf> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let target = dir.join(&self.filename);
        tokio::fs::write(&target, &self.bytes).await?;
        info!(path = %target.display(), bytes = self.bytes.len(), "download saved");
        Ok(target)
    }
}

impl ApiClient {
    /// GET a binary resource. Same credential, timeout and retry handling as
    /// `execute`, but the body is returned undecoded.
    #[instrument(skip_all, fields(path = %path))]
    pub async fn download(&self, path: &str, params: Option<&Value>) -> Result<Download> {
        let mut descriptor =
            RequestDescriptor::get(path).header(ACCEPT, HeaderValue::from_static("*/*"));
        if let Some(params) = params {
            descriptor = descriptor.query(params);
        }

        let started = Instant::now();
        let result = self
            .execute_raw(&descriptor)
            .await
            .map(|raw| Download::from_response(path, raw));
        metrics::record_request(
            "GET",
            metrics::outcome(&result),
            started.elapsed().as_secs_f64(),
        );
        result
    }
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// File name from a `Content-Disposition` value. `filename*` (RFC 5987)
/// wins over `filename`.
fn disposition_filename(value: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in value.split(';').map(str::trim) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // charset'language'percent-encoded
                let encoded = raw.trim().splitn(3, '\'').nth(2).unwrap_or(raw);
                extended = Some(percent_decode(encoded.trim_matches('"')));
            }
            "filename" => plain = Some(raw.trim().trim_matches('"').to_string()),
            _ => {}
        }
    }

    extended
        .and_then(|name| sanitize_filename(&name))
        .or_else(|| plain.and_then(|name| sanitize_filename(&name)))
}

/// Last path component with control characters removed. `None` when nothing
/// usable remains.
fn sanitize_filename(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    match cleaned {
        "" | "." | ".." => None,
        _ => Some(cleaned.to_string()),
    }
}

/// Lossy so a stray non-UTF-8 byte costs one character, not the whole name.
/// Malformed `%` sequences are kept literally.
fn percent_decode(input: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(input.as_bytes())).into_owned()
}
