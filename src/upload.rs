//! Image validation and concurrent upload to the blob host.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use reqwest::{multipart::{Form, Part}, Client};
use serde::Deserialize;
use std::{fmt, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    error::{AppError, UploadError, ValidationError},
    models::{RejectedFile, UploadReport},
    session::SessionStore,
};

pub const ALLOWED_MIME_TYPES: [&str; 5] = ["image/jpeg", "image/jpg", "image/png", "image/gif", "image/webp"];
pub const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// A file picked by the user, held in memory until uploaded.
#[derive(Clone)]
pub struct ImageFile {
    pub filename: String,
    pub mime: String,
    pub bytes: Bytes,
}

impl ImageFile {
    pub fn new(filename: impl Into<String>, mime: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self { filename: filename.into(), mime: mime.into(), bytes: bytes.into() }
    }

    /// Uses the declared content type unless it is missing or generic, in
    /// which case the type is sniffed from the file's magic bytes.
    pub fn from_part(filename: impl Into<String>, declared: Option<&str>, bytes: Bytes) -> Self {
        let declared = declared.map(str::trim).filter(|m| !m.is_empty() && *m != "application/octet-stream");
        let mime = match declared {
            Some(mime) => mime.to_string(),
            None => image::guess_format(&bytes)
                .map(|format| format.to_mime_type().to_string())
                .unwrap_or_else(|_| "application/octet-stream".to_string()),
        };
        Self::new(filename, mime, bytes)
    }

    pub fn size(&self) -> u64 { self.bytes.len() as u64 }
}

impl fmt::Debug for ImageFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageFile")
            .field("filename", &self.filename)
            .field("mime", &self.mime)
            .field("size", &self.size())
            .finish()
    }
}

pub fn validate(file: &ImageFile) -> Result<(), ValidationError> {
    if !ALLOWED_MIME_TYPES.contains(&file.mime.as_str()) {
        return Err(ValidationError::UnsupportedType { filename: file.filename.clone(), mime: file.mime.clone() });
    }
    if file.size() > MAX_FILE_BYTES {
        return Err(ValidationError::TooLarge { filename: file.filename.clone(), size: file.size(), limit: MAX_FILE_BYTES });
    }
    Ok(())
}

pub fn is_valid_image(file: &ImageFile) -> bool {
    validate(file).is_ok()
}

/// Splits a selection into uploadable files and per-file rejections,
/// keeping the selection order of both.
pub fn partition_valid(files: Vec<ImageFile>) -> (Vec<ImageFile>, Vec<RejectedFile>) {
    let mut valid = Vec::new();
    let mut rejected = Vec::new();
    for file in files {
        match validate(&file) {
            Ok(()) => valid.push(file),
            Err(e) => {
                warn!("⚠️ Rejected {}: {}", file.filename, e);
                rejected.push(RejectedFile { filename: file.filename, reason: e.to_string() });
            }
        }
    }
    (valid, rejected)
}

/// Stores one file and returns its public URL.
#[async_trait]
pub trait ImageHost: Send + Sync {
    async fn upload(&self, file: &ImageFile) -> Result<String, UploadError>;
}

#[derive(Debug, Deserialize)]
struct HostResponse {
    #[serde(default)]
    secure_url: Option<String>,
}

/// Unsigned-preset uploads to Cloudinary.
pub struct CloudinaryHost {
    client: Client,
    endpoint: String,
    upload_preset: String,
    timeout: Duration,
}

impl CloudinaryHost {
    pub fn new(endpoint: impl Into<String>, upload_preset: impl Into<String>, timeout: Duration) -> Self {
        Self { client: Client::new(), endpoint: endpoint.into(), upload_preset: upload_preset.into(), timeout }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.upload_api_url.clone(), config.upload_preset.clone(), config.upload_timeout)
    }
}

fn classify(filename: &str, err: reqwest::Error) -> UploadError {
    if err.is_timeout() {
        UploadError::Timeout { filename: filename.to_string() }
    } else {
        UploadError::Network { filename: filename.to_string(), message: err.to_string() }
    }
}

#[async_trait]
impl ImageHost for CloudinaryHost {
    async fn upload(&self, file: &ImageFile) -> Result<String, UploadError> {
        validate(file)?;
        info!("📤 Uploading {} ({:.2} KB) to {}", file.filename, file.size() as f64 / 1024.0, self.endpoint);

        let part = Part::bytes(file.bytes.to_vec())
            .file_name(file.filename.clone())
            .mime_str(&file.mime)
            .map_err(|_| ValidationError::UnsupportedType { filename: file.filename.clone(), mime: file.mime.clone() })?;
        let form = Form::new()
            .text("upload_preset", self.upload_preset.clone())
            .part("file", part);

        let response = self.client
            .post(&self.endpoint)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify(&file.filename, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("❌ Image host rejected {} ({}): {}", file.filename, status, body);
            return Err(UploadError::Rejected { filename: file.filename.clone(), status: status.as_u16(), body });
        }

        let body: HostResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                UploadError::Timeout { filename: file.filename.clone() }
            } else {
                warn!("⚠️ Unreadable upload response for {}: {}", file.filename, e);
                UploadError::MalformedResponse { filename: file.filename.clone() }
            }
        })?;

        let url = body
            .secure_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| UploadError::MalformedResponse { filename: file.filename.clone() })?;
        info!("✅ Uploaded {}: {}", file.filename, url);
        Ok(url)
    }
}

/// Uploads every file concurrently. Succeeds only if all uploads succeed;
/// URLs come back in the order of `files`, not in completion order.
pub async fn upload_all(host: &dyn ImageHost, files: &[ImageFile]) -> Result<Vec<String>, UploadError> {
    for file in files {
        validate(file)?;
    }
    info!("📤 Uploading batch of {} files", files.len());
    let uploads = files.iter().enumerate().map(|(index, file)| async move {
        info!("Starting upload {}/{}: {}", index + 1, files.len(), file.filename);
        host.upload(file).await
    });
    match try_join_all(uploads).await {
        Ok(urls) => {
            info!("✅ All {} uploads succeeded", urls.len());
            Ok(urls)
        }
        Err(e) => {
            error!("❌ Upload batch failed: {}", e);
            Err(e)
        }
    }
}

/// Runs the upload action for a session: filters the selection, uploads the
/// valid files as one batch, and commits their URLs only if the whole batch
/// succeeded.
#[derive(Clone)]
pub struct UploadOrchestrator {
    host: Arc<dyn ImageHost>,
}

impl UploadOrchestrator {
    pub fn new(host: Arc<dyn ImageHost>) -> Self { Self { host } }

    pub async fn upload_selection(
        &self,
        sessions: &SessionStore,
        session_id: Uuid,
        files: Vec<ImageFile>,
    ) -> Result<UploadReport, AppError> {
        sessions.with(session_id, |_| ())?;
        let (valid, rejected) = partition_valid(files);
        if valid.is_empty() {
            return Err(ValidationError::NoValidFiles.into());
        }

        sessions.with_mut(session_id, |s| {
            s.clear_error();
            s.set_status("uploading images...", None);
        })?;

        match upload_all(self.host.as_ref(), &valid).await {
            Ok(urls) => {
                let images = sessions.with_mut(session_id, |s| {
                    s.append_images(&urls);
                    s.set_status(format!("uploaded {} images", urls.len()), Some(crate::session::STATUS_TTL));
                    s.images().to_vec()
                })?;
                Ok(UploadReport { uploaded: urls, rejected, images })
            }
            Err(e) => {
                // Session may already be gone; the upload error is what matters.
                let _ = sessions.with_mut(session_id, |s| {
                    s.clear_status();
                    s.record_error(e.to_string());
                });
                Err(e.into())
            }
        }
    }
}
