use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob_store::{BlobStore, StoreError};
use crate::image_file::{
    anonymize_filename, extension_for_mime, sanitize_stem, ImageFile, MAX_IMAGE_BYTES,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    InvalidFile,
    Authentication,
    Quota,
    Configuration,
    Transient,
    Other,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("'{0}' is not a supported image")]
    InvalidType(String),
    #[error("'{file_name}' is {size} bytes, the limit is {limit} bytes")]
    TooLarge {
        file_name: String,
        size: usize,
        limit: usize,
    },
    #[error("storage session is invalid or expired, please sign in again")]
    Authentication,
    #[error("storage quota exceeded")]
    Quota,
    #[error("storage is misconfigured: {0}")]
    Configuration(String),
    #[error("upload timed out or the network failed, please retry: {0}")]
    Transient(String),
    #[error("upload failed: {0}")]
    Other(String),
}

impl UploadError {
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            Self::InvalidType(_) => UploadErrorKind::InvalidFile,
            Self::TooLarge { .. } | Self::Quota => UploadErrorKind::Quota,
            Self::Authentication => UploadErrorKind::Authentication,
            Self::Configuration(_) => UploadErrorKind::Configuration,
            Self::Transient(_) => UploadErrorKind::Transient,
            Self::Other(_) => UploadErrorKind::Other,
        }
    }

    pub fn requires_reauthentication(&self) -> bool {
        self.kind() == UploadErrorKind::Authentication
    }

    fn from_store(err: StoreError, bucket: &str) -> Self {
        match err {
            StoreError::Unauthorized => Self::Authentication,
            StoreError::QuotaExceeded => Self::Quota,
            StoreError::NotFound => Self::Configuration(format!("bucket '{bucket}' not found")),
            StoreError::Transient(msg) => Self::Transient(msg),
            StoreError::Other(msg) => Self::Other(msg),
        }
    }
}

/// Puts single images into the blob store. No batching and no retries beyond what the
/// store client does on its own.
#[derive(Clone)]
pub struct UploadGateway {
    store: Arc<dyn BlobStore>,
    max_bytes: usize,
}

impl UploadGateway {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            max_bytes: MAX_IMAGE_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub async fn upload(&self, file: &ImageFile) -> Result<UploadedImage, UploadError> {
        // The transcoder already caps converted images; originals staged after a failed
        // conversion still need the check.
        let mime = match file.sniffed_mime() {
            Some(mime) if file.declares_image() => mime,
            _ => return Err(UploadError::InvalidType(file.file_name.clone())),
        };
        if file.len() > self.max_bytes {
            return Err(UploadError::TooLarge {
                file_name: file.file_name.clone(),
                size: file.len(),
                limit: self.max_bytes,
            });
        }

        let name = blob_name(file, mime);

        if let Err(err) = self
            .store
            .upload(&name, mime, file.bytes.clone())
            .await
        {
            warn!(
                file = %anonymize_filename(&file.file_name),
                error = %err,
                "Image upload failed"
            );
            return Err(UploadError::from_store(err, self.store.bucket()));
        }

        let url = self.store.public_url(&name);
        info!(%name, size = file.len(), "Uploaded image");
        Ok(UploadedImage { name, url })
    }
}

/// `{unix millis}-{random}-{sanitized stem}.{ext}`, where `ext` follows the real encoding.
fn blob_name(file: &ImageFile, mime: &str) -> String {
    let ext = extension_for_mime(mime).unwrap_or("bin");
    let token = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}.{}",
        Utc::now().timestamp_millis(),
        &token[..12],
        sanitize_stem(file.stem()),
        ext
    )
}
