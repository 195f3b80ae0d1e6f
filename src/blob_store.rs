use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Failure classes shared by every blob store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Credentials rejected or expired.
    #[error("blob store rejected the credentials")]
    Unauthorized,
    /// Object too large or account quota exhausted.
    #[error("blob store quota or size limit reached")]
    QuotaExceeded,
    /// Bucket (or object) does not exist.
    #[error("blob store target not found")]
    NotFound,
    /// Throttled, timed out, or a 5xx after retries.
    #[error("blob store temporarily unavailable: {0}")]
    Transient(String),
    #[error("blob store error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobPage {
    pub names: Vec<String>,
    /// Token for the next page, `None` on the last page.
    pub next: Option<String>,
}

/// Per-name result of a multi-object delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl RemoveReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The hosted object store holding listing photos.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Name of the bucket-like namespace, as it appears inside public URLs.
    fn bucket(&self) -> &str;

    /// Public URL for `name`. Derived locally, no network round trip.
    fn public_url(&self, name: &str) -> String;

    async fn upload(&self, name: &str, content_type: &str, body: Bytes) -> Result<(), StoreError>;

    async fn list_page(&self, continuation: Option<String>) -> Result<BlobPage, StoreError>;

    async fn remove(&self, names: &[String]) -> Result<RemoveReport, StoreError>;
}

/// Store-side placeholders (e.g. `.emptyFolderPlaceholder`) are not photos.
pub fn is_placeholder(name: &str) -> bool {
    name.rsplit('/')
        .next()
        .map_or(true, |last| last.is_empty() || last.starts_with('.'))
}
