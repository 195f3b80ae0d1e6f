use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob_names::BlobNameResolver;
use crate::blob_store::{BlobStore, StoreError};
use crate::property_repository::{PropertyStore, RepoError};

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("property {0} not found")]
    NotFound(Uuid),
    #[error("loading the property failed: {0}")]
    Load(RepoError),
    #[error("deleting its images failed, the property was kept: {0}")]
    Blobs(StoreError),
    #[error(
        "{} of its images could not be deleted, the property was kept",
        .failed.len()
    )]
    PartialBlobs {
        deleted: Vec<String>,
        failed: Vec<(String, String)>,
    },
    #[error("images were deleted but the property row could not be: {0}")]
    Row(RepoError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedProperty {
    pub id: Uuid,
    pub deleted_blob_count: usize,
    /// References that matched no blob name and were left alone.
    pub skipped_references: Vec<String>,
}

/// Removes a listing's blobs, then its row.
///
/// The row stays whenever any blob could not be removed, so a retry sees the full
/// reference list again. Removing an already-removed blob succeeds, which makes the
/// retry safe.
pub struct SafeRecordDeleter {
    store: Arc<dyn BlobStore>,
    records: Arc<dyn PropertyStore>,
    names: Arc<BlobNameResolver>,
}

impl SafeRecordDeleter {
    pub fn new(
        store: Arc<dyn BlobStore>,
        records: Arc<dyn PropertyStore>,
        names: Arc<BlobNameResolver>,
    ) -> Self {
        Self {
            store,
            records,
            names,
        }
    }

    pub async fn delete(&self, id: Uuid) -> Result<DeletedProperty, DeleteError> {
        let record = self
            .records
            .get(id)
            .await
            .map_err(DeleteError::Load)?
            .ok_or(DeleteError::NotFound(id))?;

        let extracted = self.names.extract_all(&record.images);
        let mut names = extracted.names;
        names.sort();
        names.dedup();

        let mut deleted_blob_count = 0;
        if !names.is_empty() {
            let report = self.store.remove(&names).await.map_err(|err| {
                warn!(%id, error = %err, "Blob removal failed, keeping property");
                DeleteError::Blobs(err)
            })?;
            if !report.is_complete() {
                warn!(
                    %id,
                    deleted = report.deleted.len(),
                    failed = report.failed.len(),
                    "Some blobs could not be removed, keeping property"
                );
                sentry::capture_message(
                    &format!(
                        "Property delete {id}: {} of {} blobs failed to delete",
                        report.failed.len(),
                        names.len()
                    ),
                    sentry::Level::Warning,
                );
                return Err(DeleteError::PartialBlobs {
                    deleted: report.deleted,
                    failed: report.failed,
                });
            }
            deleted_blob_count = report.deleted.len();
        }

        self.records.delete(id).await.map_err(|err| match err {
            RepoError::NotFound(id) => DeleteError::NotFound(id),
            other => {
                sentry::capture_message(
                    &format!("Property delete {id}: blobs removed but row delete failed: {other}"),
                    sentry::Level::Error,
                );
                DeleteError::Row(other)
            }
        })?;

        info!(%id, blobs = deleted_blob_count, "Property deleted");
        Ok(DeletedProperty {
            id,
            deleted_blob_count,
            skipped_references: extracted.unresolved,
        })
    }
}
