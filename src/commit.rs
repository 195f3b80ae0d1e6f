//! Turning a submitted form plus its staged images into a stored listing.
//!
//! A commit runs `validate -> session -> upload pending -> merge -> write`. Each stage
//! must succeed before the next starts. Images are uploaded before the record that
//! references them is written. If a later stage fails, the uploaded blobs are left
//! behind for the reconciler; nothing is rolled back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{ensure_fresh_session, AuthError, SessionProvider};
use crate::property::{FieldError, PropertyForm};
use crate::property_repository::{PropertyStore, RepoError};
use crate::staged_images::{StagedImage, StagedImageSet};
use crate::upload_gateway::{UploadError, UploadGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStage {
    Validate,
    Session,
    UploadPending,
    MergeReferences,
    WriteRecord,
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("{} field(s) need attention", .0.len())]
    Validation(Vec<FieldError>),
    #[error("your session has expired, please sign in again ({0})")]
    Session(AuthError),
    #[error("image {position} could not be uploaded: {source}")]
    Upload {
        /// Index of the failing item in the staged set.
        position: usize,
        source: UploadError,
        /// Blobs stored before the failure. They stay unreferenced.
        uploaded_before_failure: usize,
    },
    #[error("merged {got} uploads into {expected} staged slots")]
    Merge { expected: usize, got: usize },
    #[error("the property could not be saved: {0}")]
    Write(RepoError),
    #[error("a save is already in progress")]
    AlreadyRunning,
}

impl CommitError {
    pub fn stage(&self) -> Option<CommitStage> {
        match self {
            Self::Validation(_) => Some(CommitStage::Validate),
            Self::Session(_) => Some(CommitStage::Session),
            Self::Upload { .. } => Some(CommitStage::UploadPending),
            Self::Merge { .. } => Some(CommitStage::MergeReferences),
            Self::Write(_) => Some(CommitStage::WriteRecord),
            Self::AlreadyRunning => None,
        }
    }

    pub fn requires_reauthentication(&self) -> bool {
        match self {
            Self::Session(_) => true,
            Self::Upload { source, .. } => source.requires_reauthentication(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommitSettings {
    /// Uploads in flight at once. Results are merged in staged order regardless.
    pub upload_concurrency: usize,
    /// Sessions expiring within this margin are refreshed before uploading.
    pub session_margin: chrono::Duration,
}

impl Default for CommitSettings {
    fn default() -> Self {
        Self {
            upload_concurrency: 3,
            session_margin: chrono::Duration::seconds(60),
        }
    }
}

/// Resets the flag it was created from when dropped.
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CommitCoordinator {
    gateway: UploadGateway,
    store: Arc<dyn PropertyStore>,
    settings: CommitSettings,
    in_flight: AtomicBool,
}

impl CommitCoordinator {
    pub fn new(
        gateway: UploadGateway,
        store: Arc<dyn PropertyStore>,
        settings: CommitSettings,
    ) -> Self {
        Self {
            gateway,
            store,
            settings,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Inserts (`id = None`) or overwrites the listing, returning its id. `session` is
    /// the session of the admin submitting the form.
    pub async fn commit(
        &self,
        id: Option<Uuid>,
        form: &PropertyForm,
        staged: &StagedImageSet,
        session: &dyn SessionProvider,
    ) -> Result<Uuid, CommitError> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            info!(?id, "Commit ignored, another one is in flight");
            return Err(CommitError::AlreadyRunning);
        };

        let draft = form.validate().map_err(CommitError::Validation)?;

        ensure_fresh_session(session, self.settings.session_margin)
            .await
            .map_err(CommitError::Session)?;

        let items = staged.items();
        let uploaded = self.upload_pending(items).await?;
        let uploaded_count = uploaded.len();
        let references = merge_references(items, uploaded)?;

        sentry::add_breadcrumb(sentry::Breadcrumb {
            category: Some("commit".into()),
            message: Some(format!(
                "Writing property with {} images ({} new)",
                references.len(),
                uploaded_count
            )),
            level: sentry::Level::Info,
            ..Default::default()
        });

        let written = match id {
            Some(id) => self
                .store
                .update(id, &draft, &references)
                .await
                .map(|()| id),
            None => self.store.insert(&draft, &references).await,
        };

        match written {
            Ok(id) => {
                info!(%id, images = references.len(), uploaded = uploaded_count, "Property saved");
                Ok(id)
            }
            Err(err) => {
                if uploaded_count > 0 {
                    warn!(
                        error = %err,
                        orphaned = uploaded_count,
                        "Property write failed after uploading images"
                    );
                }
                Err(CommitError::Write(err))
            }
        }
    }

    /// Uploads every local item, returning URLs in staged order.
    async fn upload_pending(&self, items: &[StagedImage]) -> Result<Vec<String>, CommitError> {
        let pending: Vec<_> = items
            .iter()
            .enumerate()
            .filter_map(|(position, item)| match item {
                StagedImage::Local { file, .. } => Some((position, file.clone())),
                StagedImage::Remote { .. } => None,
            })
            .collect();

        let gateway = self.gateway.clone();
        let mut uploads = stream::iter(pending)
            .map(move |(position, file)| {
                let gateway = gateway.clone();
                async move {
                    gateway
                        .upload(&file)
                        .await
                        .map(|uploaded| uploaded.url)
                        .map_err(|err| (position, err))
                }
            })
            .buffered(self.settings.upload_concurrency.max(1));

        let mut urls = Vec::new();
        while let Some(result) = uploads.next().await {
            match result {
                Ok(url) => urls.push(url),
                Err((position, source)) => {
                    warn!(position, error = %source, "Commit aborted by a failed upload");
                    return Err(CommitError::Upload {
                        position,
                        source,
                        uploaded_before_failure: urls.len(),
                    });
                }
            }
        }
        Ok(urls)
    }
}

/// Walks `items` in order, keeping remote URLs and taking the next upload result for
/// each local item.
pub fn merge_references(
    items: &[StagedImage],
    uploaded: Vec<String>,
) -> Result<Vec<String>, CommitError> {
    let expected = items.iter().filter(|item| item.is_local()).count();
    if expected != uploaded.len() {
        return Err(CommitError::Merge {
            expected,
            got: uploaded.len(),
        });
    }

    let mut uploaded = uploaded.into_iter();
    Ok(items
        .iter()
        .filter_map(|item| match item {
            StagedImage::Remote { url, .. } => Some(url.clone()),
            StagedImage::Local { .. } => uploaded.next(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Session;
    use crate::blob_store::{BlobStore, StoreError};
    use crate::image_file::ImageFile;
    use crate::staged_images::{DataUrlPreviews, StagePolicy};
    use crate::testing::{
        sample_form, sample_record, session_valid_for, webp_file, MemoryBlobStore,
        MemoryPropertyStore, StaticSessions,
    };
    use crate::transcoder::ImageTranscoder;

    struct Fixture {
        blobs: Arc<MemoryBlobStore>,
        records: Arc<MemoryPropertyStore>,
        coordinator: CommitCoordinator,
        admin: StaticSessions,
    }

    impl Fixture {
        async fn commit(
            &self,
            id: Option<Uuid>,
            form: &PropertyForm,
            staged: &StagedImageSet,
        ) -> Result<Uuid, CommitError> {
            self.coordinator.commit(id, form, staged, &self.admin).await
        }
    }

    fn fixture_with(records: MemoryPropertyStore, admin: StaticSessions) -> Fixture {
        let blobs = Arc::new(MemoryBlobStore::new("property-images"));
        let records = Arc::new(records);
        let coordinator = CommitCoordinator::new(
            UploadGateway::new(blobs.clone()),
            records.clone(),
            CommitSettings::default(),
        );
        Fixture {
            blobs,
            records,
            coordinator,
            admin,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryPropertyStore::default(), StaticSessions::valid())
    }

    fn staged(urls: &[&str], files: Vec<ImageFile>) -> StagedImageSet {
        let mut set = StagedImageSet::with_existing(
            StagePolicy::default(),
            ImageTranscoder::default(),
            Arc::new(DataUrlPreviews),
            urls.iter().copied(),
        );
        set.add(files).unwrap();
        set
    }

    #[tokio::test]
    async fn remote_then_local_merges_in_order() {
        let f = fixture();
        let set = staged(&["u1"], vec![webp_file("f.webp")]);

        let id = f.commit(None, &sample_form(), &set).await.unwrap();

        let record = f.records.record(id).unwrap();
        assert_eq!(record.images.len(), 2);
        assert_eq!(record.images[0], "u1");
        let uploaded_name = f.blobs.names().pop().unwrap();
        assert_eq!(record.images[1], f.blobs.public_url(&uploaded_name));
    }

    #[tokio::test]
    async fn interleaved_items_keep_their_slots() {
        let f = fixture();
        let mut set = staged(&["u1"], vec![webp_file("a.webp")]);
        set.add_remote("u2").unwrap();
        set.add(vec![webp_file("b.webp"), webp_file("c.webp")]).unwrap();
        set.add_remote("u3").unwrap();

        let id = f.commit(None, &sample_form(), &set).await.unwrap();
        let images = f.records.record(id).unwrap().images;

        assert_eq!(images.len(), 6);
        assert_eq!(images[0], "u1");
        assert!(images[1].ends_with("-a.webp"));
        assert_eq!(images[2], "u2");
        assert!(images[3].ends_with("-b.webp"));
        assert!(images[4].ends_with("-c.webp"));
        assert_eq!(images[5], "u3");
    }

    #[tokio::test]
    async fn invalid_latitude_stops_before_any_upload() {
        let f = fixture();
        let set = staged(&[], vec![webp_file("f.webp")]);
        let mut form = sample_form();
        form.latitude = "200".into();

        let err = f.commit(None, &form, &set).await.unwrap_err();

        assert_eq!(err.stage(), Some(CommitStage::Validate));
        assert_eq!(f.blobs.upload_calls(), 0);
        assert_eq!(f.records.insert_calls(), 0);
    }

    #[tokio::test]
    async fn expired_session_that_cannot_refresh_aborts() {
        let f = fixture_with(
            MemoryPropertyStore::default(),
            StaticSessions::new(Some(session_valid_for(5))),
        );
        let set = staged(&[], vec![webp_file("f.webp")]);

        let err = f.commit(None, &sample_form(), &set).await.unwrap_err();

        assert_eq!(err.stage(), Some(CommitStage::Session));
        assert!(err.requires_reauthentication());
        assert_eq!(f.blobs.upload_calls(), 0);
    }

    #[tokio::test]
    async fn failed_upload_aborts_without_writing() {
        let f = fixture();
        f.blobs.fail_uploads_after(1, StoreError::Unauthorized);
        let set = staged(&[], vec![webp_file("a.webp"), webp_file("b.webp")]);

        let err = f.commit(None, &sample_form(), &set).await.unwrap_err();

        match &err {
            CommitError::Upload {
                position,
                uploaded_before_failure,
                ..
            } => {
                assert_eq!(*position, 1);
                assert_eq!(*uploaded_before_failure, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.requires_reauthentication());
        assert_eq!(f.records.insert_calls(), 0);
    }

    #[tokio::test]
    async fn update_overwrites_the_reference_list() {
        let existing = sample_record(&["u1", "u2", "u3"]);
        let id = existing.id;
        let f = fixture_with(
            MemoryPropertyStore::with_records(vec![existing]),
            StaticSessions::valid(),
        );

        let mut set = staged(&["u1", "u2", "u3"], vec![]);
        let second = set.items()[1].id();
        set.remove(second).unwrap();
        let last = set.items()[1].id();
        set.move_to(last, 0).unwrap();

        let mut form = sample_form();
        form.title = "Casa reciclada".into();
        let saved = f.commit(Some(id), &form, &set).await.unwrap();

        assert_eq!(saved, id);
        let record = f.records.record(id).unwrap();
        assert_eq!(record.images, vec!["u3", "u1"]);
        assert_eq!(record.draft.title, "Casa reciclada");
        assert_eq!(f.blobs.upload_calls(), 0);
    }

    #[tokio::test]
    async fn write_failure_is_reported_with_its_stage() {
        let f = fixture();
        f.records
            .fail_writes_with(RepoError::Unavailable("pool timed out".into()));
        let set = staged(&[], vec![webp_file("a.webp")]);

        let err = f.commit(None, &sample_form(), &set).await.unwrap_err();

        assert_eq!(err.stage(), Some(CommitStage::WriteRecord));
        // Uploaded but unreferenced; left for the reconciler.
        assert_eq!(f.blobs.names().len(), 1);
    }

    #[tokio::test]
    async fn expiring_admin_session_is_refreshed_before_uploading() {
        let f = fixture_with(
            MemoryPropertyStore::default(),
            StaticSessions::new(Some(session_valid_for(5))).refreshing_to(session_valid_for(3600)),
        );
        let set = staged(&[], vec![webp_file("f.webp")]);

        f.commit(None, &sample_form(), &set).await.unwrap();

        assert_eq!(f.admin.refresh_calls(), 1);
        assert_eq!(f.blobs.upload_calls(), 1);
    }

    /// Holds every caller in `current_session` until the gate opens.
    #[derive(Default)]
    struct GatedSessions {
        gate: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl SessionProvider for GatedSessions {
        async fn current_session(&self) -> Option<Session> {
            self.gate.notified().await;
            Some(session_valid_for(3600))
        }

        async fn refresh_session(&self) -> Result<Session, AuthError> {
            Err(AuthError::NoSession)
        }
    }

    #[tokio::test]
    async fn second_commit_is_refused_while_one_is_in_flight() {
        let f = fixture();
        let gated = GatedSessions::default();
        let form = sample_form();
        let set = staged(&[], vec![webp_file("a.webp")]);

        let first = f.coordinator.commit(None, &form, &set, &gated);
        tokio::pin!(first);
        assert!(futures::poll!(first.as_mut()).is_pending());

        let err = f.commit(None, &form, &set).await.unwrap_err();
        assert!(matches!(err, CommitError::AlreadyRunning));
        assert_eq!(err.stage(), None);
        assert_eq!(f.blobs.upload_calls(), 0);

        gated.gate.notify_one();
        let id = first.await.unwrap();
        assert!(f.records.record(id).is_some());

        // The guard is released once the first save finishes.
        f.commit(None, &form, &set).await.unwrap();
        assert_eq!(f.records.insert_calls(), 2);
    }

    #[test]
    fn in_flight_guard_resets_on_drop() {
        let flag = AtomicBool::new(false);
        let first = InFlight::acquire(&flag).unwrap();
        assert!(InFlight::acquire(&flag).is_none());
        drop(first);
        assert!(InFlight::acquire(&flag).is_some());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn commit_future_can_cross_threads() {
        let f = fixture();
        let form = sample_form();
        let set = staged(&["u1"], vec![webp_file("a.webp")]);

        let future = f.coordinator.commit(None, &form, &set, &f.admin);
        assert_send(&future);
    }

    #[test]
    fn merge_detects_missing_uploads() {
        let set = staged(&["u1"], vec![webp_file("a.webp")]);
        let err = merge_references(set.items(), vec![]).unwrap_err();
        assert!(matches!(err, CommitError::Merge { expected: 1, got: 0 }));
    }
}
