//! In-memory fakes and fixtures shared by the unit tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use image::{ImageBuffer, ImageFormat, Rgb};
use uuid::Uuid;

use crate::auth::{AuthError, Session, SessionProvider};
use crate::blob_store::{BlobPage, BlobStore, RemoveReport, StoreError};
use crate::image_file::ImageFile;
use crate::property::{PropertyDraft, PropertyForm, PropertyRecord};
use crate::property_repository::{PropertyStore, RepoError};
use crate::staged_images::PreviewAllocator;

fn gradient(width: u32, height: u32) -> ImageBuffer<Rgb<u8>, Vec<u8>> {
    ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x + y) % 256) as u8,
        ])
    })
}

fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    gradient(width, height).write_to(&mut out, format).unwrap();
    out.into_inner()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(width, height, ImageFormat::Png)
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(width, height, ImageFormat::Jpeg)
}

pub fn webp_bytes(width: u32, height: u32) -> Vec<u8> {
    let pixels = gradient(width, height);
    webp::Encoder::from_rgb(pixels.as_raw(), width, height)
        .encode(80.0)
        .to_vec()
}

pub fn webp_file(name: &str) -> ImageFile {
    ImageFile::new(name, "image/webp", webp_bytes(8, 8))
}

pub fn sample_form() -> PropertyForm {
    PropertyForm {
        title: "Casa con jardín".into(),
        description: "Tres dormitorios y jardín amplio.".into(),
        price: "250000".into(),
        currency: "usd".into(),
        operation: "sale".into(),
        property_type: "house".into(),
        bedrooms: "3".into(),
        bathrooms: "2".into(),
        address: "Av. Siempre Viva 742".into(),
        neighborhood: "Palermo".into(),
        city: "Buenos Aires".into(),
        province: "CABA".into(),
        country: "Argentina".into(),
        latitude: "-34.6".into(),
        longitude: "-58.4".into(),
        features: vec!["pool".into(), "garden".into()],
        ..PropertyForm::default()
    }
}

pub fn sample_draft() -> PropertyDraft {
    sample_form().validate().unwrap()
}

pub fn sample_record(images: &[&str]) -> PropertyRecord {
    PropertyRecord {
        id: Uuid::new_v4(),
        created_at: Utc::now(),
        draft: sample_draft(),
        images: images.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn session_valid_for(secs: i64) -> Session {
    Session {
        access_token: "access".into(),
        refresh_token: "refresh".into(),
        expires_at: Utc::now() + Duration::seconds(secs),
        user_email: Some("svc@example.com".into()),
    }
}

/// Counts allocations and records every release.
#[derive(Default)]
pub struct CountingPreviews {
    allocated: AtomicUsize,
    released: Mutex<Vec<String>>,
}

impl CountingPreviews {
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.lock().unwrap().len()
    }

    pub fn no_double_release(&self) -> bool {
        let released = self.released.lock().unwrap();
        let unique: HashSet<&String> = released.iter().collect();
        unique.len() == released.len()
    }
}

impl PreviewAllocator for CountingPreviews {
    fn allocate(&self, _file: &ImageFile) -> String {
        let n = self.allocated.fetch_add(1, Ordering::SeqCst);
        format!("preview:{n}")
    }

    fn release(&self, handle: &str) {
        self.released.lock().unwrap().push(handle.to_string());
    }
}

/// Bucket held in a sorted set. Failures are injected per call kind.
pub struct MemoryBlobStore {
    bucket: String,
    objects: Mutex<BTreeSet<String>>,
    page_size: usize,
    upload_failure: Mutex<Option<(usize, StoreError)>>,
    remove_failures: Mutex<HashMap<String, String>>,
    remove_error: Mutex<Option<StoreError>>,
    upload_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    removed_batches: Mutex<Vec<Vec<String>>>,
}

impl MemoryBlobStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: Mutex::new(BTreeSet::new()),
            page_size: 1000,
            upload_failure: Mutex::new(None),
            remove_failures: Mutex::new(HashMap::new()),
            remove_error: Mutex::new(None),
            upload_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            removed_batches: Mutex::new(Vec::new()),
        }
    }

    pub fn with_objects(bucket: &str, names: &[&str]) -> Self {
        let store = Self::new(bucket);
        for name in names {
            store.insert(name);
        }
        store
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn insert(&self, name: &str) {
        self.objects.lock().unwrap().insert(name.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.lock().unwrap().contains(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.lock().unwrap().iter().cloned().collect()
    }

    /// Every upload fails with `err`.
    pub fn fail_uploads_with(&self, err: StoreError) {
        self.fail_uploads_after(0, err);
    }

    /// The first `ok` uploads succeed, the rest fail with `err`.
    pub fn fail_uploads_after(&self, ok: usize, err: StoreError) {
        *self.upload_failure.lock().unwrap() = Some((ok, err));
    }

    /// `remove` reports `name` as failed instead of deleting it.
    pub fn fail_remove_of(&self, name: &str, reason: &str) {
        self.remove_failures
            .lock()
            .unwrap()
            .insert(name.to_string(), reason.to_string());
    }

    /// Whole `remove` calls fail with `err`.
    pub fn fail_removes_with(&self, err: StoreError) {
        *self.remove_error.lock().unwrap() = Some(err);
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn removed_batches(&self) -> Vec<Vec<String>> {
        self.removed_batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn public_url(&self, name: &str) -> String {
        format!(
            "https://cdn.test/storage/v1/object/public/{}/{}",
            self.bucket, name
        )
    }

    async fn upload(&self, name: &str, _content_type: &str, _body: Bytes) -> Result<(), StoreError> {
        let call = self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((ok, err)) = self.upload_failure.lock().unwrap().as_ref() {
            if call >= *ok {
                return Err(err.clone());
            }
        }
        self.insert(name);
        Ok(())
    }

    async fn list_page(&self, continuation: Option<String>) -> Result<BlobPage, StoreError> {
        let start: usize = continuation
            .as_deref()
            .map(|c| c.parse().map_err(|_| StoreError::Other("bad token".into())))
            .transpose()?
            .unwrap_or(0);
        let all = self.names();
        let end = (start + self.page_size).min(all.len());
        Ok(BlobPage {
            names: all[start.min(end)..end].to_vec(),
            next: (end < all.len()).then(|| end.to_string()),
        })
    }

    async fn remove(&self, names: &[String]) -> Result<RemoveReport, StoreError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.remove_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.removed_batches.lock().unwrap().push(names.to_vec());

        let failures = self.remove_failures.lock().unwrap();
        let mut objects = self.objects.lock().unwrap();
        let mut report = RemoveReport::default();
        for name in names {
            match failures.get(name) {
                Some(reason) => report.failed.push((name.clone(), reason.clone())),
                None => {
                    objects.remove(name);
                    report.deleted.push(name.clone());
                }
            }
        }
        Ok(report)
    }
}

/// Records in insertion order; `list` returns them newest first.
#[derive(Default)]
pub struct MemoryPropertyStore {
    records: Mutex<Vec<PropertyRecord>>,
    insert_calls: AtomicUsize,
    update_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    write_error: Mutex<Option<RepoError>>,
}

impl MemoryPropertyStore {
    pub fn with_records(records: Vec<PropertyRecord>) -> Self {
        let store = Self::default();
        *store.records.lock().unwrap() = records;
        store
    }

    pub fn record(&self, id: Uuid) -> Option<PropertyRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn fail_writes_with(&self, err: RepoError) {
        *self.write_error.lock().unwrap() = Some(err);
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn write_error(&self) -> Result<(), RepoError> {
        match self.write_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PropertyStore for MemoryPropertyStore {
    async fn list(&self) -> Result<Vec<PropertyRecord>, RepoError> {
        Ok(self.records.lock().unwrap().iter().rev().cloned().collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PropertyRecord>, RepoError> {
        Ok(self.record(id))
    }

    async fn insert(&self, draft: &PropertyDraft, images: &[String]) -> Result<Uuid, RepoError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.write_error()?;
        let id = Uuid::new_v4();
        self.records.lock().unwrap().push(PropertyRecord {
            id,
            created_at: Utc::now(),
            draft: draft.clone(),
            images: images.to_vec(),
        });
        Ok(id)
    }

    async fn update(
        &self,
        id: Uuid,
        draft: &PropertyDraft,
        images: &[String],
    ) -> Result<(), RepoError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.write_error()?;
        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(RepoError::NotFound(id))?;
        record.draft = draft.clone();
        record.images = images.to_vec();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.write_error()?;
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(RepoError::NotFound(id));
        }
        Ok(())
    }

    async fn image_references(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Vec<String>>, RepoError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|r| r.images.clone())
            .collect())
    }
}

/// A fixed session; refreshing succeeds only when a replacement was configured.
pub struct StaticSessions {
    session: Mutex<Option<Session>>,
    replacement: Option<Session>,
    refresh_calls: AtomicUsize,
}

impl StaticSessions {
    pub fn new(session: Option<Session>) -> Self {
        Self {
            session: Mutex::new(session),
            replacement: None,
            refresh_calls: AtomicUsize::new(0),
        }
    }

    pub fn valid() -> Self {
        Self::new(Some(session_valid_for(3600)))
    }

    #[must_use]
    pub fn refreshing_to(mut self, session: Session) -> Self {
        self.replacement = Some(session);
        self
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for StaticSessions {
    async fn current_session(&self) -> Option<Session> {
        self.session.lock().unwrap().clone()
    }

    async fn refresh_session(&self) -> Result<Session, AuthError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        match &self.replacement {
            Some(fresh) => {
                *self.session.lock().unwrap() = Some(fresh.clone());
                Ok(fresh.clone())
            }
            None => Err(AuthError::RefreshFailed("refresh token revoked".into())),
        }
    }
}
